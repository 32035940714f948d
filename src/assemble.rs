//! Result assembly: materializes finished per-series tasks into the
//! output array, in the user's original request order.

use std::collections::HashMap;

use crate::model::DatapointsResults;
use crate::task::PerSeriesTask;

/// Consumes the finished tasks (keyed by their position in `all`) and
/// produces one output slot per query in `all`'s order. A query whose
/// task is absent (tolerated missing) becomes `None`.
pub fn assemble(n_queries: usize, mut tasks: HashMap<usize, PerSeriesTask>) -> DatapointsResults {
    let mut results = Vec::with_capacity(n_queries);
    for idx in 0..n_queries {
        let slot = tasks.remove(&idx).and_then(|task| {
            if task.is_missing {
                None
            } else {
                Some(task.into_result())
            }
        });
        results.push(slot);
    }
    DatapointsResults(results)
}
