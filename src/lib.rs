//! Concurrent datapoints fetch engine: validates and expands a batch of
//! per-series queries, chooses between an Eager and a Chunking fetch
//! strategy, drives a priority worker pool against a pluggable HTTP
//! client, and assembles ordered per-series results.

pub mod assemble;
pub mod client;
pub mod config;
pub mod error;
pub mod fetch;
pub mod limits;
pub mod model;
pub mod pool;
pub mod query;
pub mod strategy;
pub mod subtask;
pub mod task;

pub use client::{ClientError, DatapointsClient, ReqwestDatapointsClient};
pub use config::EngineConfig;
pub use error::{FetchError, Result};
pub use model::{
    Aggregate, AggregateDatapoint, DatapointValue, DatapointsResults, Identifier, RawDatapoint,
    SeriesPoints, SeriesResult,
};
pub use query::UserQuery;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use query::{validate_and_expand, SingleSeriesQuery};
use strategy::Strategy;
use task::PerSeriesTask;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Fetches datapoints for every identifier named across `queries`,
/// choosing Eager or Chunking scheduling based on how many series were
/// requested relative to `config.max_workers`, and returns one result
/// slot per expanded query in the user's original order.
pub async fn fetch_all_datapoints(
    queries: &[UserQuery],
    client: Arc<dyn DatapointsClient>,
    config: &EngineConfig,
) -> Result<DatapointsResults> {
    let expanded = validate_and_expand(queries, now_ms())?;
    let n_queries = expanded.all.len();

    if n_queries == 0 {
        return Ok(DatapointsResults(Vec::new()));
    }

    let tasks: HashMap<usize, PerSeriesTask> =
        match strategy::select_strategy(n_queries, config.max_workers) {
            Strategy::Eager => {
                let indexed: Vec<(usize, SingleSeriesQuery)> = expanded.all.into_iter().enumerate().collect();
                fetch::eager::run(indexed, config, client).await?
            }
            Strategy::Chunking => fetch::chunking::run(expanded, config, client).await?,
        };

    Ok(assemble::assemble(n_queries, tasks))
}
