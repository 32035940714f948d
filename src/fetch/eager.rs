//! The Eager fetcher: one subtask per request, used when `n_queries <=
//! max_workers` so every series can afford its own concurrent subtasks.

use std::collections::HashMap;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::client::DatapointsClient;
use crate::config::EngineConfig;
use crate::error::{FetchError, Result};
use crate::fetch::{single_subtask_job, Completion};
use crate::pool::PriorityWorkerPool;
use crate::query::SingleSeriesQuery;
use crate::task::PerSeriesTask;

fn all_done(tasks: &HashMap<usize, PerSeriesTask>) -> bool {
    tasks.values().all(|t| t.is_done)
}

#[tracing::instrument(skip_all, fields(n_queries = queries.len(), max_workers = config.max_workers))]
pub async fn run(
    queries: Vec<(usize, SingleSeriesQuery)>,
    config: &EngineConfig,
    client: Arc<dyn DatapointsClient>,
) -> Result<HashMap<usize, PerSeriesTask>> {
    let n_queries = queries.len();
    let pool = PriorityWorkerPool::new(config.max_workers);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let priority_seq = AtomicI64::new(0);

    let mut tasks: HashMap<usize, PerSeriesTask> = HashMap::with_capacity(queries.len());
    for (idx, query) in queries {
        let ignore_unknown_ids = query.ignore_unknown_ids;
        let mut task = PerSeriesTask::new(query);
        let base_priority = (idx as i64) * 16;
        let subtasks = task.split_into_subtasks(config.max_workers, n_queries, base_priority);
        for sub in subtasks {
            tracing::debug!(task_idx = idx, priority = sub.priority, "dispatching initial subtask");
            pool.submit(
                sub.priority,
                single_subtask_job(
                    idx,
                    sub,
                    task.fixed_query(),
                    ignore_unknown_ids,
                    client.clone(),
                    tx.clone(),
                ),
            );
        }
        tasks.insert(idx, task);
    }

    if all_done(&tasks) {
        pool.shutdown();
        return Ok(tasks);
    }

    let mut fatal: Option<FetchError> = None;
    while let Some(completion) = rx.recv().await {
        match completion {
            Completion::Fatal(err) => {
                fatal = Some(err);
                break;
            }
            Completion::Item {
                task_idx,
                subtask,
                item,
            } => {
                let task = match tasks.get_mut(&task_idx) {
                    Some(t) => t,
                    None => continue,
                };
                if task.is_done {
                    // Stale completion for a subtask that was in flight
                    // when its task finished; the subtask already
                    // carries `is_done` so nothing further to do.
                    continue;
                }

                let priority_before_limit = task.query.ignore_unknown_ids;
                let new_subtasks = task.store_partial_result(&subtask, item.as_ref(), &priority_seq);
                if task.is_missing && priority_before_limit {
                    tracing::warn!(task_idx, "tolerated missing identifier");
                }

                let ignore_unknown_ids = task.query.ignore_unknown_ids;
                let fixed_query = task.fixed_query();
                for new_sub in new_subtasks {
                    tracing::debug!(task_idx, priority = new_sub.priority, "dispatching split subtask");
                    pool.submit(
                        new_sub.priority,
                        single_subtask_job(
                            task_idx,
                            new_sub,
                            fixed_query.clone(),
                            ignore_unknown_ids,
                            client.clone(),
                            tx.clone(),
                        ),
                    );
                }

                if task.is_missing && !ignore_unknown_ids {
                    fatal = Some(FetchError::NotFound(vec![task.query.identifier.as_display()]));
                    break;
                }

                if all_done(&tasks) {
                    break;
                }
            }
        }
    }

    pool.shutdown();

    if let Some(err) = fatal {
        tracing::error!(error = %err, "eager fetch aborted");
        return Err(err);
    }

    Ok(tasks)
}
