//! The Chunking fetcher: used once there are more series than worker
//! capacity, so individual per-series requests would blow past the
//! server's per-request item cap. Two phases — a handful of coarse
//! discovery batches establish which identifiers exist and seed each
//! with a first page, then a priority-heap drain assembles the
//! remaining work into as-full-as-possible combined batches.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::client::{ClientError, DatapointsClient};
use crate::config::EngineConfig;
use crate::error::{FetchError, Result};
use crate::fetch::{Completion, CompletionSender};
use crate::limits::{distribute_limits, DPS_LIMIT, DPS_LIMIT_AGG, FETCH_TS_LIMIT};
use crate::model::{Identifier, ListRequest, ListResponse, RequestItem};
use crate::pool::{Job, PriorityWorkerPool};
use crate::query::{ExpandedQueries, SingleSeriesQuery};
use crate::subtask::{Subtask, SubtaskFixedQuery};
use crate::task::PerSeriesTask;

fn chunk_count(n: usize, max_workers: usize) -> usize {
    if n == 0 {
        return 0;
    }
    let by_item_cap = ceil_div(n, FETCH_TS_LIMIT);
    max_workers.max(by_item_cap).max(1).min(n)
}

fn ceil_div(n: usize, d: usize) -> usize {
    (n + d - 1) / d
}

fn partition_into_chunks(indices: &[usize], n_chunks: usize) -> Vec<Vec<usize>> {
    if n_chunks == 0 || indices.is_empty() {
        return Vec::new();
    }
    let mut chunks: Vec<Vec<usize>> = vec![Vec::new(); n_chunks];
    for (i, &idx) in indices.iter().enumerate() {
        chunks[i % n_chunks].push(idx);
    }
    chunks.retain(|c| !c.is_empty());
    chunks
}

fn all_done(tasks: &HashMap<usize, PerSeriesTask>) -> bool {
    tasks.values().all(|t| t.is_done)
}

struct DiscoveryOutcome {
    indices: Vec<usize>,
    limits: Vec<u32>,
    result: std::result::Result<ListResponse, ClientError>,
}

fn discovery_job(
    indices: Vec<usize>,
    limits: Vec<u32>,
    request: ListRequest,
    client: Arc<dyn DatapointsClient>,
    tx: mpsc::UnboundedSender<DiscoveryOutcome>,
) -> Job {
    Box::pin(async move {
        let result = client.list(&request).await;
        let _ = tx.send(DiscoveryOutcome {
            indices,
            limits,
            result,
        });
    })
}

/// Issues one or more discovery batches at priority 0 (so they run ahead
/// of anything queued by the drain phase), `ignoreUnknownIds=true`, each
/// item's initial limit set via [`distribute_limits`]. Creates a
/// [`PerSeriesTask`] per identifier the server actually returned and
/// seeds it with that first page.
async fn discover(
    indices: &[usize],
    all: &[SingleSeriesQuery],
    max_limit: u32,
    config: &EngineConfig,
    pool: &PriorityWorkerPool,
    client: &Arc<dyn DatapointsClient>,
) -> Result<(HashMap<usize, PerSeriesTask>, Vec<String>)> {
    if indices.is_empty() {
        return Ok((HashMap::new(), Vec::new()));
    }

    let n_chunks = chunk_count(indices.len(), config.max_workers);
    let chunks = partition_into_chunks(indices, n_chunks);

    let (tx, mut rx) = mpsc::unbounded_channel();
    for chunk in chunks {
        let caps: Vec<u32> = chunk.iter().map(|&i| all[i].capped_limit).collect();
        let limits = distribute_limits(&caps, max_limit);
        let items = chunk
            .iter()
            .zip(&limits)
            .map(|(&i, &limit)| {
                let q = &all[i];
                let mut item = RequestItem::for_identifier(&q.identifier, q.start, q.end, limit.max(1));
                item.aggregates = q.aggregates.clone();
                item.granularity = q.granularity.clone();
                item
            })
            .collect();
        let request = ListRequest {
            ignore_unknown_ids: true,
            items,
        };
        tracing::debug!(chunk_size = chunk.len(), "dispatching discovery batch");
        pool.submit(0, discovery_job(chunk, limits, request, client.clone(), tx.clone()));
    }
    drop(tx);

    let mut tasks = HashMap::new();
    let mut hard_missing = Vec::new();
    let split_seq = AtomicI64::new(1);

    while let Some(outcome) = rx.recv().await {
        let response = match outcome.result {
            Ok(r) => r,
            Err(ClientError::MissingIdentifiers(ids)) => {
                hard_missing.extend(ids);
                continue;
            }
            Err(other) => {
                pool.shutdown();
                return Err(other.into());
            }
        };

        for (&idx, &limit) in outcome.indices.iter().zip(&outcome.limits) {
            let query = &all[idx];
            match response
                .items
                .iter()
                .find(|it| it.identifier() == query.identifier)
            {
                None => {
                    if !query.ignore_unknown_ids {
                        hard_missing.push(query.identifier.as_display());
                    }
                }
                Some(item) => {
                    let mut task = PerSeriesTask::new(query.clone());
                    let seed = Subtask::new(
                        query.start,
                        query.end,
                        0,
                        limit.max(1),
                        query.is_raw_query,
                        true,
                        true,
                    );
                    task.store_partial_result(&seed, Some(item), &split_seq);
                    tasks.insert(idx, task);
                }
            }
        }
    }

    Ok((tasks, hard_missing))
}

fn recompute_caps(tasks: &mut HashMap<usize, PerSeriesTask>, config: &EngineConfig) {
    let n_raw_unfinished = tasks
        .values()
        .filter(|t| !t.is_done && t.query.is_raw_query)
        .count();
    let n_agg_unfinished = tasks
        .values()
        .filter(|t| !t.is_done && !t.query.is_raw_query)
        .count();

    let n_raw_chunk = ceil_div(n_raw_unfinished.max(1), 10).min(config.fetch_ts_limit).max(1);
    let n_agg_chunk = ceil_div(n_agg_unfinished.max(1), 10).min(config.fetch_ts_limit).max(1);

    let raw_cap = (config.dps_limit / n_raw_chunk as u32).max(1);
    let agg_cap = (config.dps_limit_agg / n_agg_chunk as u32).max(1);

    for task in tasks.values_mut() {
        if task.is_done {
            continue;
        }
        let cap = if task.query.is_raw_query { raw_cap } else { agg_cap };
        for sub in &task.subtasks {
            sub.set_max_query_limit(sub.max_query_limit().min(cap));
        }
    }
}

struct ChunkHeapEntry {
    priority: i64,
    request_limit: u32,
    tiebreak: i64,
    task_idx: usize,
    subtask: Subtask,
}

impl PartialEq for ChunkHeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.tiebreak == other.tiebreak
    }
}
impl Eq for ChunkHeapEntry {}

impl PartialOrd for ChunkHeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for ChunkHeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.request_limit.cmp(&self.request_limit))
            .then_with(|| other.tiebreak.cmp(&self.tiebreak))
    }
}

fn push_subtask(
    raw_heap: &mut BinaryHeap<ChunkHeapEntry>,
    agg_heap: &mut BinaryHeap<ChunkHeapEntry>,
    task_idx: usize,
    subtask: Subtask,
    is_raw: bool,
    tiebreak: &AtomicI64,
) {
    let entry = ChunkHeapEntry {
        priority: subtask.priority,
        request_limit: subtask.max_query_limit(),
        tiebreak: tiebreak.fetch_add(1, Ordering::Relaxed),
        task_idx,
        subtask,
    };
    if is_raw {
        raw_heap.push(entry);
    } else {
        agg_heap.push(entry);
    }
}

struct ChunkBatch {
    entries: Vec<ChunkHeapEntry>,
}

impl ChunkBatch {
    fn mean_priority(&self) -> i64 {
        let sum: i64 = self.entries.iter().map(|e| e.priority).sum();
        sum / self.entries.len() as i64
    }
}

/// Pops from the two heaps, always preferring whichever live head has
/// the lower `(priority, tiebreak)`, until either independent cap is hit
/// or the item-count cap is hit. Stale (already-done) entries are
/// dropped silently rather than carried into the batch.
fn build_combined_batch(
    raw_heap: &mut BinaryHeap<ChunkHeapEntry>,
    agg_heap: &mut BinaryHeap<ChunkHeapEntry>,
) -> Option<ChunkBatch> {
    let mut entries = Vec::new();
    let mut raw_total = 0u32;
    let mut agg_total = 0u32;

    loop {
        if entries.len() >= FETCH_TS_LIMIT {
            break;
        }
        let raw_ok = raw_heap
            .peek()
            .map_or(false, |e| raw_total + e.request_limit <= DPS_LIMIT);
        let agg_ok = agg_heap
            .peek()
            .map_or(false, |e| agg_total + e.request_limit <= DPS_LIMIT_AGG);
        if !raw_ok && !agg_ok {
            break;
        }
        let take_raw = if raw_ok && agg_ok {
            let r = raw_heap.peek().unwrap();
            let a = agg_heap.peek().unwrap();
            (r.priority, r.tiebreak) <= (a.priority, a.tiebreak)
        } else {
            raw_ok
        };
        let entry = if take_raw { raw_heap.pop() } else { agg_heap.pop() }.unwrap();
        if entry.subtask.is_done() {
            continue;
        }
        if take_raw {
            raw_total += entry.request_limit;
        } else {
            agg_total += entry.request_limit;
        }
        entries.push(entry);
    }

    if entries.is_empty() {
        None
    } else {
        Some(ChunkBatch { entries })
    }
}

fn chunk_batch_job(
    entries: Vec<ChunkHeapEntry>,
    fixed_queries: Arc<HashMap<usize, SubtaskFixedQuery>>,
    identifiers: Arc<HashMap<usize, Identifier>>,
    client: Arc<dyn DatapointsClient>,
    tx: CompletionSender,
) -> Job {
    Box::pin(async move {
        let mut items = Vec::with_capacity(entries.len());
        let mut kept = Vec::with_capacity(entries.len());
        for entry in entries {
            let Some(fq) = fixed_queries.get(&entry.task_idx) else {
                continue;
            };
            let Some(payload) = entry.subtask.get_next_payload(fq) else {
                continue;
            };
            items.push(payload);
            let identifier = identifiers
                .get(&entry.task_idx)
                .cloned()
                .unwrap_or_else(|| Identifier::ExternalId(String::new()));
            kept.push((entry.task_idx, entry.subtask, identifier));
        }
        if items.is_empty() {
            return;
        }
        let request = ListRequest {
            ignore_unknown_ids: true,
            items,
        };
        match client.list(&request).await {
            Ok(response) => {
                for (task_idx, subtask, identifier) in kept {
                    let item = response
                        .items
                        .iter()
                        .find(|it| it.identifier() == identifier)
                        .cloned();
                    let _ = tx.send(Completion::Item {
                        task_idx,
                        subtask,
                        item,
                    });
                }
            }
            Err(ClientError::MissingIdentifiers(ids)) => {
                let _ = tx.send(Completion::Fatal(FetchError::NotFound(ids)));
            }
            Err(other) => {
                let _ = tx.send(Completion::Fatal(other.into()));
            }
        }
    })
}

async fn drain_remaining(
    mut tasks: HashMap<usize, PerSeriesTask>,
    config: &EngineConfig,
    pool: &PriorityWorkerPool,
    client: Arc<dyn DatapointsClient>,
) -> Result<HashMap<usize, PerSeriesTask>> {
    recompute_caps(&mut tasks, config);

    let fixed_queries: Arc<HashMap<usize, SubtaskFixedQuery>> =
        Arc::new(tasks.iter().map(|(&i, t)| (i, t.fixed_query())).collect());
    let identifiers: Arc<HashMap<usize, Identifier>> = Arc::new(
        tasks
            .iter()
            .map(|(&i, t)| (i, t.query.identifier.clone()))
            .collect(),
    );

    let mut raw_heap: BinaryHeap<ChunkHeapEntry> = BinaryHeap::new();
    let mut agg_heap: BinaryHeap<ChunkHeapEntry> = BinaryHeap::new();
    let tiebreak = AtomicI64::new(0);

    for (&idx, task) in tasks.iter() {
        if task.is_done {
            continue;
        }
        for sub in &task.subtasks {
            if sub.is_done() {
                continue;
            }
            push_subtask(&mut raw_heap, &mut agg_heap, idx, sub.clone(), task.query.is_raw_query, &tiebreak);
        }
    }

    let (tx, mut rx) = mpsc::unbounded_channel();
    let backpressure_limit = config.max_workers * config.pending_queue_backpressure_factor;
    let mut outstanding = 0usize;

    loop {
        while pool.pending_count() < backpressure_limit {
            let Some(batch) = build_combined_batch(&mut raw_heap, &mut agg_heap) else {
                break;
            };
            let priority = batch.mean_priority();
            tracing::debug!(items = batch.entries.len(), priority, "dispatching combined batch");
            pool.submit(
                priority,
                chunk_batch_job(
                    batch.entries,
                    fixed_queries.clone(),
                    identifiers.clone(),
                    client.clone(),
                    tx.clone(),
                ),
            );
            outstanding += 1;
        }

        if all_done(&tasks) {
            break;
        }

        if pool.pending_count() >= backpressure_limit {
            tracing::warn!(pending = pool.pending_count(), "chunking drain gated by backpressure");
        }

        if outstanding == 0 {
            break;
        }

        match rx.recv().await {
            Some(Completion::Fatal(err)) => {
                pool.shutdown();
                tracing::error!(error = %err, "chunking fetch aborted");
                return Err(err);
            }
            Some(Completion::Item {
                task_idx,
                subtask,
                item,
            }) => {
                outstanding -= 1;
                let Some(task) = tasks.get_mut(&task_idx) else {
                    continue;
                };
                if task.is_done {
                    continue;
                }
                let children = task.store_partial_result(&subtask, item.as_ref(), &tiebreak);
                if task.is_missing && !task.query.ignore_unknown_ids {
                    let id = task.query.identifier.as_display();
                    pool.shutdown();
                    return Err(FetchError::NotFound(vec![id]));
                }
                let is_raw = task.query.is_raw_query;
                for child in children {
                    push_subtask(&mut raw_heap, &mut agg_heap, task_idx, child, is_raw, &tiebreak);
                }
            }
            None => break,
        }
    }

    pool.shutdown();
    Ok(tasks)
}

#[tracing::instrument(skip_all, fields(n_queries = expanded.all.len(), max_workers = config.max_workers))]
pub async fn run(
    expanded: ExpandedQueries,
    config: &EngineConfig,
    client: Arc<dyn DatapointsClient>,
) -> Result<HashMap<usize, PerSeriesTask>> {
    let ExpandedQueries {
        all,
        raw_only,
        aggregate_only,
    } = expanded;

    let mut tasks: HashMap<usize, PerSeriesTask> = HashMap::new();
    let mut live_raw = Vec::new();
    let mut live_agg = Vec::new();

    for &i in &raw_only {
        if all[i].user_limit == Some(0) {
            let mut t = PerSeriesTask::new(all[i].clone());
            t.is_done = true;
            tasks.insert(i, t);
        } else {
            live_raw.push(i);
        }
    }
    for &i in &aggregate_only {
        if all[i].user_limit == Some(0) {
            let mut t = PerSeriesTask::new(all[i].clone());
            t.is_done = true;
            tasks.insert(i, t);
        } else {
            live_agg.push(i);
        }
    }

    let pool = PriorityWorkerPool::new(config.max_workers);

    let (raw_tasks, raw_missing) = discover(&live_raw, &all, config.dps_limit, config, &pool, &client).await?;
    let (agg_tasks, agg_missing) =
        discover(&live_agg, &all, config.dps_limit_agg, config, &pool, &client).await?;

    let mut hard_missing = raw_missing;
    hard_missing.extend(agg_missing);
    if !hard_missing.is_empty() {
        pool.shutdown();
        return Err(FetchError::NotFound(hard_missing));
    }

    tasks.extend(raw_tasks);
    tasks.extend(agg_tasks);

    if all_done(&tasks) {
        pool.shutdown();
        return Ok(tasks);
    }

    drain_remaining(tasks, config, &pool, client).await
}
