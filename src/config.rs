//! Engine-level configuration: a plain, `Default`-able struct rather
//! than a builder macro, since the field count here is small.

use crate::limits::{DPS_LIMIT, DPS_LIMIT_AGG, FETCH_TS_LIMIT};

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of worker tasks in the priority pool. Must be >= 1.
    pub max_workers: usize,
    pub fetch_ts_limit: usize,
    pub dps_limit: u32,
    pub dps_limit_agg: u32,
    /// Chunking-mode backpressure gate: batch assembly pauses once the
    /// pool's pending count exceeds `max_workers * this factor`.
    pub pending_queue_backpressure_factor: usize,
}

impl EngineConfig {
    pub fn new(max_workers: usize) -> Self {
        EngineConfig {
            max_workers,
            ..Self::default()
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_workers: 1,
            fetch_ts_limit: FETCH_TS_LIMIT,
            dps_limit: DPS_LIMIT,
            dps_limit_agg: DPS_LIMIT_AGG,
            pending_queue_backpressure_factor: 2,
        }
    }
}
