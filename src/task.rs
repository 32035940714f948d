//! Per-series accumulation and completion state.
//!
//! The state machine is implemented as a single struct mutated
//! exclusively by the scheduler thread, so no locking is needed here;
//! only the [`crate::subtask::Subtask`] handles a worker can see are
//! behind a mutex.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use crate::model::{
    Aggregate, AggregateDatapoint, DatapointValue, RawDatapoint, ResponseItem, SeriesPoints,
    SeriesResult,
};
use crate::query::SingleSeriesQuery;
use crate::subtask::{Subtask, SubtaskFixedQuery};

/// Heuristic cap on how many children a single partial-response split
/// produces at once.
const MAX_SPLIT_CHILDREN: usize = 4;

enum Accumulator {
    Raw(BTreeMap<i64, Vec<RawDatapoint>>),
    Aggregate(BTreeMap<i64, Vec<AggregateDatapoint>>),
}

pub struct PerSeriesTask {
    pub query: SingleSeriesQuery,
    accumulator: Accumulator,
    n_dps_fetched: u32,
    pub subtasks: Vec<Subtask>,
    pub is_done: bool,
    pub is_missing: bool,
    is_step: bool,
    outside_before: Option<RawDatapoint>,
    outside_after: Option<RawDatapoint>,
}

impl PerSeriesTask {
    pub fn new(query: SingleSeriesQuery) -> Self {
        let accumulator = if query.is_raw_query {
            Accumulator::Raw(BTreeMap::new())
        } else {
            Accumulator::Aggregate(BTreeMap::new())
        };
        PerSeriesTask {
            query,
            accumulator,
            n_dps_fetched: 0,
            subtasks: Vec::new(),
            is_done: false,
            is_missing: false,
            is_step: false,
            outside_before: None,
            outside_after: None,
        }
    }

    pub fn fixed_query(&self) -> SubtaskFixedQuery {
        SubtaskFixedQuery {
            identifier: self.query.identifier.clone(),
            aggregates: self.query.aggregates.clone(),
            granularity: self.query.granularity.clone(),
        }
    }

    fn has_limit(&self) -> bool {
        self.query.user_limit.is_some()
    }

    fn remaining_limit(&self) -> u32 {
        match self.query.user_limit {
            Some(l) => l.saturating_sub(self.n_dps_fetched),
            None => u32::MAX,
        }
    }

    fn request_cap(&self) -> u32 {
        if self.query.is_raw_query {
            crate::limits::DPS_LIMIT
        } else {
            crate::limits::DPS_LIMIT_AGG
        }
    }

    /// Zero-limit queries are done immediately with an empty result:
    /// `limit = 0` is valid input, not an error.
    pub fn is_zero_limit(&self) -> bool {
        self.query.user_limit == Some(0)
    }

    /// Splits the task's full range into 1..=4 contiguous subtasks. More
    /// subtasks are handed out when worker capacity is generous relative
    /// to the number of queries in flight.
    pub fn split_into_subtasks(
        &mut self,
        max_workers: usize,
        n_tot_queries: usize,
        base_priority: i64,
    ) -> Vec<Subtask> {
        if self.is_zero_limit() {
            self.is_done = true;
            return Vec::new();
        }

        // A finite limit must be satisfied by the first L points in time
        // order, so a limited query gets exactly one subtask walking its
        // range left to right rather than several children each racing
        // with the full remaining limit over disjoint windows.
        let n_subtasks = if self.has_limit() {
            1
        } else {
            let capacity_per_query = max_workers as f64 / n_tot_queries.max(1) as f64;
            (capacity_per_query.floor() as usize).clamp(1, MAX_SPLIT_CHILDREN)
        };

        let start = self.query.start;
        let end = self.query.end;
        let span = (end - start).max(1);
        let step = (span / n_subtasks as i64).max(1);

        let per_subtask_limit = self.remaining_limit().min(self.request_cap());

        let mut subtasks = Vec::with_capacity(n_subtasks);
        let mut cur = start;
        for i in 0..n_subtasks {
            let sub_end = if i + 1 == n_subtasks { end } else { (cur + step).min(end) };
            let sub = Subtask::new(
                cur,
                sub_end,
                base_priority + i as i64,
                per_subtask_limit,
                self.query.is_raw_query,
                i == 0,
                i + 1 == n_subtasks,
            );
            subtasks.push(sub);
            cur = sub_end;
            if cur >= end {
                break;
            }
        }

        self.subtasks = subtasks.clone();
        subtasks
    }

    /// Absorbs one server page for `subtask`. `item` is `None` when the
    /// identifier did not appear in the response at all — the
    /// unambiguous "unknown to the server" signal (an existing series
    /// always gets an item entry back, even with zero datapoints for an
    /// empty window). Returns any new subtasks spawned to cover an
    /// uncovered tail.
    pub fn store_partial_result(
        &mut self,
        subtask: &Subtask,
        item: Option<&ResponseItem>,
        priority_seq: &AtomicI64,
    ) -> Vec<Subtask> {
        let Some(item) = item else {
            self.is_missing = true;
            subtask.mark_done();
            self.cancel_other_subtasks(subtask);
            self.recompute_done();
            return Vec::new();
        };

        self.query.is_string = item.is_string;
        self.is_step = item.is_step;

        let requested_limit = subtask.max_query_limit();
        let sub_start = subtask.sub_start();
        let sub_end = subtask.sub_end();

        let (in_range_count, last_ts) = self.merge_page(item, sub_start, self.query.end);

        self.n_dps_fetched = self.n_dps_fetched.saturating_add(in_range_count as u32);

        if self.has_limit() && self.n_dps_fetched >= self.query.user_limit.unwrap() {
            subtask.mark_done();
            self.cancel_other_subtasks(subtask);
            self.recompute_done();
            return Vec::new();
        }

        let page_filled = in_range_count as u32 >= requested_limit && requested_limit > 0;
        let reached_end = match last_ts {
            Some(ts) => ts + 1 >= sub_end,
            None => true,
        };

        if !page_filled || reached_end {
            subtask.mark_done();
            self.recompute_done();
            return Vec::new();
        }

        subtask.mark_done();
        let new_start = last_ts.map(|t| t + 1).unwrap_or(sub_start);
        let children = self.split_tail(subtask, new_start, sub_end, in_range_count, priority_seq);
        self.subtasks.retain(|s| s.id != subtask.id);
        self.subtasks.extend(children.iter().cloned());
        self.recompute_done();
        children
    }

    fn split_tail(
        &mut self,
        parent: &Subtask,
        new_start: i64,
        sub_end: i64,
        last_page_count: usize,
        priority_seq: &AtomicI64,
    ) -> Vec<Subtask> {
        let remaining_range = (sub_end - new_start).max(0);
        if remaining_range == 0 {
            return Vec::new();
        }

        let remaining_limit = self.remaining_limit().min(self.request_cap());
        if remaining_limit == 0 {
            return Vec::new();
        }

        // Same left-to-right constraint as the initial split: a limited
        // query keeps exactly one subtask in flight so the surviving
        // points are always the first L in time order.
        let n_children = if self.has_limit() {
            1
        } else {
            // Density estimate: points-per-ms on the last page, projected
            // across the uncovered tail.
            let covered = (new_start - parent.sub_start()).max(1);
            let density = last_page_count as f64 / covered as f64;
            let estimated_remaining = (density * remaining_range as f64).max(1.0);
            ((estimated_remaining / last_page_count.max(1) as f64).ceil() as usize)
                .clamp(1, MAX_SPLIT_CHILDREN)
        };

        let step = (remaining_range / n_children as i64).max(1);
        let mut children = Vec::with_capacity(n_children);
        let mut cur = new_start;
        for i in 0..n_children {
            let child_end = if i + 1 == n_children {
                sub_end
            } else {
                (cur + step).min(sub_end)
            };
            let nudge = priority_seq.fetch_add(1, Ordering::Relaxed);
            let child = parent.split_tail(cur, child_end, remaining_limit, nudge);
            children.push(child);
            cur = child_end;
            if cur >= sub_end {
                break;
            }
        }
        children
    }

    fn cancel_other_subtasks(&mut self, keep: &Subtask) {
        for s in &self.subtasks {
            if s.id != keep.id {
                s.mark_done();
            }
        }
    }

    pub fn recompute_done(&mut self) {
        if self.is_done {
            return;
        }
        if self.is_missing {
            self.is_done = true;
            return;
        }
        self.is_done = self.subtasks.iter().all(|s| s.is_done());
    }

    /// Merges one response page into the accumulator, discarding any
    /// overlap with previously stored data and tracking the leading /
    /// trailing outside points separately.
    fn merge_page(&mut self, item: &ResponseItem, sub_start: i64, task_end: i64) -> (usize, Option<i64>) {
        let is_raw = self.query.is_raw_query;
        let include_outside = self.query.include_outside_points;
        let task_start = self.query.start;

        let mut in_range_count = 0usize;
        let mut last_ts = None;

        if is_raw {
            let mut raw_points = Vec::with_capacity(item.datapoints.len());
            for dp in &item.datapoints {
                let value = dp
                    .fields
                    .get("value")
                    .map(|v| {
                        if let Some(s) = v.as_str() {
                            DatapointValue::String(s.to_string())
                        } else {
                            DatapointValue::Numeric(v.as_f64().unwrap_or(f64::NAN))
                        }
                    })
                    .unwrap_or(DatapointValue::Numeric(f64::NAN));
                raw_points.push(RawDatapoint {
                    timestamp: dp.timestamp,
                    value,
                });
            }

            if include_outside {
                if let Some(first) = raw_points.first() {
                    if first.timestamp < task_start {
                        self.outside_before = Some(first.clone());
                        raw_points.remove(0);
                    }
                }
                if let Some(last) = raw_points.last() {
                    if last.timestamp >= task_end {
                        self.outside_after = Some(last.clone());
                        raw_points.pop();
                    }
                }
            }

            let filtered: Vec<RawDatapoint> = raw_points
                .into_iter()
                .filter(|p| p.timestamp >= sub_start && p.timestamp < task_end)
                .collect();
            in_range_count = filtered.len();
            last_ts = filtered.last().map(|p| p.timestamp);

            if let Accumulator::Raw(map) = &mut self.accumulator {
                if !filtered.is_empty() {
                    map.insert(sub_start, filtered);
                }
            }
        } else {
            let aggregates = self.query.aggregates.clone().unwrap_or_default();
            let mut agg_points = Vec::with_capacity(item.datapoints.len());
            for dp in &item.datapoints {
                let values: Vec<f64> = aggregates
                    .iter()
                    .map(|agg| {
                        dp.fields
                            .get(&aggregate_field_name(*agg))
                            .and_then(|v| v.as_f64())
                            .unwrap_or(f64::NAN)
                    })
                    .collect();
                agg_points.push(AggregateDatapoint {
                    timestamp: dp.timestamp,
                    values,
                });
            }
            let filtered: Vec<AggregateDatapoint> = agg_points
                .into_iter()
                .filter(|p| p.timestamp >= sub_start && p.timestamp < task_end)
                .collect();
            in_range_count = filtered.len();
            last_ts = filtered.last().map(|p| p.timestamp);

            if let Accumulator::Aggregate(map) = &mut self.accumulator {
                if !filtered.is_empty() {
                    map.insert(sub_start, filtered);
                }
            }
        }

        (in_range_count, last_ts)
    }

    /// Materializes the final ordered array for this series, truncated
    /// to the user's limit as a defensive backstop against any
    /// off-by-one in the fetch loop above.
    pub fn into_result(self) -> SeriesResult {
        let identifier = self.query.identifier.clone();
        let is_string = self.query.is_string;
        let is_step = self.is_step;
        let limit = self.query.user_limit.unwrap_or(u32::MAX) as usize;

        let points = match self.accumulator {
            Accumulator::Raw(map) => {
                let mut outside_count = 0usize;
                let mut all: Vec<RawDatapoint> = Vec::new();
                if let Some(before) = self.outside_before {
                    outside_count += 1;
                    all.push(before);
                }
                for (_, chunk) in map {
                    all.extend(chunk);
                }
                if let Some(after) = self.outside_after {
                    outside_count += 1;
                    all.push(after);
                }
                let backstop = if self.query.include_outside_points {
                    limit.saturating_add(outside_count)
                } else {
                    limit
                };
                all.truncate(backstop);
                SeriesPoints::Raw(all)
            }
            Accumulator::Aggregate(map) => {
                let mut all: Vec<AggregateDatapoint> = Vec::new();
                for (_, chunk) in map {
                    all.extend(chunk);
                }
                all.truncate(limit);
                SeriesPoints::Aggregate(all)
            }
        };

        SeriesResult {
            identifier,
            is_string,
            is_step,
            points,
        }
    }
}

fn aggregate_field_name(agg: Aggregate) -> String {
    match agg {
        Aggregate::Average => "average",
        Aggregate::Max => "max",
        Aggregate::Min => "min",
        Aggregate::Count => "count",
        Aggregate::Sum => "sum",
        Aggregate::Interpolation => "interpolation",
        Aggregate::StepInterpolation => "stepInterpolation",
        Aggregate::ContinuousVariance => "continuousVariance",
        Aggregate::DiscreteVariance => "discreteVariance",
        Aggregate::TotalVariation => "totalVariation",
    }
    .to_string()
}
