//! A contiguous time sub-range of a [`crate::task::PerSeriesTask`].
//!
//! Mutable state lives behind a `parking_lot::Mutex` inside a
//! cheaply-clonable handle, so a worker thread can read it at dispatch
//! time without the scheduler handing out an owning reference. The
//! just-in-time payload contract depends on exactly this: the handle a
//! worker holds must reflect whatever the scheduler did to it *after*
//! submission.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::model::{Identifier, RequestItem};

static NEXT_SUBTASK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone)]
struct SubtaskState {
    sub_start: i64,
    sub_end: i64,
    max_query_limit: u32,
    is_done: bool,
    include_outside_left: bool,
    include_outside_right: bool,
}

/// A cheaply-clonable handle to one subtask's mutable state.
///
/// Priority is immutable after creation (splits adopt the parent's
/// priority with a tie-break nudge) so it lives outside the mutex and
/// can be read without locking from the pool's heap.
#[derive(Debug, Clone)]
pub struct Subtask {
    pub id: u64,
    pub priority: i64,
    pub is_raw_query: bool,
    state: Arc<Mutex<SubtaskState>>,
}

/// Everything a subtask needs that never changes across its lifetime —
/// captured once at submission time, not re-read at dequeue time, since
/// only the range/limit/done-ness are JIT.
#[derive(Debug, Clone)]
pub struct SubtaskFixedQuery {
    pub identifier: Identifier,
    pub aggregates: Option<Vec<crate::model::Aggregate>>,
    pub granularity: Option<String>,
}

impl Subtask {
    pub fn new(
        sub_start: i64,
        sub_end: i64,
        priority: i64,
        max_query_limit: u32,
        is_raw_query: bool,
        include_outside_left: bool,
        include_outside_right: bool,
    ) -> Self {
        Subtask {
            id: NEXT_SUBTASK_ID.fetch_add(1, Ordering::Relaxed),
            priority,
            is_raw_query,
            state: Arc::new(Mutex::new(SubtaskState {
                sub_start,
                sub_end,
                max_query_limit,
                is_done: false,
                include_outside_left,
                include_outside_right,
            })),
        }
    }

    /// A child subtask covering the uncovered tail after a partial
    /// response. Adopts the parent's priority plus a small tie-break
    /// nudge so earlier time ranges of the same series keep running
    /// first.
    pub fn split_tail(
        &self,
        new_start: i64,
        new_end: i64,
        max_query_limit: u32,
        tiebreak_nudge: i64,
    ) -> Self {
        let (is_raw, include_right) = {
            let st = self.state.lock();
            (self.is_raw_query, st.include_outside_right)
        };
        Subtask::new(
            new_start,
            new_end,
            self.priority + tiebreak_nudge,
            max_query_limit,
            is_raw,
            false,
            include_right,
        )
    }

    pub fn sub_start(&self) -> i64 {
        self.state.lock().sub_start
    }

    pub fn sub_end(&self) -> i64 {
        self.state.lock().sub_end
    }

    pub fn max_query_limit(&self) -> u32 {
        self.state.lock().max_query_limit
    }

    pub fn set_max_query_limit(&self, limit: u32) {
        self.state.lock().max_query_limit = limit;
    }

    pub fn is_done(&self) -> bool {
        self.state.lock().is_done
    }

    pub fn mark_done(&self) {
        self.state.lock().is_done = true;
    }

    /// Narrows the subtask to the still-uncovered remainder in place,
    /// rather than replacing it — used when a page partially covers the
    /// range but the remaining slice is small enough not to warrant a
    /// further split.
    pub fn shrink_to(&self, new_start: i64) {
        self.state.lock().sub_start = new_start;
    }

    /// Builds the next outgoing request body item, or `None` if this
    /// subtask has nothing left to fetch. Built fresh on every call so
    /// the pool can call it at dequeue time (JIT construction contract).
    pub fn get_next_payload(&self, query: &SubtaskFixedQuery) -> Option<RequestItem> {
        let st = self.state.lock();
        if st.is_done || st.sub_start >= st.sub_end {
            return None;
        }
        let mut item = RequestItem::for_identifier(
            &query.identifier,
            st.sub_start,
            st.sub_end,
            st.max_query_limit,
        );
        item.aggregates = query.aggregates.clone();
        item.granularity = query.granularity.clone();
        if st.include_outside_left || st.include_outside_right {
            item.include_outside_points = Some(true);
        }
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn done_subtask_has_no_payload() {
        let sub = Subtask::new(0, 1000, 0, 100, true, false, false);
        sub.mark_done();
        let q = SubtaskFixedQuery {
            identifier: Identifier::Id(1),
            aggregates: None,
            granularity: None,
        };
        assert!(sub.get_next_payload(&q).is_none());
    }

    #[test]
    fn split_tail_inherits_right_edge_flag_only() {
        let parent = Subtask::new(0, 1000, 5, 100, true, true, true);
        let child = parent.split_tail(500, 1000, 100, 1);
        assert_eq!(child.priority, 6);
        // left edge ownership never propagates to a tail split
        let q = SubtaskFixedQuery {
            identifier: Identifier::Id(1),
            aggregates: None,
            granularity: None,
        };
        let payload = child.get_next_payload(&q).unwrap();
        assert_eq!(payload.include_outside_points, Some(true));
    }
}
