//! Query validation and expansion: plain structs, a `validate`-style
//! pass that returns a typed error before any I/O happens.

use crate::error::FetchError;
use crate::limits::{DPS_LIMIT, DPS_LIMIT_AGG};
use crate::model::{Aggregate, Identifier};

/// Per-identifier overrides a user may supply instead of a bare
/// id/external_id.
#[derive(Debug, Clone, Default)]
pub struct QueryOverrides {
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub aggregates: Option<Vec<Aggregate>>,
    pub granularity: Option<String>,
    pub limit: Option<u32>,
    pub include_outside_points: Option<bool>,
    pub ignore_unknown_ids: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct IdentifierEntry {
    pub identifier: Identifier,
    pub overrides: QueryOverrides,
}

impl IdentifierEntry {
    pub fn plain(identifier: Identifier) -> Self {
        IdentifierEntry {
            identifier,
            overrides: QueryOverrides::default(),
        }
    }
}

/// A top-level user request, naming one or more series.
#[derive(Debug, Clone)]
pub struct UserQuery {
    pub start: Option<i64>,
    pub end: Option<i64>,
    pub ids: Vec<IdentifierEntry>,
    pub external_ids: Vec<IdentifierEntry>,
    pub aggregates: Option<Vec<Aggregate>>,
    pub granularity: Option<String>,
    pub limit: Option<u32>,
    pub include_outside_points: bool,
    pub ignore_unknown_ids: bool,
}

impl Default for UserQuery {
    fn default() -> Self {
        UserQuery {
            start: None,
            end: None,
            ids: Vec::new(),
            external_ids: Vec::new(),
            aggregates: None,
            granularity: None,
            limit: None,
            include_outside_points: false,
            ignore_unknown_ids: false,
        }
    }
}

impl UserQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn id(mut self, id: i64) -> Self {
        self.ids.push(IdentifierEntry::plain(Identifier::Id(id)));
        self
    }

    pub fn external_id(mut self, xid: impl Into<String>) -> Self {
        self.external_ids
            .push(IdentifierEntry::plain(Identifier::ExternalId(xid.into())));
        self
    }
}

/// One expanded, single-series query.
#[derive(Debug, Clone)]
pub struct SingleSeriesQuery {
    pub identifier: Identifier,
    pub start: i64,
    pub end: i64,
    pub aggregates: Option<Vec<Aggregate>>,
    pub granularity: Option<String>,
    pub is_raw_query: bool,
    /// `None` means unlimited.
    pub user_limit: Option<u32>,
    /// `min(user_limit, per-request policy ceiling)` — what a single
    /// request for this series should ask for.
    pub capped_limit: u32,
    pub include_outside_points: bool,
    pub ignore_unknown_ids: bool,
    pub is_missing: bool,
    pub is_string: bool,
}

/// Output of [`validate_and_expand`]: the global order plus index lists
/// into it for the two fetch-strategy partitions.
#[derive(Debug)]
pub struct ExpandedQueries {
    pub all: Vec<SingleSeriesQuery>,
    pub raw_only: Vec<usize>,
    pub aggregate_only: Vec<usize>,
}

/// Validates and expands a batch of user queries into single-series
/// queries, in user-request order: ids before external_ids, each in
/// given order, duplicates preserved.
pub fn validate_and_expand(
    queries: &[UserQuery],
    now_ms: i64,
) -> Result<ExpandedQueries, FetchError> {
    let mut all = Vec::new();
    let mut raw_only = Vec::new();
    let mut aggregate_only = Vec::new();

    for query in queries {
        if query.ids.is_empty() && query.external_ids.is_empty() {
            return Err(FetchError::Validation(
                "query must name at least one id or external_id".to_string(),
            ));
        }

        for entry in query.ids.iter().chain(query.external_ids.iter()) {
            let single = expand_one(query, entry, now_ms)?;
            let idx = all.len();
            if single.is_raw_query {
                raw_only.push(idx);
            } else {
                aggregate_only.push(idx);
            }
            all.push(single);
        }
    }

    Ok(ExpandedQueries {
        all,
        raw_only,
        aggregate_only,
    })
}

fn expand_one(
    query: &UserQuery,
    entry: &IdentifierEntry,
    now_ms: i64,
) -> Result<SingleSeriesQuery, FetchError> {
    let ov = &entry.overrides;

    let start = ov.start.or(query.start).unwrap_or(0);
    let end = ov.end.or(query.end).unwrap_or(now_ms);
    if end <= start {
        return Err(FetchError::Validation(format!(
            "end ({end}) must be strictly greater than start ({start})"
        )));
    }

    let aggregates = ov.aggregates.clone().or_else(|| query.aggregates.clone());
    let granularity = ov.granularity.clone().or_else(|| query.granularity.clone());
    let include_outside_points = ov
        .include_outside_points
        .unwrap_or(query.include_outside_points);
    let ignore_unknown_ids = ov.ignore_unknown_ids.unwrap_or(query.ignore_unknown_ids);
    let limit = ov.limit.or(query.limit);

    if aggregates.is_some() != granularity.is_some() {
        return Err(FetchError::Validation(
            "aggregates and granularity must be specified together".to_string(),
        ));
    }
    if include_outside_points && aggregates.is_some() {
        return Err(FetchError::Validation(
            "include_outside_points is not allowed with aggregates".to_string(),
        ));
    }

    let is_raw_query = aggregates.is_none();
    let policy_ceiling = if is_raw_query { DPS_LIMIT } else { DPS_LIMIT_AGG };
    let capped_limit = limit.unwrap_or(policy_ceiling).min(policy_ceiling);

    Ok(SingleSeriesQuery {
        identifier: entry.identifier.clone(),
        start,
        end,
        aggregates,
        granularity,
        is_raw_query,
        user_limit: limit,
        capped_limit,
        include_outside_points,
        ignore_unknown_ids,
        is_missing: false,
        is_string: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn rejects_query_with_no_identifiers() {
        let q = UserQuery::new();
        let err = validate_and_expand(&[q], NOW).unwrap_err();
        assert!(matches!(err, FetchError::Validation(_)));
    }

    #[test]
    fn rejects_end_not_after_start() {
        let q = UserQuery {
            start: Some(100),
            end: Some(100),
            ..UserQuery::new().id(1)
        };
        let err = validate_and_expand(&[q], NOW).unwrap_err();
        assert!(matches!(err, FetchError::Validation(_)));
    }

    #[test]
    fn rejects_outside_points_with_aggregates() {
        let q = UserQuery {
            aggregates: Some(vec![Aggregate::Average]),
            granularity: Some("1h".to_string()),
            include_outside_points: true,
            ..UserQuery::new().id(1)
        };
        let err = validate_and_expand(&[q], NOW).unwrap_err();
        assert!(matches!(err, FetchError::Validation(_)));
    }

    #[test]
    fn expands_ids_before_external_ids_in_order() {
        let q = UserQuery::new().id(1).id(2).external_id("a");
        let expanded = validate_and_expand(&[q], NOW).unwrap();
        assert_eq!(expanded.all.len(), 3);
        assert_eq!(expanded.all[0].identifier, Identifier::Id(1));
        assert_eq!(expanded.all[1].identifier, Identifier::Id(2));
        assert_eq!(expanded.all[2].identifier, Identifier::ExternalId("a".to_string()));
    }

    #[test]
    fn per_identifier_overrides_win_over_top_level() {
        let mut q = UserQuery::new().id(1);
        q.limit = Some(10);
        q.ids[0].overrides.limit = Some(5);
        let expanded = validate_and_expand(&[q], NOW).unwrap();
        assert_eq!(expanded.all[0].user_limit, Some(5));
    }

    #[test]
    fn zero_limit_is_valid_not_an_error() {
        let mut q = UserQuery::new().id(1);
        q.limit = Some(0);
        let expanded = validate_and_expand(&[q], NOW).unwrap();
        assert_eq!(expanded.all[0].user_limit, Some(0));
    }
}
