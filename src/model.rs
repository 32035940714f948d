//! The data model shared across the query, task, and client layers.
//!
//! Request/response DTOs mirror the wire shape of the
//! `/timeseries/data/list` endpoint; the `Raw`/`Aggregate` split in
//! [`SeriesPoints`] mirrors the split between numeric and string series.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A time series identifier: either an internal numeric id or an
/// external id string. Never both for the same occurrence.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Identifier {
    Id(i64),
    ExternalId(String),
}

impl Identifier {
    pub fn as_display(&self) -> String {
        match self {
            Identifier::Id(id) => id.to_string(),
            Identifier::ExternalId(xid) => xid.clone(),
        }
    }
}

/// One of the aggregates the server can compute over a granularity bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Aggregate {
    Average,
    Max,
    Min,
    Count,
    Sum,
    Interpolation,
    StepInterpolation,
    ContinuousVariance,
    DiscreteVariance,
    TotalVariation,
}

/// A raw value is either numeric or a string, depending on the series type
/// discovered on first contact with the server.
#[derive(Debug, Clone, PartialEq)]
pub enum DatapointValue {
    Numeric(f64),
    String(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawDatapoint {
    pub timestamp: i64,
    pub value: DatapointValue,
}

/// One aggregate row: a timestamp plus one value per requested aggregate,
/// in the order the aggregates were requested.
#[derive(Debug, Clone, PartialEq)]
pub struct AggregateDatapoint {
    pub timestamp: i64,
    pub values: Vec<f64>,
}

#[derive(Debug, Clone)]
pub enum SeriesPoints {
    Raw(Vec<RawDatapoint>),
    Aggregate(Vec<AggregateDatapoint>),
}

impl SeriesPoints {
    pub fn len(&self) -> usize {
        match self {
            SeriesPoints::Raw(v) => v.len(),
            SeriesPoints::Aggregate(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The materialized result for one expanded query.
#[derive(Debug, Clone)]
pub struct SeriesResult {
    pub identifier: Identifier,
    pub is_string: bool,
    pub is_step: bool,
    pub points: SeriesPoints,
}

/// Output of `fetch_all_datapoints`: one slot per expanded query, in the
/// exact order identifiers appeared in the user's request. `None` marks a
/// series that was missing and tolerated via `ignore_unknown_ids`.
#[derive(Debug, Clone, Default)]
pub struct DatapointsResults(pub Vec<Option<SeriesResult>>);

// ---------------------------------------------------------------------
// Wire DTOs for the `/timeseries/data/list` endpoint.
// ---------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RequestItem {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "externalId")]
    pub external_id: Option<String>,
    pub start: i64,
    pub end: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregates: Option<Vec<Aggregate>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granularity: Option<String>,
    pub limit: u32,
    #[serde(skip_serializing_if = "Option::is_none", rename = "includeOutsidePoints")]
    pub include_outside_points: Option<bool>,
}

impl RequestItem {
    pub fn for_identifier(identifier: &Identifier, start: i64, end: i64, limit: u32) -> Self {
        let (id, external_id) = match identifier {
            Identifier::Id(id) => (Some(*id), None),
            Identifier::ExternalId(xid) => (None, Some(xid.clone())),
        };
        RequestItem {
            id,
            external_id,
            start,
            end,
            aggregates: None,
            granularity: None,
            limit,
            include_outside_points: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ListRequest {
    #[serde(rename = "ignoreUnknownIds")]
    pub ignore_unknown_ids: bool,
    pub items: Vec<RequestItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseDatapoint {
    pub timestamp: i64,
    #[serde(flatten)]
    pub fields: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResponseItem {
    pub id: Option<i64>,
    #[serde(rename = "externalId")]
    pub external_id: Option<String>,
    #[serde(rename = "isString", default)]
    pub is_string: bool,
    #[serde(rename = "isStep", default)]
    pub is_step: bool,
    pub datapoints: Vec<ResponseDatapoint>,
}

impl ResponseItem {
    pub fn identifier(&self) -> Identifier {
        match (&self.id, &self.external_id) {
            (Some(id), _) => Identifier::Id(*id),
            (None, Some(xid)) => Identifier::ExternalId(xid.clone()),
            (None, None) => Identifier::ExternalId(String::new()),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ListResponse {
    #[serde(default)]
    pub items: Vec<ResponseItem>,
}
