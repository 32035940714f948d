//! End-to-end scenarios exercised against an in-memory client.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use datapoints_engine::client::{ClientError, DatapointsClient};
use datapoints_engine::model::{
    Aggregate, Identifier, ListRequest, ListResponse, RequestItem, ResponseDatapoint, ResponseItem,
    SeriesPoints,
};
use datapoints_engine::{fetch_all_datapoints, DatapointsResults, EngineConfig, FetchError, UserQuery};

enum FixtureData {
    Raw(Vec<(i64, f64)>),
    Aggregate(Vec<(i64, HashMap<String, f64>)>),
}

struct Fixture {
    is_string: bool,
    is_step: bool,
    data: FixtureData,
}

/// Serves canned `/list` pages without a network round-trip, honoring
/// `start`/`end`/`limit` and `ignoreUnknownIds` the way the real
/// endpoint does.
struct MockClient {
    series: HashMap<Identifier, Fixture>,
    requests: Mutex<Vec<usize>>,
}

impl MockClient {
    fn new(series: HashMap<Identifier, Fixture>) -> Self {
        MockClient {
            series,
            requests: Mutex::new(Vec::new()),
        }
    }

    fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    fn identifier_of(item: &RequestItem) -> Identifier {
        match (item.id, &item.external_id) {
            (Some(id), _) => Identifier::Id(id),
            (None, Some(xid)) => Identifier::ExternalId(xid.clone()),
            (None, None) => Identifier::ExternalId(String::new()),
        }
    }

    fn build_response_item(identifier: &Identifier, req: &RequestItem, fixture: &Fixture) -> ResponseItem {
        let (id, external_id) = match identifier {
            Identifier::Id(id) => (Some(*id), None),
            Identifier::ExternalId(xid) => (None, Some(xid.clone())),
        };
        let mut datapoints = Vec::new();
        match &fixture.data {
            FixtureData::Raw(points) => {
                for &(ts, value) in points {
                    if ts < req.start || ts >= req.end {
                        continue;
                    }
                    if datapoints.len() as u32 >= req.limit {
                        break;
                    }
                    let mut fields = HashMap::new();
                    fields.insert("value".to_string(), json!(value));
                    datapoints.push(ResponseDatapoint { timestamp: ts, fields });
                }
            }
            FixtureData::Aggregate(rows) => {
                for (ts, values) in rows {
                    if *ts < req.start || *ts >= req.end {
                        continue;
                    }
                    if datapoints.len() as u32 >= req.limit {
                        break;
                    }
                    let fields = values.iter().map(|(k, v)| (k.clone(), json!(v))).collect();
                    datapoints.push(ResponseDatapoint {
                        timestamp: *ts,
                        fields,
                    });
                }
            }
        }
        ResponseItem {
            id,
            external_id,
            is_string: fixture.is_string,
            is_step: fixture.is_step,
            datapoints,
        }
    }
}

#[async_trait]
impl DatapointsClient for MockClient {
    async fn list(&self, request: &ListRequest) -> Result<ListResponse, ClientError> {
        self.requests.lock().unwrap().push(request.items.len());

        let mut missing = Vec::new();
        let mut items = Vec::new();
        for req_item in &request.items {
            let identifier = Self::identifier_of(req_item);
            match self.series.get(&identifier) {
                None => {
                    if !request.ignore_unknown_ids {
                        missing.push(identifier.as_display());
                    }
                }
                Some(fixture) => {
                    items.push(Self::build_response_item(&identifier, req_item, fixture));
                }
            }
        }

        if !missing.is_empty() {
            return Err(ClientError::MissingIdentifiers(missing));
        }
        Ok(ListResponse { items })
    }
}

fn equally_spaced_raw(n: usize, start: i64, end: i64) -> Vec<(i64, f64)> {
    let step = ((end - start) / n as i64).max(1);
    (0..n).map(|i| (start + i as i64 * step, i as f64)).collect()
}

#[tokio::test]
async fn scenario_eager_three_large_series() {
    let mut series = HashMap::new();
    for id in [1, 2, 3] {
        series.insert(
            Identifier::Id(id),
            Fixture {
                is_string: false,
                is_step: false,
                data: FixtureData::Raw(equally_spaced_raw(30_000, 0, 3_000_000)),
            },
        );
    }
    let client = Arc::new(MockClient::new(series));
    let queries = vec![UserQuery::new().id(1).id(2).id(3)];
    let config = EngineConfig::new(4);

    let results = fetch_all_datapoints(&queries, client.clone(), &config).await.unwrap();
    assert_eq!(results.0.len(), 3);
    for slot in &results.0 {
        let series = slot.as_ref().unwrap();
        match &series.points {
            SeriesPoints::Raw(points) => assert_eq!(points.len(), 30_000),
            _ => panic!("expected raw points"),
        }
    }
    assert!(client.request_count() <= 3);
}

#[tokio::test]
async fn scenario_chunking_many_small_series() {
    let mut series = HashMap::new();
    let mut query = UserQuery::new();
    for id in 0..50 {
        series.insert(
            Identifier::Id(id),
            Fixture {
                is_string: false,
                is_step: false,
                data: FixtureData::Raw(equally_spaced_raw(100, 0, 10_000)),
            },
        );
        query = query.id(id);
    }
    let client = Arc::new(MockClient::new(series));
    let config = EngineConfig::new(4);

    let results = fetch_all_datapoints(&[query], client, &config).await.unwrap();
    assert_eq!(results.0.len(), 50);
    for slot in &results.0 {
        let series = slot.as_ref().unwrap();
        assert_eq!(series.points.len(), 100);
    }
}

#[tokio::test]
async fn scenario_paginated_limit_across_requests() {
    let mut series = HashMap::new();
    series.insert(
        Identifier::Id(1),
        Fixture {
            is_string: false,
            is_step: false,
            data: FixtureData::Raw((0..300).map(|i| (i as i64, i as f64)).collect()),
        },
    );
    let client = Arc::new(MockClient::new(series));
    let mut query = UserQuery::new().id(1);
    query.limit = Some(150);
    let config = EngineConfig::new(2);

    let results = fetch_all_datapoints(&[query], client, &config).await.unwrap();
    let series = results.0[0].as_ref().unwrap();
    match &series.points {
        SeriesPoints::Raw(points) => {
            assert_eq!(points.len(), 150);
            let timestamps: Vec<i64> = points.iter().map(|p| p.timestamp).collect();
            let mut sorted = timestamps.clone();
            sorted.sort_unstable();
            sorted.dedup();
            assert_eq!(sorted, timestamps, "timestamps must be strictly increasing, no duplicates");
        }
        _ => panic!("expected raw points"),
    }
}

#[tokio::test]
async fn scenario_missing_identifier_hard_fails() {
    let mut series = HashMap::new();
    series.insert(
        Identifier::Id(2),
        Fixture {
            is_string: false,
            is_step: false,
            data: FixtureData::Raw(equally_spaced_raw(10, 0, 1000)),
        },
    );
    let client = Arc::new(MockClient::new(series));
    let queries = vec![UserQuery::new().id(1).id(2)];
    let config = EngineConfig::new(2);

    let err = fetch_all_datapoints(&queries, client, &config).await.unwrap_err();
    match err {
        FetchError::NotFound(ids) => assert!(ids.iter().any(|id| id == "1")),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[tokio::test]
async fn scenario_missing_identifier_tolerated() {
    let mut series = HashMap::new();
    series.insert(
        Identifier::Id(2),
        Fixture {
            is_string: false,
            is_step: false,
            data: FixtureData::Raw(equally_spaced_raw(10, 0, 1000)),
        },
    );
    let client = Arc::new(MockClient::new(series));
    let mut missing_query = UserQuery::new().id(1);
    missing_query.ignore_unknown_ids = true;
    let present_query = UserQuery::new().id(2);
    let config = EngineConfig::new(2);

    let results: DatapointsResults = fetch_all_datapoints(&[missing_query, present_query], client, &config)
        .await
        .unwrap();
    assert_eq!(results.0.len(), 2);
    assert!(results.0[0].is_none());
    assert!(results.0[1].is_some());
}

#[tokio::test]
async fn scenario_aggregate_query_hourly() {
    let mut rows = Vec::new();
    for hour in 0..24i64 {
        let ts = hour * 3_600_000;
        let mut values = HashMap::new();
        values.insert("average".to_string(), hour as f64);
        values.insert("max".to_string(), hour as f64 * 2.0);
        rows.push((ts, values));
    }
    let mut series = HashMap::new();
    series.insert(
        Identifier::Id(1),
        Fixture {
            is_string: false,
            is_step: false,
            data: FixtureData::Aggregate(rows),
        },
    );
    let client = Arc::new(MockClient::new(series));
    let mut query = UserQuery::new().id(1);
    query.aggregates = Some(vec![Aggregate::Average, Aggregate::Max]);
    query.granularity = Some("1h".to_string());
    query.end = Some(86_400_000);
    let config = EngineConfig::new(8);

    let results = fetch_all_datapoints(&[query], client, &config).await.unwrap();
    let series = results.0[0].as_ref().unwrap();
    match &series.points {
        SeriesPoints::Aggregate(points) => {
            assert_eq!(points.len(), 24);
            let timestamps: Vec<i64> = points.iter().map(|p| p.timestamp).collect();
            let mut sorted = timestamps.clone();
            sorted.sort_unstable();
            assert_eq!(sorted, timestamps);
        }
        _ => panic!("expected aggregate points"),
    }
}
