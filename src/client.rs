//! The HTTP-client interface the engine consumes.
//!
//! Transport and authentication are out of scope for the engine itself;
//! this module defines the seam — [`DatapointsClient`] — and a concrete
//! `reqwest`-backed implementation: a plain `reqwest::Client` field, a
//! URL-building helper, and status-code mapping into a typed error at
//! the call site.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;

use crate::model::{ListRequest, ListResponse};

/// Errors at the transport boundary. The engine maps these into
/// [`crate::error::FetchError`] immediately upon return.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("server returned {status}: {message}")]
    Status { status: u16, message: String },

    /// `ignoreUnknownIds=false` and the server rejected one or more
    /// identifiers as unknown.
    #[error("missing identifiers: {0:?}")]
    MissingIdentifiers(Vec<String>),
}

/// The one network interface the engine relies on: a POST to the
/// `/timeseries/data/list` endpoint.
#[async_trait]
pub trait DatapointsClient: Send + Sync {
    async fn list(&self, request: &ListRequest) -> Result<ListResponse, ClientError>;
}

/// Body of a missing-identifier 400 response.
#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
    #[serde(default)]
    missing: Vec<MissingEntry>,
}

#[derive(Debug, Deserialize)]
struct MissingEntry {
    id: Option<i64>,
    #[serde(rename = "externalId")]
    external_id: Option<String>,
}

impl MissingEntry {
    fn display(&self) -> String {
        match (&self.id, &self.external_id) {
            (Some(id), _) => id.to_string(),
            (_, Some(xid)) => xid.clone(),
            _ => "<unknown>".to_string(),
        }
    }
}

pub struct ReqwestDatapointsClient {
    http: reqwest::Client,
    base_url: String,
}

impl ReqwestDatapointsClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(30))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.into(),
        }
    }

    fn list_url(&self) -> String {
        format!(
            "{}/timeseries/data/list",
            self.base_url.trim_end_matches('/')
        )
    }
}

#[async_trait]
impl DatapointsClient for ReqwestDatapointsClient {
    async fn list(&self, request: &ListRequest) -> Result<ListResponse, ClientError> {
        let url = self.list_url();
        tracing::debug!(url = %url, items = request.items.len(), "dispatching /list request");

        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 400 {
            if let Ok(body) = response.json::<ErrorEnvelope>().await {
                if !body.error.missing.is_empty() {
                    return Err(ClientError::MissingIdentifiers(
                        body.error.missing.iter().map(MissingEntry::display).collect(),
                    ));
                }
                return Err(ClientError::Status {
                    status: status.as_u16(),
                    message: body.error.message,
                });
            }
            return Err(ClientError::Status {
                status: status.as_u16(),
                message: "bad request".to_string(),
            });
        }

        if !status.is_success() {
            let message = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(ClientError::Status {
                status: status.as_u16(),
                message,
            });
        }

        response
            .json::<ListResponse>()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))
    }
}
