//! Shared plumbing between the Eager and Chunking fetchers: the
//! completion channel and the single-subtask pool job builder.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::client::{ClientError, DatapointsClient};
use crate::error::FetchError;
use crate::model::{ListRequest, ResponseItem};
use crate::subtask::{Subtask, SubtaskFixedQuery};

pub mod chunking;
pub mod eager;

/// One resolved request outcome. `item` is `None` when the identifier
/// was absent from the response body — the unambiguous "unknown to the
/// server" signal.
pub(crate) enum Completion {
    Item {
        task_idx: usize,
        subtask: Subtask,
        item: Option<ResponseItem>,
    },
    Fatal(FetchError),
}

pub(crate) type CompletionSender = mpsc::UnboundedSender<Completion>;
pub(crate) type CompletionReceiver = mpsc::UnboundedReceiver<Completion>;

/// Builds a pool job for a single-subtask, single-item request. Payload
/// construction happens inside the returned future — at the instant the
/// pool actually polls it, not at submission time — so a subtask
/// cancelled between submission and dispatch never reaches the network.
pub(crate) fn single_subtask_job(
    task_idx: usize,
    subtask: Subtask,
    query: SubtaskFixedQuery,
    ignore_unknown_ids: bool,
    client: Arc<dyn DatapointsClient>,
    tx: CompletionSender,
) -> crate::pool::Job {
    Box::pin(async move {
        let Some(item) = subtask.get_next_payload(&query) else {
            return;
        };
        let request = ListRequest {
            ignore_unknown_ids,
            items: vec![item],
        };
        match client.list(&request).await {
            Ok(response) => {
                let item = response.items.into_iter().next();
                let _ = tx.send(Completion::Item {
                    task_idx,
                    subtask,
                    item,
                });
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
