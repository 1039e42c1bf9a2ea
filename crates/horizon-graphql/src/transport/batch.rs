//! Batching HTTP transport.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::{ClientError, Result};
use crate::operation::Operation;
use crate::response::GraphQLResponse;
use crate::transport::response_into_result;

const TARGET: &str = "horizon_graphql::transport";

/// Limits for the batching window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchConfig {
    /// Maximum operations per batch. Reaching it flushes immediately.
    pub max_operations: usize,
    /// How long an open window waits before flushing.
    pub flush_interval: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_operations: 20,
            flush_interval: Duration::from_millis(200),
        }
    }
}

/// Coalesces operations into JSON-array POSTs.
///
/// The first operation to arrive opens a window. The window closes when the
/// flush interval elapses or the batch reaches its maximum size, whichever
/// comes first. All members go out as one request; the response array is
/// distributed back by position, so one member's GraphQL errors never affect
/// its siblings. A transport failure is shared by every member.
#[derive(Clone)]
pub struct BatchTransport {
    inner: Arc<BatchInner>,
}

struct BatchInner {
    http: reqwest::Client,
    url: String,
    config: BatchConfig,
    queue: Mutex<BatchQueue>,
}

#[derive(Default)]
struct BatchQueue {
    pending: Vec<PendingOperation>,
    // Bumped on every flush. A window timer only flushes its own
    // generation, so a size-triggered flush cancels the timer's work.
    generation: u64,
}

struct PendingOperation {
    operation: Operation,
    reply: oneshot::Sender<Result<GraphQLResponse>>,
}

impl BatchTransport {
    /// Creates the transport against a GraphQL endpoint URL.
    pub fn new(http: reqwest::Client, url: impl Into<String>, config: BatchConfig) -> Self {
        Self {
            inner: Arc::new(BatchInner {
                http,
                url: url.into(),
                config,
                queue: Mutex::new(BatchQueue::default()),
            }),
        }
    }

    /// The limits in force.
    pub fn config(&self) -> &BatchConfig {
        &self.inner.config
    }

    /// Number of operations waiting in the open window.
    pub fn pending(&self) -> usize {
        self.inner.queue.lock().pending.len()
    }

    /// Enqueues one operation and waits for its slot of the batch response.
    ///
    /// Must be called from within a Tokio runtime; the window timer runs as
    /// a spawned task.
    pub async fn execute(&self, operation: Operation) -> Result<GraphQLResponse> {
        let (reply_tx, reply_rx) = oneshot::channel();

        let filled = {
            let mut queue = self.inner.queue.lock();
            let generation = queue.generation;
            queue.pending.push(PendingOperation {
                operation,
                reply: reply_tx,
            });
            if queue.pending.len() == 1 {
                // first member opens the window and arms its timer
                let inner = Arc::clone(&self.inner);
                tokio::spawn(async move {
                    tokio::time::sleep(inner.config.flush_interval).await;
                    flush_generation(&inner, generation).await;
                });
            }
            if queue.pending.len() >= self.inner.config.max_operations {
                // the push that fills the window also closes it, under the
                // same lock, so no concurrent push can slip past the cap
                queue.generation += 1;
                Some(std::mem::take(&mut queue.pending))
            } else {
                None
            }
        };

        if let Some(batch) = filled {
            dispatch_batch(&self.inner, batch).await;
        }

        reply_rx.await.map_err(|_| ClientError::ChannelClosed)?
    }
}

/// Flushes the open window, but only if it is still the given generation.
async fn flush_generation(inner: &Arc<BatchInner>, generation: u64) {
    let batch = {
        let mut queue = inner.queue.lock();
        if queue.generation != generation || queue.pending.is_empty() {
            return;
        }
        queue.generation += 1;
        std::mem::take(&mut queue.pending)
    };
    dispatch_batch(inner, batch).await;
}

/// Posts one closed batch and hands each member its slot of the result.
async fn dispatch_batch(inner: &Arc<BatchInner>, batch: Vec<PendingOperation>) {
    tracing::debug!(target: TARGET, size = batch.len(), "flushing operation batch");

    match post_batch(inner, &batch).await {
        Ok(responses) if responses.len() == batch.len() => {
            for (pending, response) in batch.into_iter().zip(responses) {
                let _ = pending.reply.send(response_into_result(response));
            }
        }
        Ok(responses) => {
            let error = ClientError::Request(format!(
                "batch response count mismatch: sent {}, received {}",
                batch.len(),
                responses.len()
            ));
            tracing::warn!(target: TARGET, error = %error, "discarding batch");
            for pending in batch {
                let _ = pending.reply.send(Err(error.clone()));
            }
        }
        Err(error) => {
            for pending in batch {
                let _ = pending.reply.send(Err(error.clone()));
            }
        }
    }
}

/// Sends the members as a JSON array and parses the array response.
///
/// Headers come from the first member; chain stages set the same headers on
/// every operation of a window, so the choice is arbitrary.
async fn post_batch(
    inner: &Arc<BatchInner>,
    batch: &[PendingOperation],
) -> Result<Vec<GraphQLResponse>> {
    let payload: Vec<&Operation> = batch.iter().map(|p| &p.operation).collect();

    let mut request = inner
        .http
        .post(&inner.url)
        .header("Content-Type", "application/json")
        .header("Accept", "application/json");
    if let Some(first) = batch.first() {
        for (name, value) in &first.operation.context().headers {
            request = request.header(name.as_str(), value.as_str());
        }
    }

    let response = request.json(&payload).send().await?;
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.ok().filter(|b| !b.is_empty());
        return Err(ClientError::HttpStatus {
            status: status.as_u16(),
            body,
        });
    }

    let bytes = response.bytes().await?;
    let parsed: Vec<GraphQLResponse> = serde_json::from_slice(&bytes)?;
    Ok(parsed)
}
