//! Request dispatcher: TCP accept loop, frame decoding, and read/write
//! routing.
//!
//! Each connection carries exactly one request. A short-lived handler
//! reads and decodes the frame, then parks the connection on the
//! in-memory request queue. A single processor task drains that queue:
//!
//! - **Mutations** (`done`, `pending`, `cancel`, `reset`, `error`,
//!   `upload-step`, `upload-steps`, `reset-errors`) land on the durable
//!   transaction queue and are acknowledged immediately. The state-machine
//!   executor applies them later; the ack therefore promises durability,
//!   not visibility.
//! - **Reads** (`get-steps`, `step-count`, `fetch-errors`, `fetch-rows`,
//!   `delete-steps`) execute inline and reply with the serialized result.
//!
//! Running every `get-steps` on the one processor task is what makes the
//! lease atomic: a second call cannot observe candidates before the first
//! call's batched `working` update lands.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use sluice_core::bucket::{step_key, BucketStore};
use sluice_core::error::Error as CoreError;
use sluice_core::step::Step;
use sluice_core::wire::{
    read_frame, write_frame, Method, Request, OK_RESPONSE, UNKNOWN_METHOD_RESPONSE,
};

use crate::error::{Error, Result};
use crate::governor::VelocityGovernor;
use crate::metrics::HubMetrics;
use crate::scheduler::{LeaseOptions, Scheduler};
use crate::store::StepStore;
use crate::txqueue::TransactionQueue;

/// Attempts to bind the listen port before giving up.
const BIND_ATTEMPTS: u32 = 5;

/// In-memory request queue depth; beyond this, accepts briefly block.
const REQUEST_QUEUE_DEPTH: usize = 1024;

/// `fetch-errors` request body.
#[derive(Debug, serde::Deserialize)]
struct FetchErrorsBody {
    #[serde(default = "default_error_count")]
    count: usize,
    #[serde(default)]
    exclude: ExcludeList,
}

const fn default_error_count() -> usize {
    25
}

/// `exclude` may arrive as null, a single string, or a list.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(untagged)]
enum ExcludeList {
    #[default]
    None,
    One(String),
    Many(Vec<String>),
}

impl ExcludeList {
    fn into_vec(self) -> Vec<String> {
        match self {
            Self::None => Vec::new(),
            Self::One(value) => vec![value],
            Self::Many(values) => values,
        }
    }
}

/// One decoded request parked on the in-memory queue with its connection.
struct RequestContext {
    method: Method,
    body: Vec<u8>,
    stream: TcpStream,
    peer: String,
}

/// The hub's TCP front end.
pub struct HubServer {
    host: String,
    port: u16,
    store: Arc<StepStore>,
    scheduler: Scheduler,
    bucket: Arc<dyn BucketStore>,
    queue: Arc<TransactionQueue>,
    metrics: HubMetrics,
}

impl HubServer {
    /// Wires the server over its collaborators.
    #[must_use]
    pub fn new(
        host: impl Into<String>,
        port: u16,
        store: Arc<StepStore>,
        governor: Arc<VelocityGovernor>,
        bucket: Arc<dyn BucketStore>,
        queue: Arc<TransactionQueue>,
    ) -> Self {
        let scheduler = Scheduler::new(store.clone(), governor);
        Self {
            host: host.into(),
            port,
            store,
            scheduler,
            bucket,
            queue,
            metrics: HubMetrics::new(),
        }
    }

    /// Binds the configured address (retrying a busy port) and serves
    /// forever.
    ///
    /// # Errors
    ///
    /// Returns an error if the port stays busy after the retry budget or
    /// the listener fails.
    pub async fn serve(self: Arc<Self>) -> Result<()> {
        let listener = self.bind_with_retry().await?;
        self.serve_listener(listener).await
    }

    /// Serves on an already-bound listener. Used directly by tests that
    /// bind port 0.
    ///
    /// # Errors
    ///
    /// Returns an error if the accept loop fails fatally.
    pub async fn serve_listener(self: Arc<Self>, listener: TcpListener) -> Result<()> {
        if let Ok(addr) = listener.local_addr() {
            tracing::info!(%addr, "hub listening");
        }

        let (tx, rx) = mpsc::channel::<RequestContext>(REQUEST_QUEUE_DEPTH);
        let processor = self.clone();
        tokio::spawn(async move { processor.process_requests(rx).await });

        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                    continue;
                }
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                handle_connection(stream, peer.to_string(), tx).await;
            });
        }
    }

    async fn bind_with_retry(&self) -> Result<TcpListener> {
        let addr = format!("{}:{}", self.host, self.port);
        for attempt in 1..=BIND_ATTEMPTS {
            match TcpListener::bind(&addr).await {
                Ok(listener) => return Ok(listener),
                Err(err) if err.kind() == std::io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                    let backoff = Duration::from_secs(u64::from(5 * attempt));
                    tracing::warn!(%addr, attempt, ?backoff, "port busy, retrying bind");
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => {
                    return Err(Error::configuration(format!("cannot bind {addr}: {err}")));
                }
            }
        }
        Err(Error::configuration(format!(
            "cannot bind {addr}: port still busy after {BIND_ATTEMPTS} attempts"
        )))
    }

    /// The single processor task: reads execute inline, writes are made
    /// durable and acknowledged.
    async fn process_requests(self: Arc<Self>, mut rx: mpsc::Receiver<RequestContext>) {
        while let Some(mut ctx) = rx.recv().await {
            self.metrics.record_request(ctx.method.as_str());

            let reply = if ctx.method.is_mutation() {
                match self.queue.push(ctx.method, &ctx.body) {
                    Ok(_seq) => {
                        self.metrics.set_queue_depth(self.queue.depth());
                        Ok(OK_RESPONSE.to_vec())
                    }
                    Err(err) => Err(err),
                }
            } else {
                self.execute_read(ctx.method, &ctx.body).await
            };

            match reply {
                Ok(payload) => {
                    if let Err(err) = write_frame(&mut ctx.stream, &payload).await {
                        tracing::debug!(peer = %ctx.peer, error = %err, "failed to write reply");
                    }
                    let _ = ctx.stream.shutdown().await;
                }
                Err(err) => {
                    // The request was accepted but could not be served;
                    // close without a reply and let the client retry.
                    tracing::error!(
                        peer = %ctx.peer,
                        method = %ctx.method,
                        error = %err,
                        "request failed"
                    );
                }
            }
        }
    }

    async fn execute_read(&self, method: Method, body: &[u8]) -> Result<Vec<u8>> {
        match method {
            Method::GetSteps => {
                let (scopes, options): (Vec<String>, LeaseOptions) = serde_json::from_slice(body)
                    .map_err(|err| Error::serialization(format!("bad get-steps body: {err}")))?;
                let ids = self.scheduler.lease(&scopes, &options)?;
                encode_json(&ids)
            }
            Method::StepCount => {
                #[derive(serde::Deserialize)]
                struct Body {
                    types: String,
                }
                let body: Body = serde_json::from_slice(body)
                    .map_err(|err| Error::serialization(format!("bad step-count body: {err}")))?;
                let counts = self.store.counts_by_status(body.types == "*")?;
                encode_json(&counts)
            }
            Method::FetchErrors => {
                let body: FetchErrorsBody = serde_json::from_slice(body)
                    .map_err(|err| Error::serialization(format!("bad fetch-errors body: {err}")))?;
                let excludes = body.exclude.into_vec();
                let (total, rows) = self.store.fetch_errors(body.count, &excludes)?;

                let mut table = Vec::with_capacity(rows.len());
                for row in rows {
                    let step = self.definition(&row.id).await;
                    let mut value = serde_json::to_value(&row)
                        .map_err(|err| Error::serialization(err.to_string()))?;
                    value["step"] = step.map_or(serde_json::Value::Null, |step| {
                        serde_json::to_value(step).unwrap_or(serde_json::Value::Null)
                    });
                    table.push(value);
                }
                encode_json(&json!({
                    "total": total,
                    "count": table.len(),
                    "table": table,
                }))
            }
            Method::FetchRows => {
                #[derive(serde::Deserialize)]
                struct Body {
                    step_id: String,
                }
                let body: Body = serde_json::from_slice(body)
                    .map_err(|err| Error::serialization(format!("bad fetch-rows body: {err}")))?;
                let ids: Vec<String> = body
                    .step_id
                    .split(',')
                    .map(str::trim)
                    .filter(|id| !id.is_empty())
                    .map(ToString::to_string)
                    .collect();
                let rows = self.store.fetch_rows(&ids)?;
                encode_json(&rows)
            }
            Method::DeleteSteps => {
                let deleted = self.store.delete_all()?;
                tracing::info!(deleted, "deleted all step rows");
                Ok(OK_RESPONSE.to_vec())
            }
            other => Err(Error::protocol(format!("{other} is not a read method"))),
        }
    }

    /// Best-effort definition fetch for response enrichment.
    async fn definition(&self, id: &str) -> Option<Step> {
        match self.bucket.get(&step_key(id)).await {
            Ok(Some(raw)) => serde_json::from_slice(&raw).ok(),
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(step_id = id, error = %err, "failed to fetch definition");
                None
            }
        }
    }
}

fn encode_json<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(value).map_err(|err| Error::serialization(err.to_string()))
}

/// Reads one frame off a fresh connection and parks it on the request
/// queue. Malformed frames get no reply; unknown methods get the distinct
/// error marker.
async fn handle_connection(mut stream: TcpStream, peer: String, tx: mpsc::Sender<RequestContext>) {
    let _ = stream.set_nodelay(true);
    let frame = match read_frame(&mut stream).await {
        Ok(Some(frame)) => frame,
        Ok(None) => return,
        Err(err) => {
            tracing::debug!(%peer, error = %err, "dropping malformed frame");
            return;
        }
    };

    let request = match Request::decode(&frame) {
        Ok(request) => request,
        Err(CoreError::UnknownMethod { method }) => {
            tracing::debug!(%peer, method, "unknown method");
            let _ = write_frame(&mut stream, UNKNOWN_METHOD_RESPONSE).await;
            return;
        }
        Err(err) => {
            tracing::debug!(%peer, error = %err, "dropping undecodable request");
            return;
        }
    };

    let ctx = RequestContext {
        method: request.method,
        body: request.body,
        stream,
        peer,
    };
    if tx.send(ctx).await.is_err() {
        tracing::warn!("request queue closed; dropping connection");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exclude_list_accepts_all_wire_shapes() {
        let body: FetchErrorsBody = serde_json::from_str(r#"{"count": 5}"#).expect("parse");
        assert!(body.exclude.into_vec().is_empty());

        let body: FetchErrorsBody =
            serde_json::from_str(r#"{"count": 5, "exclude": null}"#).expect("parse");
        assert!(body.exclude.into_vec().is_empty());

        let body: FetchErrorsBody =
            serde_json::from_str(r#"{"count": 5, "exclude": "timeout"}"#).expect("parse");
        assert_eq!(body.exclude.into_vec(), ["timeout"]);

        let body: FetchErrorsBody =
            serde_json::from_str(r#"{"count": 5, "exclude": ["a", "b"]}"#).expect("parse");
        assert_eq!(body.exclude.into_vec(), ["a", "b"]);
    }

    #[test]
    fn fetch_errors_count_defaults() {
        let body: FetchErrorsBody = serde_json::from_str("{}").expect("parse");
        assert_eq!(body.count, 25);
    }
}
