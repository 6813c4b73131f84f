//! Client for the hub's TCP protocol.
//!
//! Used by workers, CLIs, and the integration tests. One connection per
//! request; each attempt runs under a socket deadline and the deadline
//! doubles on retry, up to the configured attempt budget. The hub never
//! pushes; callers poll.
//!
//! A write acknowledged with `ok` is durable but not necessarily visible
//! to an immediately following read; callers needing read-after-write
//! should poll.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use sluice_core::step::{Step, StepRow, StepStatus};
use sluice_core::wire::{read_frame, write_frame, Method, Request, OK_RESPONSE};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::scheduler::LeaseOptions;

/// Hub protocol client.
#[derive(Debug, Clone)]
pub struct HubClient {
    host: String,
    port: u16,
    timeout: Duration,
    attempts: u32,
}

impl HubClient {
    /// Creates a client for the given hub address with default retry
    /// policy.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        let defaults = ClientConfig::default();
        Self {
            host: host.into(),
            port,
            timeout: defaults.timeout,
            attempts: defaults.attempts,
        }
    }

    /// Creates a client from a [`ClientConfig`].
    #[must_use]
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            timeout: config.timeout,
            attempts: config.attempts.max(1),
        }
    }

    /// Creates a client from `PIPE_WORKER_HOST`/`PIPE_WORKER_PORT`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unparseable environment values.
    pub fn from_env() -> Result<Self> {
        Ok(Self::from_config(&ClientConfig::from_env()?))
    }

    /// Sets the initial per-request deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sets the retry attempt budget.
    #[must_use]
    pub const fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Leases up to `options.limit` runnable step ids for the scope set.
    ///
    /// # Errors
    ///
    /// Returns an error once the retry budget is exhausted or the reply
    /// cannot be decoded.
    pub async fn get_steps(&self, scopes: &[String], options: &LeaseOptions) -> Result<Vec<String>> {
        let body = serde_json::to_vec(&(
            scopes,
            serde_json::json!({
                "limit": options.limit,
                "chunk_size": options.chunk_size,
                "status": options.status,
                "include_working": options.include_working,
                "reverse": options.reverse,
            }),
        ))
        .map_err(|err| Error::serialization(err.to_string()))?;
        let reply = self.request(Method::GetSteps, body).await?;
        serde_json::from_slice(&reply)
            .map_err(|err| Error::serialization(format!("bad get-steps reply: {err}")))
    }

    /// Marks a step successful.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub does not acknowledge.
    pub async fn done(&self, step_id: &str) -> Result<()> {
        self.mutate(Method::Done, step_id.as_bytes().to_vec()).await
    }

    /// Returns a step to the runnable pool.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub does not acknowledge.
    pub async fn pending(&self, step_id: &str) -> Result<()> {
        self.mutate(Method::Pending, step_id.as_bytes().to_vec()).await
    }

    /// Cancels a step and its connected component.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub does not acknowledge.
    pub async fn cancel(&self, step_id: &str) -> Result<()> {
        self.mutate(Method::Cancel, step_id.as_bytes().to_vec()).await
    }

    /// Resets a step and its connected component.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub does not acknowledge.
    pub async fn reset(&self, step_id: &str) -> Result<()> {
        self.mutate(Method::Reset, step_id.as_bytes().to_vec()).await
    }

    /// Batch variant of [`done`](Self::done).
    ///
    /// # Errors
    ///
    /// Returns the first acknowledgement failure.
    pub async fn dones(&self, step_ids: &[String]) -> Result<()> {
        for id in step_ids {
            self.done(id).await?;
        }
        Ok(())
    }

    /// Batch variant of [`pending`](Self::pending).
    ///
    /// # Errors
    ///
    /// Returns the first acknowledgement failure.
    pub async fn pendings(&self, step_ids: &[String]) -> Result<()> {
        for id in step_ids {
            self.pending(id).await?;
        }
        Ok(())
    }

    /// Batch variant of [`cancel`](Self::cancel).
    ///
    /// # Errors
    ///
    /// Returns the first acknowledgement failure.
    pub async fn cancels(&self, step_ids: &[String]) -> Result<()> {
        for id in step_ids {
            self.cancel(id).await?;
        }
        Ok(())
    }

    /// Batch variant of [`reset`](Self::reset).
    ///
    /// # Errors
    ///
    /// Returns the first acknowledgement failure.
    pub async fn resets(&self, step_ids: &[String]) -> Result<()> {
        for id in step_ids {
            self.reset(id).await?;
        }
        Ok(())
    }

    /// Records a worker failure for a step.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub does not acknowledge.
    pub async fn error(&self, step_id: &str, msg: &str, trace: &str) -> Result<()> {
        let body = serde_json::to_vec(&serde_json::json!({
            "step_id": step_id,
            "msg": msg,
            "trace": trace,
        }))
        .map_err(|err| Error::serialization(err.to_string()))?;
        self.mutate(Method::Error, body).await
    }

    /// Uploads one step with an explicit initial status.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub does not acknowledge.
    pub async fn upload_step(&self, step: &Step, status: StepStatus) -> Result<()> {
        let body = serde_json::to_vec(&(step, status.code()))
            .map_err(|err| Error::serialization(err.to_string()))?;
        self.mutate(Method::UploadStep, body).await
    }

    /// Uploads a batch of steps with their initial statuses.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub does not acknowledge.
    pub async fn upload_steps(&self, steps: &[Step], statuses: &[StepStatus]) -> Result<()> {
        let codes: Vec<i64> = statuses.iter().map(|status| status.code()).collect();
        let body = serde_json::to_vec(&(steps, codes))
            .map_err(|err| Error::serialization(err.to_string()))?;
        self.mutate(Method::UploadSteps, body).await
    }

    /// Grouped step counts by status name. Pass `"*"` to include terminal
    /// states.
    ///
    /// # Errors
    ///
    /// Returns an error once the retry budget is exhausted or the reply
    /// cannot be decoded.
    pub async fn step_count(&self, types: &str) -> Result<BTreeMap<String, i64>> {
        let body = serde_json::to_vec(&serde_json::json!({ "types": types }))
            .map_err(|err| Error::serialization(err.to_string()))?;
        let reply = self.request(Method::StepCount, body).await?;
        serde_json::from_slice(&reply)
            .map_err(|err| Error::serialization(format!("bad step-count reply: {err}")))
    }

    /// Flips errored (optionally stuck `working`) rows back to `pending`.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub does not acknowledge.
    pub async fn reset_errors(&self, include_working: bool) -> Result<()> {
        let body = if include_working { b"true".to_vec() } else { b"false".to_vec() };
        self.mutate(Method::ResetErrors, body).await
    }

    /// Administrative wipe of the metadata table.
    ///
    /// # Errors
    ///
    /// Returns an error if the hub does not acknowledge.
    pub async fn delete_steps(&self) -> Result<()> {
        let reply = self.request(Method::DeleteSteps, b"1".to_vec()).await?;
        expect_ok(&reply)
    }

    /// Errored rows with definitions attached:
    /// `{total, count, table}`.
    ///
    /// # Errors
    ///
    /// Returns an error once the retry budget is exhausted or the reply
    /// cannot be decoded.
    pub async fn fetch_errors(
        &self,
        count: usize,
        exclude: &[String],
    ) -> Result<serde_json::Value> {
        let body = serde_json::to_vec(&serde_json::json!({
            "count": count,
            "exclude": exclude,
        }))
        .map_err(|err| Error::serialization(err.to_string()))?;
        let reply = self.request(Method::FetchErrors, body).await?;
        serde_json::from_slice(&reply)
            .map_err(|err| Error::serialization(format!("bad fetch-errors reply: {err}")))
    }

    /// Runtime rows by id; `step_id` may be comma-separated.
    ///
    /// # Errors
    ///
    /// Returns an error once the retry budget is exhausted or the reply
    /// cannot be decoded.
    pub async fn fetch_rows(&self, step_id: &str) -> Result<Vec<StepRow>> {
        let body = serde_json::to_vec(&serde_json::json!({ "step_id": step_id }))
            .map_err(|err| Error::serialization(err.to_string()))?;
        let reply = self.request(Method::FetchRows, body).await?;
        serde_json::from_slice(&reply)
            .map_err(|err| Error::serialization(format!("bad fetch-rows reply: {err}")))
    }

    async fn mutate(&self, method: Method, body: Vec<u8>) -> Result<()> {
        let reply = self.request(method, body).await?;
        expect_ok(&reply)
    }

    /// One request with the doubling-deadline retry policy.
    async fn request(&self, method: Method, body: Vec<u8>) -> Result<Vec<u8>> {
        let payload = Request::new(method, body).encode().map_err(Error::from)?;

        let mut deadline = self.timeout;
        let mut last_err = Error::protocol("no attempts made");
        for attempt in 0..self.attempts.max(1) {
            if attempt > 0 {
                tracing::debug!(%method, attempt, ?deadline, "retrying request");
            }
            match tokio::time::timeout(deadline, roundtrip(&self.host, self.port, &payload)).await {
                Ok(Ok(reply)) => return Ok(reply),
                Ok(Err(err)) => last_err = err,
                Err(_) => {
                    last_err = Error::protocol(format!(
                        "{method} timed out after {}s",
                        deadline.as_secs()
                    ));
                }
            }
            deadline = deadline.saturating_mul(2);
        }
        Err(last_err)
    }
}

async fn roundtrip(host: &str, port: u16, payload: &[u8]) -> Result<Vec<u8>> {
    let mut stream = TcpStream::connect((host, port))
        .await
        .map_err(sluice_core::error::Error::from)?;
    stream
        .set_nodelay(true)
        .map_err(sluice_core::error::Error::from)?;

    write_frame(&mut stream, payload).await?;
    let reply = read_frame(&mut stream)
        .await?
        .ok_or_else(|| Error::protocol("hub closed the connection without a reply"))?;
    let _ = stream.shutdown().await;
    Ok(reply)
}

fn expect_ok(reply: &[u8]) -> Result<()> {
    if reply == OK_RESPONSE {
        Ok(())
    } else {
        Err(Error::protocol(format!(
            "hub did not acknowledge: {}",
            String::from_utf8_lossy(reply)
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expect_ok_accepts_only_the_ack() {
        assert!(expect_ok(b"ok").is_ok());
        assert!(expect_ok(b"unknown-method").is_err());
        assert!(expect_ok(b"").is_err());
    }

    #[tokio::test]
    async fn retry_budget_is_exhausted_against_a_dead_port() {
        // Port 9 on localhost is reliably closed; connects fail fast.
        let client = HubClient::new("127.0.0.1", 9)
            .with_timeout(Duration::from_millis(50))
            .with_attempts(2);
        let err = client.done("step-1").await.expect_err("must fail");
        // Connection refused, surfaced after the final attempt.
        assert!(!err.to_string().is_empty());
    }
}
