//! Bucket (blob store) adapters.
//!
//! The bucket is an external key-value service holding step definitions
//! (`step/<id>`) and inter-step payload data (`step-data/<id>`). The hub
//! only needs get/put/delete, so the contract here is deliberately small:
//!
//! - [`BucketStore`]: The async contract
//! - [`MemoryBucket`]: Thread-safe in-memory implementation for tests and
//!   single-process deployments
//! - [`RemoteBucket`]: TCP client for the standalone bucket server
//!
//! A miss is `Ok(None)`, not an error: callers decide severity. A missing
//! step definition aborts a DAG traversal, while missing step data is a
//! recoverable condition for the worker.

use std::collections::HashMap;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::wire::{read_frame, write_frame};

/// Separator between fields of a bucket-protocol request.
pub const BUCKET_SPLIT: &[u8] = b"[*BUCKET_SPLIT_TOKEN*]";

/// Marker for "no value" in both directions of the bucket protocol.
const NULL_MARKER: &[u8] = b"__null__";

/// Prefix announcing an out-of-band large value: `__big__<byte count>`.
const BIG_MARKER: &[u8] = b"__big__";

/// Values at or above this size take the two-round-trip big path.
const INLINE_LIMIT: usize = 2048;

/// Bucket key for a step definition.
#[must_use]
pub fn step_key(id: &str) -> String {
    format!("step/{id}")
}

/// Bucket key for a step's output payload.
#[must_use]
pub fn step_data_key(id: &str) -> String {
    format!("step-data/{id}")
}

/// Blob-store contract used by the hub.
#[async_trait]
pub trait BucketStore: Send + Sync + 'static {
    /// Fetches a value. Returns `Ok(None)` if the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Stores a value, replacing any existing one.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Deletes a value. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// In-memory bucket for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryBucket {
    objects: RwLock<HashMap<String, Bytes>>,
}

impl MemoryBucket {
    /// Creates a new empty bucket.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Converts a lock poison error to a bucket error.
fn poison_err<T>(_: std::sync::PoisonError<T>) -> Error {
    Error::bucket("bucket lock poisoned")
}

#[async_trait]
impl BucketStore for MemoryBucket {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let objects = self.objects.read().map_err(poison_err)?;
        Ok(objects.get(key).cloned())
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let mut objects = self.objects.write().map_err(poison_err)?;
        objects.insert(key.to_string(), data);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut objects = self.objects.write().map_err(poison_err)?;
        objects.remove(key);
        Ok(())
    }
}

/// TCP client for the standalone bucket server.
///
/// One connection per operation. Requests are four fields joined by
/// [`BUCKET_SPLIT`] (`key`, `method`, timeout seconds, `data`) and framed
/// like every other message in the system. Values at or above the inline
/// limit use a size announcement plus acknowledged second frame in either
/// direction.
#[derive(Debug, Clone)]
pub struct RemoteBucket {
    host: String,
    port: u16,
    timeout: Duration,
}

impl RemoteBucket {
    /// Creates a client for the given bucket server address.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            timeout: Duration::from_secs(300),
        }
    }

    /// Sets the per-operation deadline.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn connect(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect((self.host.as_str(), self.port)).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    fn encode_call(&self, key: &str, method: &str, data: &[u8]) -> Vec<u8> {
        let timeout = self.timeout.as_secs().to_string();
        let mut out = Vec::with_capacity(key.len() + method.len() + timeout.len() + data.len() + 3 * BUCKET_SPLIT.len());
        for (i, field) in [key.as_bytes(), method.as_bytes(), timeout.as_bytes(), data]
            .into_iter()
            .enumerate()
        {
            if i > 0 {
                out.extend_from_slice(BUCKET_SPLIT);
            }
            out.extend_from_slice(field);
        }
        out
    }

    async fn get_inner(&self, key: &str) -> Result<Option<Bytes>> {
        let mut stream = self.connect().await?;
        write_frame(&mut stream, &self.encode_call(key, "get", NULL_MARKER)).await?;

        let reply = read_frame(&mut stream)
            .await?
            .ok_or_else(|| Error::bucket("bucket closed connection without a reply"))?;

        if reply == NULL_MARKER {
            return Ok(None);
        }
        if reply.starts_with(BIG_MARKER) {
            // Size announcement; acknowledge and take the value frame.
            write_frame(&mut stream, b"ok").await?;
            let value = read_frame(&mut stream)
                .await?
                .ok_or_else(|| Error::bucket("bucket closed connection mid large value"))?;
            return Ok(Some(Bytes::from(value)));
        }
        Ok(Some(Bytes::from(reply)))
    }

    async fn put_inner(&self, key: &str, data: &Bytes) -> Result<()> {
        let mut stream = self.connect().await?;
        if data.len() < INLINE_LIMIT {
            write_frame(&mut stream, &self.encode_call(key, "set", data)).await?;
            expect_ack(&mut stream).await?;
        } else {
            let announce = data.len().to_string();
            write_frame(&mut stream, &self.encode_call(key, "big-set", announce.as_bytes())).await?;
            expect_ack(&mut stream).await?;
            write_frame(&mut stream, data).await?;
            expect_ack(&mut stream).await?;
        }
        stream.shutdown().await?;
        Ok(())
    }

    async fn delete_inner(&self, key: &str) -> Result<()> {
        let mut stream = self.connect().await?;
        write_frame(&mut stream, &self.encode_call(key, "delete", NULL_MARKER)).await?;
        expect_ack(&mut stream).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

async fn expect_ack(stream: &mut TcpStream) -> Result<()> {
    let reply = read_frame(stream)
        .await?
        .ok_or_else(|| Error::bucket("bucket closed connection without an ack"))?;
    if reply != b"ok" {
        return Err(Error::bucket(format!(
            "unexpected bucket reply: {}",
            String::from_utf8_lossy(&reply)
        )));
    }
    Ok(())
}

#[async_trait]
impl BucketStore for RemoteBucket {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        tokio::time::timeout(self.timeout, self.get_inner(key))
            .await
            .map_err(|_| Error::bucket(format!("bucket get timed out for {key}")))?
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        tokio::time::timeout(self.timeout, self.put_inner(key, &data))
            .await
            .map_err(|_| Error::bucket(format!("bucket put timed out for {key}")))?
    }

    async fn delete(&self, key: &str) -> Result<()> {
        tokio::time::timeout(self.timeout, self.delete_inner(key))
            .await
            .map_err(|_| Error::bucket(format!("bucket delete timed out for {key}")))?
    }
}
