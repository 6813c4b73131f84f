//! Durable FIFO of mutation requests.
//!
//! The dispatcher acknowledges a write as soon as the mutation is on disk
//! here; the state-machine executor drains the queue and applies items
//! serially. One JSON file per item, named by a zero-padded sequence
//! number so directory order is apply order.
//!
//! Delivery is at-least-once: [`TransactionQueue::next`] hands out the
//! oldest item without removing it, and the consumer calls
//! [`TransactionQueue::commit`] only after the apply finishes. A crash
//! between the two replays the item on restart, which is safe because
//! every mutation is idempotent (absolute-state updates, or inserts that
//! tolerate a duplicate id).

use std::collections::VecDeque;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use sluice_core::wire::Method;

use crate::error::{Error, Result};

/// One queued mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxItem {
    /// Wire method literal.
    pub method: String,
    /// Request body as received, UTF-8 text (ids or JSON documents).
    pub payload: String,
}

impl TxItem {
    /// Resolves the stored method literal.
    ///
    /// # Errors
    ///
    /// Returns an error if the literal is no longer part of the protocol.
    pub fn method(&self) -> Result<Method> {
        Ok(Method::parse(&self.method)?)
    }
}

/// Receipt for an item handed out by [`TransactionQueue::next`]; spend it
/// with [`TransactionQueue::commit`] once the apply has finished.
#[derive(Debug)]
pub struct TxToken {
    seq: u64,
}

impl TxToken {
    /// Sequence number of the item this receipt refers to.
    #[must_use]
    pub const fn seq(&self) -> u64 {
        self.seq
    }
}

#[derive(Debug)]
struct QueueState {
    pending: VecDeque<u64>,
    next_seq: u64,
}

/// Durable transaction queue backed by a directory of JSON files.
#[derive(Debug)]
pub struct TransactionQueue {
    dir: PathBuf,
    state: Mutex<QueueState>,
    notify: Notify,
}

impl TransactionQueue {
    /// Opens the queue, creating the directory if needed and rescanning
    /// any items left over from a previous process.
    ///
    /// # Errors
    ///
    /// Returns a queue error if the directory cannot be created or read.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)
            .map_err(|err| Error::queue_with_source("cannot create queue directory", err))?;

        let mut pending = Vec::new();
        let entries = std::fs::read_dir(&dir)
            .map_err(|err| Error::queue_with_source("cannot scan queue directory", err))?;
        for entry in entries {
            let entry = entry.map_err(|err| Error::queue_with_source("cannot scan queue entry", err))?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".json")) else {
                continue;
            };
            if let Ok(seq) = stem.parse::<u64>() {
                pending.push(seq);
            }
        }
        pending.sort_unstable();
        let next_seq = pending.last().map_or(0, |last| last + 1);

        Ok(Self {
            dir,
            state: Mutex::new(QueueState {
                pending: pending.into(),
                next_seq,
            }),
            notify: Notify::new(),
        })
    }

    /// Appends one mutation, fsyncing before returning. The ack to the
    /// client must not be sent before this returns.
    ///
    /// # Errors
    ///
    /// Returns a queue error if the item cannot be persisted, and a
    /// serialization error for a non-UTF-8 body (mutation bodies are ids
    /// or JSON documents by protocol).
    pub fn push(&self, method: Method, payload: &[u8]) -> Result<u64> {
        let payload = std::str::from_utf8(payload)
            .map_err(|_| Error::serialization("mutation body is not UTF-8"))?;
        let item = TxItem {
            method: method.as_str().to_string(),
            payload: payload.to_string(),
        };
        let encoded = serde_json::to_vec(&item)
            .map_err(|err| Error::serialization(format!("cannot encode queue item: {err}")))?;

        let seq = {
            let mut state = self.lock()?;
            let seq = state.next_seq;
            state.next_seq += 1;
            seq
        };

        let path = self.item_path(seq);
        let mut file = std::fs::File::create(&path)
            .map_err(|err| Error::queue_with_source("cannot create queue item", err))?;
        file.write_all(&encoded)
            .map_err(|err| Error::queue_with_source("cannot write queue item", err))?;
        file.sync_all()
            .map_err(|err| Error::queue_with_source("cannot sync queue item", err))?;

        self.lock()?.pending.push_back(seq);
        self.notify.notify_one();
        Ok(seq)
    }

    /// Waits for and returns the oldest item without removing it.
    ///
    /// An unreadable item (truncated write from a crash) is dropped with a
    /// warning rather than wedging the queue.
    ///
    /// # Errors
    ///
    /// Returns a queue error if the backing directory fails.
    pub async fn next(&self) -> Result<(TxItem, TxToken)> {
        loop {
            let notified = self.notify.notified();

            let front = self.lock()?.pending.front().copied();
            if let Some(seq) = front {
                let path = self.item_path(seq);
                match std::fs::read(&path) {
                    Ok(bytes) => match serde_json::from_slice::<TxItem>(&bytes) {
                        Ok(item) => return Ok((item, TxToken { seq })),
                        Err(err) => {
                            tracing::warn!(seq, error = %err, "dropping undecodable queue item");
                            self.discard(seq)?;
                            continue;
                        }
                    },
                    Err(err) => {
                        tracing::warn!(seq, error = %err, "dropping unreadable queue item");
                        self.discard(seq)?;
                        continue;
                    }
                }
            }

            notified.await;
        }
    }

    /// Removes an applied item.
    ///
    /// # Errors
    ///
    /// Returns a queue error if the file cannot be removed.
    pub fn commit(&self, token: TxToken) -> Result<()> {
        self.discard(token.seq)
    }

    /// Current backlog.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.state.lock().map_or(0, |state| state.pending.len())
    }

    fn discard(&self, seq: u64) -> Result<()> {
        let path = self.item_path(seq);
        match std::fs::remove_file(&path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(Error::queue_with_source("cannot remove queue item", err)),
        }
        let mut state = self.lock()?;
        if let Some(pos) = state.pending.iter().position(|&s| s == seq) {
            state.pending.remove(pos);
        }
        Ok(())
    }

    fn item_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{seq:020}.json"))
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| Error::queue("queue lock poisoned"))
    }
}
