//! # sluice-hub
//!
//! The coordination hub of the Sluice pipeline orchestrator.
//!
//! Workers across the fleet poll the hub over a small TCP protocol for
//! runnable steps; the hub is the single source of truth for step state,
//! dependency-aware transitions, and per-tag throughput caps. This crate
//! provides:
//!
//! - **Metadata Store**: SQLite table of step runtime state with the
//!   indexed queries the scheduler needs
//! - **Transaction Pipeline**: Durable FIFO of mutations, acknowledged on
//!   enqueue and applied serially by the state-machine executor
//! - **Scheduler**: Priority/recency ranking with tag-velocity admission
//!   and lease reclaim for stuck work
//! - **Request Dispatcher**: TCP front end routing reads inline and
//!   writes through the durable queue
//! - **Hub Client**: The polling client used by workers and CLIs
//!
//! ## Guarantees
//!
//! - Mutations apply in durable-queue order; serial apply gives a total
//!   order over state transitions
//! - An acknowledged write survives a hub crash (at-least-once apply over
//!   idempotent mutations)
//! - A leased step is `working` before any other `get-steps` can see it

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod governor;
pub mod metrics;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod txqueue;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::client::HubClient;
    pub use crate::config::{BucketConfig, ClientConfig, HubConfig};
    pub use crate::error::{Error, Result};
    pub use crate::executor::MutationExecutor;
    pub use crate::governor::VelocityGovernor;
    pub use crate::scheduler::{LeaseOptions, Scheduler, LEASE_SECONDS};
    pub use crate::server::HubServer;
    pub use crate::store::StepStore;
    pub use crate::txqueue::TransactionQueue;
}
