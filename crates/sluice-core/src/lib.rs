//! # sluice-core
//!
//! Shared primitives for the Sluice pipeline coordination hub.
//!
//! This crate provides the types and adapters used by both the hub service
//! and its clients:
//!
//! - **Step Model**: Step definitions, runtime rows, and the status enum
//!   with its stable integer encoding
//! - **Wire Codec**: Sentinel-delimited framing and the method registry for
//!   the hub's TCP protocol
//! - **Bucket Adapters**: The blob-store contract with in-memory and remote
//!   implementations
//! - **Error Types**: Shared error definitions and result types
//!
//! ## Crate Boundary
//!
//! `sluice-core` defines the contracts shared between the hub and the worker
//! fleet. Anything scheduler- or storage-specific lives in `sluice-hub`.
//!
//! ## Example
//!
//! ```rust
//! use sluice_core::prelude::*;
//!
//! let step = Step::new("extract-orders", "production", "nightly-etl");
//! assert!(step.is_starter());
//! assert_eq!(StepStatus::Pending.code(), 1);
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod bucket;
pub mod error;
pub mod observability;
pub mod step;
pub mod wire;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::bucket::{step_data_key, step_key, BucketStore, MemoryBucket, RemoteBucket};
    pub use crate::error::{Error, Result};
    pub use crate::step::{Step, StepRow, StepStatus};
    pub use crate::wire::{read_frame, write_frame, Method, Request};
}
