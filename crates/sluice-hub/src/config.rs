//! Environment-driven configuration for the hub and its clients.
//!
//! Everything has a working default so a bare `sluice-hub` starts a local
//! hub with an in-memory bucket; production deployments override via
//! environment variables.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sluice_core::bucket::{BucketStore, MemoryBucket, RemoteBucket};

use crate::error::{Error, Result};

/// Default hub listen port, shared with the worker fleet.
pub const DEFAULT_HUB_PORT: u16 = 65432;

/// Default bucket server port.
pub const DEFAULT_BUCKET_PORT: u16 = 61535;

/// Bucket backend selection.
#[derive(Debug, Clone)]
pub enum BucketConfig {
    /// Process-local bucket; state dies with the hub.
    Memory,
    /// External bucket server.
    Remote {
        /// Bucket server host.
        host: String,
        /// Bucket server port.
        port: u16,
    },
}

impl BucketConfig {
    /// Reads the backend selection from the environment.
    ///
    /// `SLUICE_BUCKET` picks the backend (`memory` is the default);
    /// `BUCKET_CLIENT_HOST`/`BUCKET_CLIENT_PORT` locate the remote server.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown backend name or an
    /// unparseable port.
    pub fn from_env() -> Result<Self> {
        match optional_env("SLUICE_BUCKET").as_deref() {
            None | Some("memory") => Ok(Self::Memory),
            Some("remote") => Ok(Self::Remote {
                host: optional_env("BUCKET_CLIENT_HOST").unwrap_or_else(|| "localhost".to_string()),
                port: parse_port(
                    optional_env("BUCKET_CLIENT_PORT").as_deref(),
                    "BUCKET_CLIENT_PORT",
                    DEFAULT_BUCKET_PORT,
                )?,
            }),
            Some(other) => Err(Error::configuration(format!(
                "unknown SLUICE_BUCKET backend: {other}"
            ))),
        }
    }

    /// Builds the configured bucket adapter.
    #[must_use]
    pub fn build(&self) -> Arc<dyn BucketStore> {
        match self {
            Self::Memory => Arc::new(MemoryBucket::new()),
            Self::Remote { host, port } => Arc::new(RemoteBucket::new(host.clone(), *port)),
        }
    }
}

/// Hub service configuration.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Listen address.
    pub host: String,
    /// Listen port.
    pub port: u16,
    /// Metadata store file.
    pub db_path: PathBuf,
    /// Durable transaction queue directory.
    pub queue_dir: PathBuf,
    /// Bucket backend.
    pub bucket: BucketConfig,
}

impl HubConfig {
    /// Reads the hub configuration from the environment.
    ///
    /// `PIPELINE_HOST`/`PIPELINE_PORT` set the listen address,
    /// `SLUICE_DB_PATH` and `SLUICE_QUEUE_DIR` place the persisted state.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for unparseable values.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            host: optional_env("PIPELINE_HOST").unwrap_or_else(|| "0.0.0.0".to_string()),
            port: parse_port(
                optional_env("PIPELINE_PORT").as_deref(),
                "PIPELINE_PORT",
                DEFAULT_HUB_PORT,
            )?,
            db_path: optional_env("SLUICE_DB_PATH")
                .map_or_else(|| PathBuf::from(".sluice/steps.db"), PathBuf::from),
            queue_dir: optional_env("SLUICE_QUEUE_DIR")
                .map_or_else(|| PathBuf::from(".sluice/transactions"), PathBuf::from),
            bucket: BucketConfig::from_env()?,
        })
    }
}

/// Worker-side client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Hub host.
    pub host: String,
    /// Hub port.
    pub port: u16,
    /// Initial per-request deadline; doubles on each retry.
    pub timeout: Duration,
    /// Attempts before giving up.
    pub attempts: u32,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_HUB_PORT,
            timeout: Duration::from_secs(300),
            attempts: 4,
        }
    }
}

impl ClientConfig {
    /// Reads the worker-facing client configuration from the environment
    /// (`PIPE_WORKER_HOST`/`PIPE_WORKER_PORT`).
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unparseable port.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            host: optional_env("PIPE_WORKER_HOST").unwrap_or(defaults.host),
            port: parse_port(
                optional_env("PIPE_WORKER_PORT").as_deref(),
                "PIPE_WORKER_PORT",
                defaults.port,
            )?,
            ..defaults
        })
    }
}

fn optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_port(value: Option<&str>, key: &str, default: u16) -> Result<u16> {
    match value {
        None => Ok(default),
        Some(raw) => raw
            .parse::<u16>()
            .map_err(|_| Error::configuration(format!("invalid {key}: {raw}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_port_defaults_when_unset() {
        assert_eq!(parse_port(None, "PIPELINE_PORT", 65432).expect("port"), 65432);
    }

    #[test]
    fn parse_port_rejects_garbage() {
        assert!(parse_port(Some("not-a-port"), "PIPELINE_PORT", 65432).is_err());
    }

    #[test]
    fn memory_bucket_builds() {
        let bucket = BucketConfig::Memory.build();
        // Just proving the trait object wires up.
        let _ = Arc::clone(&bucket);
    }

    #[test]
    fn client_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.port, DEFAULT_HUB_PORT);
        assert_eq!(config.attempts, 4);
    }
}
