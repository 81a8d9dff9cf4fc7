//! Server configuration.
//!
//! Values are supplied by the binary's command line; every section has a
//! usable default.

use crate::core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default cap on concurrent weight-update broadcasts.
pub const DEFAULT_MAX_CONCURRENT_WEIGHT_UPDATES: usize = 10;

/// Default cap on the size of one tensor in `update_named_param`, 8 GiB.
pub const DEFAULT_MAX_TENSOR_BYTES: u64 = 8 << 30;

/// Server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listening host
    pub host: String,
    /// Listening port
    pub port: u16,
    /// TLS material, if the listener should terminate TLS
    pub tls: Option<TlsConfig>,
    /// Engine parallelism
    pub parallel: ParallelConfig,
    /// Rendezvous backend workers and clients meet through
    pub rendezvous: RendezvousBackend,
    /// Concurrent `update_named_param` broadcasts allowed
    pub max_concurrent_weight_updates: usize,
    /// Largest tensor, in bytes, an update may announce
    pub max_tensor_bytes: u64,
    /// Time allowed for a rendezvous or a collective call
    pub rendezvous_timeout_secs: u64,
    /// Logging
    pub logging: LoggingConfig,
}

impl ServerConfig {
    /// Address to bind, as `host:port`.
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_secs(self.rendezvous_timeout_secs)
    }

    /// Reject configurations the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        self.parallel.validate()?;
        if self.max_concurrent_weight_updates == 0 {
            return Err(Error::Config(
                "max_concurrent_weight_updates must be at least 1".to_string(),
            ));
        }
        if self.max_tensor_bytes == 0 {
            return Err(Error::Config("max_tensor_bytes must be at least 1".to_string()));
        }
        if self.rendezvous_timeout_secs == 0 {
            return Err(Error::Config(
                "rendezvous_timeout_secs must be at least 1".to_string(),
            ));
        }
        if let Some(tls) = &self.tls {
            // TLS is terminated by the fronting transport layer.
            return Err(Error::Config(format!(
                "TLS termination is not handled by this listener (cert {}); terminate TLS in front of it",
                tls.cert_file.display()
            )));
        }
        Ok(())
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            tls: None,
            parallel: ParallelConfig::default(),
            rendezvous: RendezvousBackend::default(),
            max_concurrent_weight_updates: DEFAULT_MAX_CONCURRENT_WEIGHT_UPDATES,
            max_tensor_bytes: DEFAULT_MAX_TENSOR_BYTES,
            rendezvous_timeout_secs: 300,
            logging: LoggingConfig::default(),
        }
    }
}

/// TLS key material.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TlsConfig {
    pub key_file: PathBuf,
    pub cert_file: PathBuf,
    pub ca_file: Option<PathBuf>,
}

/// Engine parallelism.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParallelConfig {
    pub tensor_parallel_size: u32,
    pub data_parallel_size: u32,
}

impl ParallelConfig {
    pub fn new(tensor_parallel_size: u32, data_parallel_size: u32) -> Self {
        Self {
            tensor_parallel_size,
            data_parallel_size,
        }
    }

    /// Number of inference workers.
    pub fn world_size(&self) -> u32 {
        self.tensor_parallel_size * self.data_parallel_size
    }

    pub fn validate(&self) -> Result<()> {
        if self.tensor_parallel_size == 0 || self.data_parallel_size == 0 {
            return Err(Error::Config(format!(
                "parallel sizes must be positive (tp={}, dp={})",
                self.tensor_parallel_size, self.data_parallel_size
            )));
        }
        self.tensor_parallel_size
            .checked_mul(self.data_parallel_size)
            .map(|_| ())
            .ok_or_else(|| Error::Config("tp * dp overflows".to_string()))
    }
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self::new(1, 1)
    }
}

/// Rendezvous backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RendezvousBackend {
    /// Groups formed inside this process
    #[default]
    Local,
}

/// Log output format.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Compact single-line text
    Text,
    /// One JSON object per line
    Json,
}

/// Logging configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    pub level: String,
    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_concurrent_weight_updates, 10);
        assert_eq!(config.max_tensor_bytes, 8 * 1024 * 1024 * 1024);
        assert_eq!(config.parallel.world_size(), 1);
        assert_eq!(config.bind_address(), "0.0.0.0:8000");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_world_size_is_product() {
        assert_eq!(ParallelConfig::new(4, 2).world_size(), 8);
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let mut config = ServerConfig::default();
        config.parallel = ParallelConfig::new(0, 2);
        assert!(config.validate().is_err());

        let config = ServerConfig {
            max_concurrent_weight_updates: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = ServerConfig {
            max_tensor_bytes: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_tls() {
        let config = ServerConfig {
            tls: Some(TlsConfig {
                key_file: "server.key".into(),
                cert_file: "server.crt".into(),
                ca_file: None,
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deserialize_partial() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"port": 9000, "parallel": {"tensor_parallel_size": 2, "data_parallel_size": 1}}"#)
                .unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.parallel.world_size(), 2);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.rendezvous, RendezvousBackend::Local);
    }
}
