//! Common types used across weightsync modules.

use serde::{Deserialize, Serialize};

/// Position of a participant inside a communication group.
pub type Rank = u32;

/// Rendezvous parameters shared by every worker and the client for one epoch.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RendezvousSpec {
    /// Host of the rendezvous store
    pub host: String,
    /// Port of the rendezvous store
    pub port: u16,
    /// Total participants: every worker plus the external client
    pub world_size: u32,
}

impl RendezvousSpec {
    /// Create a new rendezvous spec.
    pub fn new(host: &str, port: u16, world_size: u32) -> Self {
        Self {
            host: host.to_string(),
            port,
            world_size,
        }
    }

    /// Rank reserved for the external client, always the highest.
    pub fn client_rank(&self) -> Rank {
        self.world_size.saturating_sub(1)
    }

    /// Check the fields that can be judged without contacting anyone.
    pub fn validate(&self) -> crate::core::Result<()> {
        if self.host.trim().is_empty() {
            return Err(crate::core::Error::InvalidRequest(
                "host must not be empty".to_string(),
            ));
        }
        if self.world_size < 2 {
            return Err(crate::core::Error::InvalidRequest(format!(
                "world_size must be at least 2 (one worker and the client), got {}",
                self.world_size
            )));
        }
        Ok(())
    }

    /// Key identifying the rendezvous group.
    pub fn key(&self) -> (String, u16) {
        (self.host.clone(), self.port)
    }
}

impl std::fmt::Display for RendezvousSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{} (world_size={})", self.host, self.port, self.world_size)
    }
}

/// Timestamp wrapper for consistent serialization.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Get current UTC timestamp.
pub fn now() -> Timestamp {
    chrono::Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_rank_is_highest() {
        let spec = RendezvousSpec::new("127.0.0.1", 29500, 3);
        assert_eq!(spec.client_rank(), 2);
    }

    #[test]
    fn test_validate_rejects_small_world() {
        assert!(RendezvousSpec::new("127.0.0.1", 29500, 1).validate().is_err());
        assert!(RendezvousSpec::new("  ", 29500, 3).validate().is_err());
        assert!(RendezvousSpec::new("127.0.0.1", 29500, 2).validate().is_ok());
    }

    #[test]
    fn test_display() {
        let spec = RendezvousSpec::new("10.0.0.1", 51216, 9);
        assert_eq!(spec.to_string(), "10.0.0.1:51216 (world_size=9)");
    }
}
