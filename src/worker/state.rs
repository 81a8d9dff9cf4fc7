//! Per-worker communicator state.

use crate::comm::Communicator;
use crate::core::Rank;
use serde::{Deserialize, Serialize};

/// Lifecycle of a worker's communicator.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommState {
    /// No rendezvous has happened yet
    Uninitialized,
    /// A communicator session is live
    Initialized,
    /// The last session was closed; a new rendezvous may start
    Closed,
}

impl std::fmt::Display for CommState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CommState::Uninitialized => write!(f, "uninitialized"),
            CommState::Initialized => write!(f, "initialized"),
            CommState::Closed => write!(f, "closed"),
        }
    }
}

/// The communicator and client rank owned by one worker.
///
/// `client_rank` is `Some` exactly when `communicator` is `Some`; both are
/// set and cleared together.
#[derive(Default)]
pub struct WorkerCommunicatorState {
    communicator: Option<Box<dyn Communicator>>,
    client_rank: Option<Rank>,
    closed: bool,
}

impl WorkerCommunicatorState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> CommState {
        match (&self.communicator, self.closed) {
            (Some(_), _) => CommState::Initialized,
            (None, true) => CommState::Closed,
            (None, false) => CommState::Uninitialized,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.communicator.is_some()
    }

    pub fn communicator(&self) -> Option<&dyn Communicator> {
        self.communicator.as_deref()
    }

    pub fn client_rank(&self) -> Option<Rank> {
        self.client_rank
    }

    /// Store a freshly joined communicator.
    pub fn install(&mut self, communicator: Box<dyn Communicator>, client_rank: Rank) {
        self.communicator = Some(communicator);
        self.client_rank = Some(client_rank);
        self.closed = false;
    }

    /// Release the communicator, if any. Returns whether one was live.
    pub fn release(&mut self) -> bool {
        match self.communicator.take() {
            Some(communicator) => {
                drop(communicator);
                self.client_rank = None;
                self.closed = true;
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for WorkerCommunicatorState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerCommunicatorState")
            .field("state", &self.state())
            .field("client_rank", &self.client_rank)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_starts_uninitialized() {
        let state = WorkerCommunicatorState::new();
        assert_eq!(state.state(), CommState::Uninitialized);
        assert!(state.client_rank().is_none());
        assert!(state.communicator().is_none());
    }

    #[test]
    fn test_release_without_communicator_is_noop() {
        let mut state = WorkerCommunicatorState::new();
        assert!(!state.release());
        assert!(!state.release());
        assert_eq!(state.state(), CommState::Uninitialized);
    }
}
