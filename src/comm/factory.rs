//! Rendezvous factory.
//!
//! Creates the rendezvous backend named by configuration.

use crate::comm::communicator::Rendezvous;
use crate::comm::local::LocalRendezvous;
use crate::config::{RendezvousBackend, ServerConfig};
use crate::core::Result;
use std::sync::Arc;

/// Create the rendezvous backend for `config`.
pub fn create_rendezvous(config: &ServerConfig) -> Result<Arc<dyn Rendezvous>> {
    match config.rendezvous {
        RendezvousBackend::Local => {
            let rendezvous = LocalRendezvous::with_timeout(config.rendezvous_timeout());
            Ok(Arc::new(rendezvous) as Arc<dyn Rendezvous>)
        }
    }
}
