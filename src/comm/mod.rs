//! Collective Communication Module
//!
//! Trait seams for the communication primitive:
//! - `Rendezvous`: forms a group of `world_size` participants keyed by host/port
//! - `Communicator`: broadcast and barrier within a formed group
//! - `LocalRendezvous`: in-process implementation
//! - `create_rendezvous`: backend selection from configuration

pub mod communicator;
pub mod factory;
pub mod local;

pub use communicator::{Communicator, Rendezvous};
pub use factory::create_rendezvous;
pub use local::{LocalCommunicator, LocalRendezvous};
