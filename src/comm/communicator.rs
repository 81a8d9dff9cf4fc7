//! Communicator and Rendezvous trait definitions.
//!
//! The collective-communication primitive is consumed only through these
//! two traits; the weight-sync protocol never touches its wire format.

use crate::core::{Rank, RendezvousSpec, Result};
use crate::tensor::TensorBuffer;
use async_trait::async_trait;

/// One live collective-communication session.
///
/// Collective calls must be issued in the same order by every member of
/// the group. After a collective fails on any rank, every later collective
/// on the session fails too; the group has to be formed again.
#[async_trait]
pub trait Communicator: Send + Sync {
    /// This participant's rank.
    fn rank(&self) -> Rank;

    /// Number of participants in the group.
    fn world_size(&self) -> u32;

    /// Broadcast `buffer` from `src` to every other rank.
    ///
    /// On `src` the buffer is read; on every other rank it is overwritten
    /// with the source's contents.
    async fn broadcast(&self, buffer: &mut TensorBuffer, src: Rank) -> Result<()>;

    /// Block until every rank in the group has arrived.
    async fn barrier(&self) -> Result<()>;
}

/// Forms communication groups outside the server's own compute group.
#[async_trait]
pub trait Rendezvous: Send + Sync {
    /// Join the group keyed by `(spec.host, spec.port)` as `rank`.
    ///
    /// Resolves once all `spec.world_size` participants have joined.
    async fn join(&self, spec: &RendezvousSpec, rank: Rank) -> Result<Box<dyn Communicator>>;
}
