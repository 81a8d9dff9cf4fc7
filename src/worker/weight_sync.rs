//! Worker-side weight synchronization.
//!
//! Each inference worker owns one [`WeightSyncWorker`]. It joins the
//! client's communication group, receives broadcast tensors and loads them
//! into the live model.

use crate::comm::Rendezvous;
use crate::core::{Error, Rank, RendezvousSpec, Result};
use crate::model::ParameterStore;
use crate::tensor::TensorBuffer;
use crate::worker::ops::{WeightUpdateRequest, WorkerOp};
use crate::worker::state::{CommState, WorkerCommunicatorState};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Point-in-time view of a worker, for inspection.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerSnapshot {
    pub rank: Rank,
    pub state: CommState,
    pub client_rank: Option<Rank>,
    pub model_version: u64,
    pub prefix_cache_resets: u64,
}

/// Weight-sync extension of one inference worker.
pub struct WeightSyncWorker {
    /// Rank inside the server's worker group
    rank: Rank,
    /// Rendezvous used to reach the client's group
    rendezvous: Arc<dyn Rendezvous>,
    /// Live model
    model: Box<dyn ParameterStore>,
    /// Communicator session
    comm: WorkerCommunicatorState,
    prefix_cache_resets: u64,
}

impl WeightSyncWorker {
    /// Create a worker at `rank` serving `model`.
    pub fn new(rank: Rank, rendezvous: Arc<dyn Rendezvous>, model: Box<dyn ParameterStore>) -> Self {
        Self {
            rank,
            rendezvous,
            model,
            comm: WorkerCommunicatorState::new(),
            prefix_cache_resets: 0,
        }
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    pub fn state(&self) -> CommState {
        self.comm.state()
    }

    pub fn client_rank(&self) -> Option<Rank> {
        self.comm.client_rank()
    }

    pub fn model(&self) -> &dyn ParameterStore {
        self.model.as_ref()
    }

    /// Join the client's communication group.
    ///
    /// The client always takes the highest rank, so a worker whose rank
    /// reaches it cannot participate.
    pub async fn init_communicator(&mut self, spec: &RendezvousSpec) -> Result<()> {
        if self.comm.is_initialized() {
            return Err(Error::AlreadyInitialized);
        }

        let client_rank = spec.client_rank();
        if self.rank >= client_rank {
            return Err(Error::RendezvousFailure(format!(
                "worker rank {} collides with client rank {} for world_size {}",
                self.rank, client_rank, spec.world_size
            )));
        }

        let communicator = self.rendezvous.join(spec, self.rank).await?;
        self.comm.install(communicator, client_rank);

        tracing::info!(rank = self.rank, client_rank, %spec, "weight update communicator initialized");
        Ok(())
    }

    /// Receive one tensor from the client and load it into the model.
    ///
    /// Allocation, broadcast, barrier and load run strictly in that order.
    /// The tensor is checked against the model only after the barrier, so
    /// a rejected update still consumes its broadcast on every rank.
    pub async fn update_named_param(&mut self, request: &WeightUpdateRequest) -> Result<()> {
        let communicator = self.comm.communicator().ok_or(Error::NotInitialized)?;
        let client_rank = self.comm.client_rank().ok_or(Error::NotInitialized)?;

        let spec = request.spec();
        let registered = self.model.parameter_spec(&request.name);
        if registered.as_ref() != Some(&spec) {
            tracing::warn!(
                rank = self.rank,
                name = %request.name,
                announced = %spec,
                registered = ?registered,
                "update does not match the model and will be rejected after the barrier"
            );
        }

        let mut weight = TensorBuffer::zeros(spec)?;
        communicator.broadcast(&mut weight, client_rank).await?;
        communicator.barrier().await?;

        self.model.load_weights(vec![(request.name.clone(), weight)])?;

        tracing::debug!(
            rank = self.rank,
            name = %request.name,
            dtype = %request.dtype,
            shape = ?request.shape,
            version = self.model.version(),
            "applied weight update"
        );
        Ok(())
    }

    /// Release the communicator. Safe to call in any state.
    pub fn close_communicator(&mut self) {
        if self.comm.release() {
            tracing::info!(rank = self.rank, "weight update communicator closed");
        }
    }

    /// Drop cached prefixes; they were computed with the old weights.
    pub fn reset_prefix_cache(&mut self) {
        self.prefix_cache_resets += 1;
        tracing::debug!(rank = self.rank, "prefix cache reset");
    }

    /// Execute an operation sent through `collective_rpc`.
    pub async fn handle(&mut self, op: &WorkerOp) -> Result<()> {
        match op {
            WorkerOp::InitCommunicator(spec) => self.init_communicator(spec).await,
            WorkerOp::UpdateNamedParam(request) => self.update_named_param(request).await,
            WorkerOp::CloseCommunicator => {
                self.close_communicator();
                Ok(())
            }
        }
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            rank: self.rank,
            state: self.comm.state(),
            client_rank: self.comm.client_rank(),
            model_version: self.model.version(),
            prefix_cache_resets: self.prefix_cache_resets,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalRendezvous;
    use crate::model::InMemoryModel;
    use crate::tensor::{DType, TensorSpec};
    use std::time::Duration;

    fn worker(rank: Rank, rdv: &LocalRendezvous) -> WeightSyncWorker {
        let model = InMemoryModel::new()
            .with_parameter("layer.weight", TensorSpec::new(DType::Float32, vec![4, 4]))
            .unwrap();
        WeightSyncWorker::new(rank, Arc::new(rdv.clone()), Box::new(model) as Box<dyn ParameterStore>)
    }

    #[tokio::test]
    async fn test_init_update_close() {
        let rdv = LocalRendezvous::with_timeout(Duration::from_secs(5));
        let spec = RendezvousSpec::new("127.0.0.1", 29500, 3);
        let mut w0 = worker(0, &rdv);
        let mut w1 = worker(1, &rdv);

        let (r0, r1, client) = tokio::join!(
            w0.init_communicator(&spec),
            w1.init_communicator(&spec),
            rdv.join(&spec, 2)
        );
        r0.unwrap();
        r1.unwrap();
        let client = client.unwrap();
        assert_eq!(w0.state(), CommState::Initialized);
        assert_eq!(w1.client_rank(), Some(2));

        let values: Vec<f32> = (0..16).map(|i| i as f32).collect();
        let request = WeightUpdateRequest::new("layer.weight", DType::Float32, vec![4, 4]);
        let mut source = TensorBuffer::from_f32(vec![4, 4], &values).unwrap();

        let (u0, u1, sent) = tokio::join!(
            w0.update_named_param(&request),
            w1.update_named_param(&request),
            async {
                client.broadcast(&mut source, 2).await?;
                client.barrier().await
            }
        );
        u0.unwrap();
        u1.unwrap();
        sent.unwrap();

        for w in [&w0, &w1] {
            let applied = w.model().parameter("layer.weight").unwrap();
            assert_eq!(applied.to_f32_vec().unwrap(), values);
            assert_eq!(w.model().version(), 1);
        }

        w0.close_communicator();
        w1.close_communicator();
        assert_eq!(w0.state(), CommState::Closed);
        assert!(w1.client_rank().is_none());
    }

    #[tokio::test]
    async fn test_update_before_init_fails() {
        let rdv = LocalRendezvous::new();
        let mut w = worker(0, &rdv);
        let request = WeightUpdateRequest::new("layer.weight", DType::Float32, vec![4, 4]);
        let err = w.update_named_param(&request).await.unwrap_err();
        assert!(matches!(err, Error::NotInitialized));
    }

    #[tokio::test]
    async fn test_second_init_rejected() {
        let rdv = LocalRendezvous::with_timeout(Duration::from_secs(5));
        let spec = RendezvousSpec::new("127.0.0.1", 29501, 2);
        let mut w = worker(0, &rdv);

        let (r, client) = tokio::join!(w.init_communicator(&spec), rdv.join(&spec, 1));
        r.unwrap();
        let _client = client.unwrap();

        let err = w.init_communicator(&spec).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyInitialized));
        assert_eq!(w.state(), CommState::Initialized);
        assert_eq!(w.client_rank(), Some(1));
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let rdv = LocalRendezvous::new();
        let mut w = worker(0, &rdv);
        for _ in 0..3 {
            w.close_communicator();
        }
        assert_eq!(w.state(), CommState::Uninitialized);
        assert!(w.handle(&WorkerOp::CloseCommunicator).await.is_ok());
    }

    #[tokio::test]
    async fn test_reinit_after_close() {
        let rdv = LocalRendezvous::with_timeout(Duration::from_secs(5));
        let mut w = worker(0, &rdv);

        for port in [29504, 29505] {
            let spec = RendezvousSpec::new("127.0.0.1", port, 2);
            let (r, client) = tokio::join!(w.init_communicator(&spec), rdv.join(&spec, 1));
            r.unwrap();
            drop(client.unwrap());
            assert_eq!(w.state(), CommState::Initialized);

            w.close_communicator();
            assert_eq!(w.state(), CommState::Closed);
        }
        assert_eq!(rdv.group_count(), 0);
    }

    #[tokio::test]
    async fn test_worker_rank_cannot_take_client_slot() {
        let rdv = LocalRendezvous::new();
        let mut w = worker(1, &rdv);
        let spec = RendezvousSpec::new("127.0.0.1", 29502, 2);
        let err = w.init_communicator(&spec).await.unwrap_err();
        assert!(matches!(err, Error::RendezvousFailure(_)));
        assert_eq!(w.state(), CommState::Uninitialized);
    }

    #[tokio::test]
    #[cfg(target_pointer_width = "64")]
    async fn test_unallocatable_update_leaves_worker_usable() {
        let rdv = LocalRendezvous::with_timeout(Duration::from_secs(5));
        let spec = RendezvousSpec::new("127.0.0.1", 29506, 2);
        let mut w = worker(0, &rdv);
        let (r, client) = tokio::join!(w.init_communicator(&spec), rdv.join(&spec, 1));
        r.unwrap();
        let client = client.unwrap();

        let huge = WeightUpdateRequest::new("layer.weight", DType::Int8, vec![1 << 63]);
        assert!(matches!(w.update_named_param(&huge).await, Err(Error::Engine(_))));
        assert_eq!(w.state(), CommState::Initialized);

        // The failed allocation happened before the broadcast, so the group is still in step.
        let request = WeightUpdateRequest::new("layer.weight", DType::Float32, vec![4, 4]);
        let mut source = TensorBuffer::from_f32(vec![4, 4], &[3.0; 16]).unwrap();
        let (u, sent) = tokio::join!(w.update_named_param(&request), async {
            client.broadcast(&mut source, 1).await?;
            client.barrier().await
        });
        u.unwrap();
        sent.unwrap();
        assert_eq!(w.model().version(), 1);
    }

    #[tokio::test]
    async fn test_mismatched_update_is_rejected_after_barrier() {
        let rdv = LocalRendezvous::with_timeout(Duration::from_secs(5));
        let spec = RendezvousSpec::new("127.0.0.1", 29503, 2);
        let mut w = worker(0, &rdv);
        let (r, client) = tokio::join!(w.init_communicator(&spec), rdv.join(&spec, 1));
        r.unwrap();
        let client = client.unwrap();

        let request = WeightUpdateRequest::new("layer.weight", DType::Float32, vec![2, 2]);
        let mut source = TensorBuffer::from_f32(vec![2, 2], &[9.0; 4]).unwrap();
        let (u, sent) = tokio::join!(w.update_named_param(&request), async {
            client.broadcast(&mut source, 1).await?;
            client.barrier().await
        });

        assert!(matches!(u, Err(Error::ShapeMismatch { .. })));
        assert!(sent.is_ok());
        assert_eq!(w.model().version(), 0);
    }
}
