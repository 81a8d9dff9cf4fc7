//! In-process engine with one actor task per worker.
//!
//! Every worker owns its [`WeightSyncWorker`] exclusively and processes
//! messages one at a time, the way a worker process drains its RPC queue.
//! Operations are enqueued on all workers under one lock so that every
//! worker sees collective operations in the same order.

use crate::comm::Rendezvous;
use crate::config::ParallelConfig;
use crate::core::{Error, Rank, Result};
use crate::engine::{CollectiveOutcome, Engine};
use crate::model::ParameterStore;
use crate::tensor::TensorBuffer;
use crate::worker::{WeightSyncWorker, WorkerOp, WorkerSnapshot};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

/// Message handled by a worker actor.
enum WorkerMessage {
    Rpc {
        op: WorkerOp,
        reply: oneshot::Sender<Result<()>>,
    },
    ResetPrefixCache {
        reply: oneshot::Sender<Result<()>>,
    },
    Snapshot {
        reply: oneshot::Sender<WorkerSnapshot>,
    },
    Parameter {
        name: String,
        reply: oneshot::Sender<Option<TensorBuffer>>,
    },
}

async fn run_worker(mut worker: WeightSyncWorker, mut rx: mpsc::UnboundedReceiver<WorkerMessage>) {
    tracing::debug!(rank = worker.rank(), "worker started");
    while let Some(message) = rx.recv().await {
        match message {
            WorkerMessage::Rpc { op, reply } => {
                let result = worker.handle(&op).await;
                if let Err(e) = &result {
                    tracing::warn!(rank = worker.rank(), op = op.name(), error = %e, "worker rpc failed");
                }
                let _ = reply.send(result);
            }
            WorkerMessage::ResetPrefixCache { reply } => {
                worker.reset_prefix_cache();
                let _ = reply.send(Ok(()));
            }
            WorkerMessage::Snapshot { reply } => {
                let _ = reply.send(worker.snapshot());
            }
            WorkerMessage::Parameter { name, reply } => {
                let _ = reply.send(worker.model().parameter(&name).cloned());
            }
        }
    }
    worker.close_communicator();
    tracing::debug!(rank = worker.rank(), "worker stopped");
}

/// Engine whose workers are tokio tasks in this process.
pub struct LocalEngine {
    workers: Vec<mpsc::UnboundedSender<WorkerMessage>>,
    parallel: ParallelConfig,
    /// Serializes enqueueing so every worker sees the same op order
    dispatch: Mutex<()>,
}

impl LocalEngine {
    /// Spawn `parallel.world_size()` workers, each with a model built by `model_for`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F>(parallel: ParallelConfig, rendezvous: Arc<dyn Rendezvous>, model_for: F) -> Self
    where
        F: Fn(Rank) -> Box<dyn ParameterStore>,
    {
        let workers = (0..parallel.world_size())
            .map(|rank| {
                let (tx, rx) = mpsc::unbounded_channel();
                let worker = WeightSyncWorker::new(rank, rendezvous.clone(), model_for(rank));
                tokio::spawn(run_worker(worker, rx));
                tx
            })
            .collect();

        tracing::info!(
            tensor_parallel_size = parallel.tensor_parallel_size,
            data_parallel_size = parallel.data_parallel_size,
            "local engine started"
        );

        Self {
            workers,
            parallel,
            dispatch: Mutex::new(()),
        }
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    fn enqueue<T, F>(&self, make: F) -> Vec<(Rank, Option<oneshot::Receiver<T>>)>
    where
        F: Fn(oneshot::Sender<T>) -> WorkerMessage,
    {
        let _order = self.dispatch.lock();
        self.workers
            .iter()
            .enumerate()
            .map(|(rank, tx)| {
                let (reply, rx) = oneshot::channel();
                let delivered = tx.send(make(reply)).is_ok();
                (rank as Rank, delivered.then_some(rx))
            })
            .collect()
    }

    async fn gather<T>(pending: Vec<(Rank, Option<oneshot::Receiver<T>>)>) -> Vec<(Rank, Result<T>)> {
        let replies = pending.into_iter().map(|(rank, rx)| async move {
            let result = match rx {
                Some(rx) => rx
                    .await
                    .map_err(|_| Error::Engine(format!("worker {} dropped the request", rank))),
                None => Err(Error::Engine(format!("worker {} is not running", rank))),
            };
            (rank, result)
        });
        futures::future::join_all(replies).await
    }

    /// Current state of every worker.
    pub async fn worker_snapshots(&self) -> Result<Vec<WorkerSnapshot>> {
        let pending = self.enqueue(|reply| WorkerMessage::Snapshot { reply });
        Self::gather(pending)
            .await
            .into_iter()
            .map(|(_, r)| r)
            .collect()
    }

    /// Value of a parameter on one worker.
    pub async fn parameter(&self, rank: Rank, name: &str) -> Result<Option<TensorBuffer>> {
        let tx = self
            .workers
            .get(rank as usize)
            .ok_or_else(|| Error::Engine(format!("no worker with rank {}", rank)))?;
        let (reply, rx) = oneshot::channel();
        tx.send(WorkerMessage::Parameter {
            name: name.to_string(),
            reply,
        })
        .map_err(|_| Error::Engine(format!("worker {} is not running", rank)))?;
        rx.await
            .map_err(|_| Error::Engine(format!("worker {} dropped the request", rank)))
    }
}

#[async_trait]
impl Engine for LocalEngine {
    async fn collective_rpc(&self, op: WorkerOp) -> Result<CollectiveOutcome> {
        tracing::debug!(%op, workers = self.workers.len(), "collective rpc");
        let pending = self.enqueue(|reply| WorkerMessage::Rpc {
            op: op.clone(),
            reply,
        });
        let results = Self::gather(pending)
            .await
            .into_iter()
            .map(|(rank, r)| (rank, r.and_then(|inner| inner)))
            .collect();
        Ok(CollectiveOutcome { results })
    }

    async fn reset_prefix_cache(&self) -> Result<()> {
        let pending = self.enqueue(|reply| WorkerMessage::ResetPrefixCache { reply });
        let results = Self::gather(pending)
            .await
            .into_iter()
            .map(|(rank, r)| (rank, r.and_then(|inner| inner)))
            .collect();
        CollectiveOutcome { results }.into_result()
    }

    fn parallel_config(&self) -> ParallelConfig {
        self.parallel.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::LocalRendezvous;
    use crate::core::RendezvousSpec;
    use crate::model::InMemoryModel;
    use crate::tensor::{DType, TensorSpec};
    use crate::worker::{CommState, WeightUpdateRequest};
    use std::time::Duration;

    fn engine(rdv: &LocalRendezvous, tp: u32, dp: u32) -> LocalEngine {
        LocalEngine::spawn(ParallelConfig::new(tp, dp), Arc::new(rdv.clone()), |_| {
            let model = InMemoryModel::new()
                .with_parameter("layer.weight", TensorSpec::new(DType::Float32, vec![4, 4]))
                .unwrap();
            Box::new(model) as Box<dyn ParameterStore>
        })
    }

    #[tokio::test]
    async fn test_spawns_world_size_workers() {
        let rdv = LocalRendezvous::new();
        let engine = engine(&rdv, 2, 2);
        assert_eq!(engine.num_workers(), 4);
        assert_eq!(engine.parallel_config().world_size(), 4);

        let snapshots = engine.worker_snapshots().await.unwrap();
        let ranks: Vec<Rank> = snapshots.iter().map(|s| s.rank).collect();
        assert_eq!(ranks, vec![0, 1, 2, 3]);
        assert!(snapshots.iter().all(|s| s.state == CommState::Uninitialized));
    }

    #[tokio::test]
    async fn test_update_before_init_fails_on_every_worker() {
        let rdv = LocalRendezvous::new();
        let engine = engine(&rdv, 2, 1);
        let request = WeightUpdateRequest::new("layer.weight", DType::Float32, vec![4, 4]);

        let outcome = engine
            .collective_rpc(WorkerOp::UpdateNamedParam(request))
            .await
            .unwrap();

        assert_eq!(outcome.failed_ranks(), vec![0, 1]);
        for (_, result) in &outcome.results {
            assert!(matches!(result, Err(Error::NotInitialized)));
        }
    }

    #[tokio::test]
    async fn test_init_and_close_through_rpc() {
        let rdv = LocalRendezvous::with_timeout(Duration::from_secs(5));
        let engine = engine(&rdv, 2, 1);
        let spec = RendezvousSpec::new("127.0.0.1", 29510, 3);

        let (outcome, client) = tokio::join!(
            engine.collective_rpc(WorkerOp::InitCommunicator(spec.clone())),
            rdv.join(&spec, 2)
        );
        assert!(outcome.unwrap().all_succeeded());
        let _client = client.unwrap();

        let snapshots = engine.worker_snapshots().await.unwrap();
        assert!(snapshots.iter().all(|s| s.client_rank == Some(2)));

        let outcome = engine.collective_rpc(WorkerOp::CloseCommunicator).await.unwrap();
        assert!(outcome.all_succeeded());
        let snapshots = engine.worker_snapshots().await.unwrap();
        assert!(snapshots.iter().all(|s| s.state == CommState::Closed));
    }

    #[tokio::test]
    async fn test_reset_prefix_cache_reaches_all_workers() {
        let rdv = LocalRendezvous::new();
        let engine = engine(&rdv, 1, 3);
        engine.reset_prefix_cache().await.unwrap();
        engine.reset_prefix_cache().await.unwrap();

        let snapshots = engine.worker_snapshots().await.unwrap();
        assert!(snapshots.iter().all(|s| s.prefix_cache_resets == 2));
    }

    #[tokio::test]
    async fn test_parameter_lookup() {
        let rdv = LocalRendezvous::new();
        let engine = engine(&rdv, 1, 1);
        let value = engine.parameter(0, "layer.weight").await.unwrap().unwrap();
        assert_eq!(value.numel(), 16);
        assert!(engine.parameter(0, "missing").await.unwrap().is_none());
        assert!(engine.parameter(5, "layer.weight").await.is_err());
    }
}
