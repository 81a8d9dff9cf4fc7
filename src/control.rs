//! Control-plane façade.
//!
//! Request validation happens here, synchronously; everything that touches
//! the workers is handed to the [`TaskSupervisor`] and acknowledged before
//! it runs. The façade keeps no communicator state of its own.

use crate::config::DEFAULT_MAX_TENSOR_BYTES;
use crate::core::{Error, RendezvousSpec, Result};
use crate::engine::Engine;
use crate::supervisor::{DrainReport, SupervisorStats, TaskId, TaskKind, TaskSupervisor};
use crate::tensor::{DType, TensorSpec};
use crate::throttle::UpdateThrottle;
use crate::worker::{WeightUpdateRequest, WorkerOp};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Body of `POST /init_communicator`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InitCommunicatorRequest {
    pub host: String,
    pub port: u16,
    pub world_size: u32,
}

/// Body of `POST /update_named_param`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct UpdateNamedParamRequest {
    pub name: String,
    /// Either `"float32"` or a qualified name like `"torch.float32"`
    pub dtype: String,
    pub shape: Vec<u64>,
}

/// Acknowledgement returned by every mutating endpoint and `/health`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
}

impl StatusResponse {
    pub fn ok() -> Self {
        Self {
            status: "ok".to_string(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorldSizeResponse {
    pub world_size: u32,
}

/// Body of every error response.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Body of `GET /stats`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatsResponse {
    pub tasks: SupervisorStats,
    pub updates_in_flight: usize,
}

impl UpdateNamedParamRequest {
    /// Parse into the worker-side request.
    ///
    /// Only syntax and size are checked; whether the model has such a
    /// parameter is decided by each worker after the broadcast. Every
    /// worker allocates the announced tensor, so its size is capped at
    /// `max_tensor_bytes`.
    pub fn parse(&self, max_tensor_bytes: u64) -> Result<WeightUpdateRequest> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidRequest("parameter name must not be empty".to_string()));
        }
        let dtype: DType = self.dtype.parse()?;
        let spec = TensorSpec::new(dtype, self.shape.clone());
        let bytes = spec.byte_len()?;
        if bytes as u64 > max_tensor_bytes {
            return Err(Error::InvalidRequest(format!(
                "{} needs {} bytes, above the limit of {} bytes",
                spec, bytes, max_tensor_bytes
            )));
        }
        Ok(WeightUpdateRequest::new(&self.name, dtype, self.shape.clone()))
    }
}

impl From<InitCommunicatorRequest> for RendezvousSpec {
    fn from(request: InitCommunicatorRequest) -> Self {
        RendezvousSpec {
            host: request.host,
            port: request.port,
            world_size: request.world_size,
        }
    }
}

/// Weight-sync control plane over an inference engine.
pub struct ControlPlane {
    engine: Arc<dyn Engine>,
    supervisor: TaskSupervisor,
    throttle: UpdateThrottle,
    max_tensor_bytes: u64,
}

impl ControlPlane {
    /// Create a control plane dispatching to `engine`, with weight updates
    /// bounded by `throttle`.
    pub fn new(engine: Arc<dyn Engine>, throttle: UpdateThrottle) -> Self {
        Self {
            engine,
            supervisor: TaskSupervisor::new(),
            throttle,
            max_tensor_bytes: DEFAULT_MAX_TENSOR_BYTES,
        }
    }

    /// Cap the size of a single announced tensor.
    pub fn with_max_tensor_bytes(mut self, max_tensor_bytes: u64) -> Self {
        self.max_tensor_bytes = max_tensor_bytes;
        self
    }

    pub fn health(&self) -> StatusResponse {
        StatusResponse::ok()
    }

    /// Number of inference workers, `tp * dp`.
    pub fn world_size(&self) -> u32 {
        self.engine.parallel_config().world_size()
    }

    pub fn supervisor(&self) -> &TaskSupervisor {
        &self.supervisor
    }

    pub fn throttle(&self) -> &UpdateThrottle {
        &self.throttle
    }

    /// Schedule every worker to join the client's group.
    pub fn init_communicator(&self, request: InitCommunicatorRequest) -> Result<TaskId> {
        let spec = RendezvousSpec::from(request);
        spec.validate()?;

        let engine = self.engine.clone();
        self.supervisor.spawn(TaskKind::InitCommunicator, async move {
            engine
                .collective_rpc(WorkerOp::InitCommunicator(spec))
                .await?
                .into_result()
        })
    }

    /// Schedule every worker to receive one named tensor.
    ///
    /// The broadcast starts only once a throttle lease is held; the lease
    /// is returned when the collective call finishes, whatever its result.
    pub fn update_named_param(&self, request: UpdateNamedParamRequest) -> Result<TaskId> {
        let request = request.parse(self.max_tensor_bytes)?;

        let engine = self.engine.clone();
        let throttle = self.throttle.clone();
        self.supervisor.spawn(TaskKind::UpdateNamedParam, async move {
            let _lease = throttle.acquire().await?;
            engine
                .collective_rpc(WorkerOp::UpdateNamedParam(request))
                .await?
                .into_result()
        })
    }

    pub fn reset_prefix_cache(&self) -> Result<TaskId> {
        let engine = self.engine.clone();
        self.supervisor.spawn(TaskKind::ResetPrefixCache, async move {
            engine.reset_prefix_cache().await
        })
    }

    /// Schedule every worker to release its communicator. Idempotent.
    pub fn close_communicator(&self) -> Result<TaskId> {
        let engine = self.engine.clone();
        self.supervisor.spawn(TaskKind::CloseCommunicator, async move {
            engine
                .collective_rpc(WorkerOp::CloseCommunicator)
                .await?
                .into_result()
        })
    }

    /// Cancel every scheduled task and wait for all of them.
    pub async fn shutdown(&self) -> DrainReport {
        let report = self.supervisor.shutdown().await;
        self.throttle.close();
        report
    }
}
