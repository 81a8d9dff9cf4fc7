//! Operations dispatched to every worker.

use crate::core::RendezvousSpec;
use crate::tensor::{DType, TensorSpec};
use serde::{Deserialize, Serialize};

/// Metadata for one tensor the client is about to broadcast.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightUpdateRequest {
    /// Name of the parameter in the model
    pub name: String,
    /// Element type
    pub dtype: DType,
    /// Dimensions
    pub shape: Vec<u64>,
}

impl WeightUpdateRequest {
    pub fn new(name: &str, dtype: DType, shape: Vec<u64>) -> Self {
        Self {
            name: name.to_string(),
            dtype,
            shape,
        }
    }

    /// Spec of the receive buffer.
    pub fn spec(&self) -> TensorSpec {
        TensorSpec::new(self.dtype, self.shape.clone())
    }
}

/// A worker-side operation invoked through `collective_rpc`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WorkerOp {
    InitCommunicator(RendezvousSpec),
    UpdateNamedParam(WeightUpdateRequest),
    CloseCommunicator,
}

impl WorkerOp {
    /// Method name, as used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            WorkerOp::InitCommunicator(_) => "init_communicator",
            WorkerOp::UpdateNamedParam(_) => "update_named_param",
            WorkerOp::CloseCommunicator => "close_communicator",
        }
    }
}

impl std::fmt::Display for WorkerOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WorkerOp::InitCommunicator(spec) => write!(f, "init_communicator({})", spec),
            WorkerOp::UpdateNamedParam(req) => {
                write!(f, "update_named_param({}, {}{:?})", req.name, req.dtype, req.shape)
            }
            WorkerOp::CloseCommunicator => write!(f, "close_communicator()"),
        }
    }
}
