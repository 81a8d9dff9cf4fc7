//! # weightsync - live weight synchronization for inference engines
//!
//! A control plane that lets an external trainer push fresh weights into a
//! running, multi-worker inference engine without restarting it:
//! - **Rendezvous**: every worker plus the trainer form one collective group
//! - **Broadcast**: each named tensor is sent from the trainer's rank and
//!   loaded by every worker after a barrier
//! - **Control plane**: an HTTP façade that schedules these operations as
//!   supervised background tasks, with bounded concurrent updates
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use weightsync::comm::LocalRendezvous;
//! use weightsync::client::WeightSyncClient;
//! use weightsync::tensor::TensorBuffer;
//!
//! #[tokio::main]
//! async fn main() -> weightsync::Result<()> {
//!     let rendezvous = Arc::new(LocalRendezvous::new());
//!     let mut client = WeightSyncClient::new("http://127.0.0.1:8000", rendezvous)?;
//!     client.init_communicator("127.0.0.1", 29500).await?;
//!
//!     let mut weight = TensorBuffer::from_f32(vec![2, 2], &[0.1, 0.2, 0.3, 0.4])?;
//!     client.update_named_param("layer.weight", &mut weight).await?;
//!     client.close_communicator().await
//! }
//! ```

pub mod client;
pub mod comm;
pub mod config;
pub mod control;
pub mod core;
pub mod engine;
pub mod http;
pub mod logging;
pub mod model;
pub mod supervisor;
pub mod tensor;
pub mod throttle;
pub mod worker;

pub use core::error::{Error, Result};
