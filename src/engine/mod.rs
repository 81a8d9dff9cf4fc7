//! Inference Engine Interface
//!
//! The control plane reaches workers only through [`Engine`]:
//! - `collective_rpc`: run one operation on every worker
//! - `reset_prefix_cache`: invalidate cached prefixes engine-wide
//! - `parallel_config`: tensor/data parallel sizes

pub mod local;

use crate::config::ParallelConfig;
use crate::core::{Error, Rank, Result};
use crate::worker::WorkerOp;
use async_trait::async_trait;

pub use local::LocalEngine;

/// Per-worker results of one `collective_rpc`, ordered by rank.
#[derive(Debug)]
pub struct CollectiveOutcome {
    pub results: Vec<(Rank, Result<()>)>,
}

impl CollectiveOutcome {
    /// Ranks whose call failed.
    pub fn failed_ranks(&self) -> Vec<Rank> {
        self.results
            .iter()
            .filter(|(_, r)| r.is_err())
            .map(|(rank, _)| *rank)
            .collect()
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|(_, r)| r.is_ok())
    }

    /// Collapse into a single result, keeping the lowest rank's error.
    pub fn into_result(self) -> Result<()> {
        let total = self.results.len();
        let mut failures = self.results.into_iter().filter_map(|(_, r)| r.err());
        match failures.next() {
            None => Ok(()),
            Some(first) => Err(Error::WorkerFailures {
                failed: 1 + failures.count(),
                total,
                first: Box::new(first),
            }),
        }
    }
}

/// Opaque handle to the inference engine.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Run `op` on every worker and wait for all of them.
    async fn collective_rpc(&self, op: WorkerOp) -> Result<CollectiveOutcome>;

    /// Invalidate the prefix cache on every worker.
    async fn reset_prefix_cache(&self) -> Result<()>;

    /// Parallelism the engine was started with.
    fn parallel_config(&self) -> ParallelConfig;
}
