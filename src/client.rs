//! Trainer-side client.
//!
//! Drives a weight sync server over HTTP and takes part in the weight
//! update group as its highest rank, the broadcast source.

use crate::comm::{Communicator, Rendezvous};
use crate::control::{
    ErrorResponse, InitCommunicatorRequest, StatsResponse, StatusResponse,
    UpdateNamedParamRequest, WorldSizeResponse,
};
use crate::core::{Error, Rank, RendezvousSpec, Result};
use crate::tensor::TensorBuffer;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Per-request HTTP timeout.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause between health checks in [`WeightSyncClient::check_server`].
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Client for one weight sync server.
pub struct WeightSyncClient {
    http: reqwest::Client,
    base_url: String,
    rendezvous: Arc<dyn Rendezvous>,
    communicator: Option<Box<dyn Communicator>>,
}

impl WeightSyncClient {
    /// Create a client for the server at `base_url`, e.g. `http://127.0.0.1:8000`.
    pub fn new(base_url: &str, rendezvous: Arc<dyn Rendezvous>) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            rendezvous,
            communicator: None,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Our rank in the update group, once joined.
    pub fn client_rank(&self) -> Option<Rank> {
        self.communicator.as_ref().map(|c| c.rank())
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn read<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let message = match response.json::<ErrorResponse>().await {
            Ok(body) => body.error,
            Err(_) => status.to_string(),
        };
        if status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            return Err(Error::ShuttingDown);
        }
        Err(Error::Http(format!("{} ({})", message, status)))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.http.get(self.url(path)).send().await?;
        Self::read(response).await
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let response = self.http.post(self.url(path)).json(body).send().await?;
        Self::read::<StatusResponse>(response).await.map(|_| ())
    }

    async fn post_empty(&self, path: &str) -> Result<()> {
        let response = self.http.post(self.url(path)).send().await?;
        Self::read::<StatusResponse>(response).await.map(|_| ())
    }

    /// Poll `/health` until the server answers or `timeout` elapses.
    pub async fn check_server(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.get::<StatusResponse>("/health").await {
                Ok(_) => return Ok(()),
                Err(e) if Instant::now() >= deadline => {
                    return Err(Error::Http(format!(
                        "server at {} not ready after {:?}: {}",
                        self.base_url, timeout, e
                    )));
                }
                Err(e) => tracing::debug!(error = %e, "server not ready yet"),
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Number of inference workers behind the server.
    pub async fn get_world_size(&self) -> Result<u32> {
        let body: WorldSizeResponse = self.get("/get_world_size").await?;
        Ok(body.world_size)
    }

    pub async fn stats(&self) -> Result<StatsResponse> {
        self.get("/stats").await
    }

    /// Ask the server's workers to form a group at `host:port`, then join
    /// it as the last rank.
    pub async fn init_communicator(&mut self, host: &str, port: u16) -> Result<()> {
        if self.communicator.is_some() {
            return Err(Error::AlreadyInitialized);
        }

        let world_size = self.get_world_size().await? + 1;
        let request = InitCommunicatorRequest {
            host: host.to_string(),
            port,
            world_size,
        };
        self.post("/init_communicator", &request).await?;

        let spec = RendezvousSpec::from(request);
        let communicator = self.rendezvous.join(&spec, spec.client_rank()).await?;
        tracing::info!(%spec, rank = communicator.rank(), "joined weight update group");
        self.communicator = Some(communicator);
        Ok(())
    }

    /// Send one tensor to every worker.
    ///
    /// Returns once the barrier after the broadcast has been passed, so
    /// calls must not overlap.
    pub async fn update_named_param(&self, name: &str, tensor: &mut TensorBuffer) -> Result<()> {
        let communicator = self.communicator.as_ref().ok_or(Error::NotInitialized)?;

        let request = UpdateNamedParamRequest {
            name: name.to_string(),
            dtype: tensor.spec().dtype.as_str().to_string(),
            shape: tensor.spec().shape.clone(),
        };
        self.post("/update_named_param", &request).await?;

        communicator.broadcast(tensor, communicator.rank()).await?;
        communicator.barrier().await
    }

    /// Send every tensor in `params`, one after another.
    pub async fn update_model(&self, params: &mut [(String, TensorBuffer)]) -> Result<()> {
        for (name, tensor) in params.iter_mut() {
            self.update_named_param(name, tensor).await?;
        }
        Ok(())
    }

    pub async fn reset_prefix_cache(&self) -> Result<()> {
        self.post_empty("/reset_prefix_cache").await
    }

    /// Ask the workers to leave the group and drop our own membership.
    pub async fn close_communicator(&mut self) -> Result<()> {
        self.post_empty("/close_communicator").await?;
        if self.communicator.take().is_some() {
            tracing::info!("left weight update group");
        }
        Ok(())
    }
}
