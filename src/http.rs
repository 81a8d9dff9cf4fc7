//! HTTP surface of the control plane.

use crate::control::{
    ControlPlane, ErrorResponse, InitCommunicatorRequest, StatsResponse, StatusResponse,
    UpdateNamedParamRequest, WorldSizeResponse,
};
use crate::core::{Error, Result};
use crate::supervisor::DrainReport;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Error returned by a handler, rendered as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let status = match &error {
            e if e.is_client_error() => StatusCode::UNPROCESSABLE_ENTITY,
            Error::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self {
            status: rejection.status(),
            message: rejection.body_text(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            error: self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Build the router for `control`.
pub fn router(control: Arc<ControlPlane>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/get_world_size", get(get_world_size))
        .route("/stats", get(stats))
        .route("/init_communicator", post(init_communicator))
        .route("/update_named_param", post(update_named_param))
        .route("/reset_prefix_cache", post(reset_prefix_cache))
        .route("/close_communicator", post(close_communicator))
        .with_state(control)
}

async fn health(State(control): State<Arc<ControlPlane>>) -> Json<StatusResponse> {
    Json(control.health())
}

async fn get_world_size(State(control): State<Arc<ControlPlane>>) -> Json<WorldSizeResponse> {
    Json(WorldSizeResponse {
        world_size: control.world_size(),
    })
}

async fn stats(State(control): State<Arc<ControlPlane>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        tasks: control.supervisor().stats(),
        updates_in_flight: control.throttle().in_flight(),
    })
}

async fn init_communicator(
    State(control): State<Arc<ControlPlane>>,
    payload: std::result::Result<Json<InitCommunicatorRequest>, JsonRejection>,
) -> ApiResult<StatusResponse> {
    let Json(request) = payload?;
    control.init_communicator(request)?;
    Ok(Json(StatusResponse::ok()))
}

async fn update_named_param(
    State(control): State<Arc<ControlPlane>>,
    payload: std::result::Result<Json<UpdateNamedParamRequest>, JsonRejection>,
) -> ApiResult<StatusResponse> {
    let Json(request) = payload?;
    control.update_named_param(request)?;
    Ok(Json(StatusResponse::ok()))
}

async fn reset_prefix_cache(State(control): State<Arc<ControlPlane>>) -> ApiResult<StatusResponse> {
    control.reset_prefix_cache()?;
    Ok(Json(StatusResponse::ok()))
}

async fn close_communicator(State(control): State<Arc<ControlPlane>>) -> ApiResult<StatusResponse> {
    control.close_communicator()?;
    Ok(Json(StatusResponse::ok()))
}

/// Serve `control` on `listener` until `shutdown` is cancelled, then drain.
///
/// The listening socket stays open until every background task has reached
/// a terminal state; connections are no longer accepted once `shutdown`
/// fires.
pub async fn serve(
    listener: std::net::TcpListener,
    control: Arc<ControlPlane>,
    shutdown: CancellationToken,
) -> Result<DrainReport> {
    let held = listener.try_clone()?;
    listener.set_nonblocking(true)?;
    let listener = tokio::net::TcpListener::from_std(listener)?;
    let address = listener.local_addr()?;
    tracing::info!(%address, world_size = control.world_size(), "weight sync server listening");

    let served = axum::serve(listener, router(control.clone()))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await;
    if let Err(e) = &served {
        tracing::error!(error = %e, "HTTP server error");
    }

    let report = control.shutdown().await;
    drop(held);
    tracing::info!(%address, "listening socket released");

    served?;
    Ok(report)
}

/// Resolve on ctrl-c or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    tracing::info!("received shutdown signal");
}
