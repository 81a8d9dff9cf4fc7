use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use weightsync::comm::create_rendezvous;
use weightsync::config::{LogFormat, LoggingConfig, ParallelConfig, ServerConfig};
use weightsync::control::ControlPlane;
use weightsync::engine::LocalEngine;
use weightsync::model::{InMemoryModel, ParameterStore};
use weightsync::tensor::{DType, TensorSpec};
use weightsync::throttle::UpdateThrottle;
use weightsync::{http, logging, Result};

#[derive(Parser)]
#[command(author, version, about = "Weight sync control plane for a local inference engine", long_about = None)]
struct Args {
    /// Host for the HTTP service
    #[arg(long, env = "WEIGHTSYNC_HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port number for the HTTP service
    #[arg(short, long, env = "WEIGHTSYNC_PORT", default_value = "8000")]
    port: u16,

    /// Tensor parallel size
    #[arg(long, default_value = "1")]
    tensor_parallel_size: u32,

    /// Data parallel size
    #[arg(long, default_value = "1")]
    data_parallel_size: u32,

    /// Concurrent weight-update broadcasts allowed
    #[arg(long, default_value = "10")]
    max_concurrent_weight_updates: usize,

    /// Largest tensor, in bytes, one update may announce
    #[arg(long, default_value = "8589934592")]
    max_tensor_bytes: u64,

    /// Seconds allowed for a rendezvous or collective call
    #[arg(long, default_value = "300")]
    rendezvous_timeout_secs: u64,

    /// Model parameter as NAME:DTYPE:SHAPE, e.g. layer.weight:float32:4x4
    #[arg(long = "param", value_parser = parse_param)]
    params: Vec<(String, TensorSpec)>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit JSON log lines
    #[arg(long)]
    log_json: bool,
}

impl Args {
    fn config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
            parallel: ParallelConfig::new(self.tensor_parallel_size, self.data_parallel_size),
            max_concurrent_weight_updates: self.max_concurrent_weight_updates,
            max_tensor_bytes: self.max_tensor_bytes,
            rendezvous_timeout_secs: self.rendezvous_timeout_secs,
            logging: LoggingConfig {
                level: self.log_level.clone(),
                format: if self.log_json {
                    LogFormat::Json
                } else {
                    LogFormat::Text
                },
            },
            ..Default::default()
        }
    }
}

/// Parse `NAME:DTYPE:SHAPE`; SHAPE is `x`-separated and empty for a scalar.
fn parse_param(s: &str) -> std::result::Result<(String, TensorSpec), String> {
    let mut parts = s.rsplitn(3, ':');
    let (Some(shape), Some(dtype), Some(name)) = (parts.next(), parts.next(), parts.next()) else {
        return Err(format!("expected NAME:DTYPE:SHAPE, got '{s}'"));
    };
    let dtype: DType = dtype.parse().map_err(|e| format!("{e}"))?;
    let shape = if shape.is_empty() {
        Vec::new()
    } else {
        shape
            .split('x')
            .map(|d| d.parse::<u64>().map_err(|e| format!("bad dimension '{d}': {e}")))
            .collect::<std::result::Result<Vec<_>, _>>()?
    };
    let spec = TensorSpec::new(dtype, shape);
    spec.byte_len().map_err(|e| format!("{e}"))?;
    Ok((name.to_string(), spec))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.config();
    logging::init(&config.logging)?;
    config.validate()?;

    let mut model = InMemoryModel::new();
    for (name, spec) in &args.params {
        model = model.with_parameter(name, spec.clone())?;
    }
    tracing::info!(parameters = ?model.parameter_names(), "model parameters registered");

    let rendezvous = create_rendezvous(&config)?;
    let engine = LocalEngine::spawn(config.parallel.clone(), rendezvous, |_| {
        Box::new(model.clone()) as Box<dyn ParameterStore>
    });
    let control = Arc::new(
        ControlPlane::new(
            Arc::new(engine),
            UpdateThrottle::new(config.max_concurrent_weight_updates),
        )
        .with_max_tensor_bytes(config.max_tensor_bytes),
    );

    let listener = std::net::TcpListener::bind(config.bind_address())?;
    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            http::shutdown_signal().await;
            shutdown.cancel();
        }
    });

    let report = http::serve(listener, control, shutdown).await?;
    tracing::info!(
        succeeded = report.succeeded,
        failed = report.failed,
        cancelled = report.cancelled,
        "weight sync server stopped"
    );
    Ok(())
}
