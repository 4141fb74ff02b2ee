//! synthbridge server binary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

use synthbridge::session::DEFAULT_WORKER_PATH;
use synthbridge::{
    Bootstrap, BootstrapMode, BridgeConfig, BridgeService, RequestSerializer, RestartPolicy,
    ServerConfig, SessionConfig, WorkerSession, serve,
};

#[derive(Debug, Parser)]
#[command(
    name = "synthbridge",
    version,
    about = "Serve a framed-stdio speech synthesis worker over HTTP and WebSocket"
)]
struct Args {
    /// Worker executable
    #[arg(long, env = "SYNTHBRIDGE_WORKER", default_value = DEFAULT_WORKER_PATH)]
    worker: PathBuf,

    /// Argument passed to the worker (repeatable)
    #[arg(long = "worker-arg", value_name = "ARG", allow_hyphen_values = true)]
    worker_args: Vec<String>,

    /// Working directory for the worker
    #[arg(long)]
    worker_dir: Option<PathBuf>,

    #[arg(long, env = "SYNTHBRIDGE_HOST", default_value = "127.0.0.1")]
    host: String,

    #[arg(long, env = "SYNTHBRIDGE_PORT", default_value_t = 8080)]
    port: u16,

    /// Start the worker on the first request instead of at startup
    #[arg(long)]
    lazy: bool,

    /// Respawn the worker on the next request after it dies
    #[arg(long)]
    restart_on_failure: bool,

    /// Fail a request whose reply takes longer than this
    #[arg(long, value_name = "SECS")]
    exchange_timeout_secs: Option<u64>,

    /// Bound on worker start plus initialize
    #[arg(long, value_name = "SECS", default_value_t = 300)]
    setup_timeout_secs: u64,

    /// Model directory passed to the worker on initialize
    #[arg(long)]
    onnx_dir: Option<String>,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        let mut config = SessionConfig::new(&self.worker).with_args(self.worker_args.clone());
        if let Some(dir) = &self.worker_dir {
            config = config.with_working_dir(dir);
        }
        config
    }

    fn bridge_config(&self) -> BridgeConfig {
        let mut bootstrap = Bootstrap::new()
            .with_setup_timeout(Duration::from_secs(self.setup_timeout_secs))
            .with_mode(if self.lazy {
                BootstrapMode::Lazy
            } else {
                BootstrapMode::Eager
            });
        if let Some(dir) = &self.onnx_dir {
            bootstrap = bootstrap.with_init_field("onnx_dir", dir.as_str());
        }

        let mut config = BridgeConfig::default()
            .with_bootstrap(bootstrap)
            .with_restart(if self.restart_on_failure {
                RestartPolicy::OnFailure
            } else {
                RestartPolicy::Never
            });
        if let Some(secs) = self.exchange_timeout_secs {
            config = config.with_exchange_timeout(Duration::from_secs(secs));
        }
        config
    }

    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            host: self.host.clone(),
            port: self.port,
        }
    }
}

/// Initialize tracing with SYNTHBRIDGE_LOG and LOG_FORMAT support.
fn init_tracing() {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let base_level = match std::env::var("SYNTHBRIDGE_LOG").as_deref() {
            Ok("debug") => "debug",
            Ok("warn") | Ok("warning") => "warn",
            Ok("error") => "error",
            _ => "info",
        };

        EnvFilter::new(format!(
            "synthbridge={level},tower_http={level}",
            level = base_level
        ))
    };

    let use_json = std::env::var("LOG_FORMAT").as_deref() == Ok("json");

    if use_json {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    } else {
        let subscriber = tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_writer(std::io::stderr));
        let _ = subscriber.try_init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing();

    info!(
        worker = %args.worker.display(),
        host = %args.host,
        port = args.port,
        lazy = args.lazy,
        restart_on_failure = args.restart_on_failure,
        "Starting synthbridge"
    );

    let session = WorkerSession::from_config(args.session_config());
    let bridge = RequestSerializer::spawn(session, args.bridge_config());
    let service = Arc::new(BridgeService::new(Arc::new(bridge)));

    serve(args.server_config(), service)
        .await
        .context("synthbridge server failed")
}
