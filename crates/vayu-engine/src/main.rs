mod lock;

use clap::Parser;
use lock::EngineLock;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vayu_core::config::Config;
use vayu_core::control::{create_router, AppState};
use vayu_core::eventloop::HttpTransport;
use vayu_core::run::RunManager;
use vayu_core::script::{ScriptConfig, ScriptPool};
use vayu_core::storage::Storage;

const DEFAULT_PORT: u16 = 9876;

/// Headless engine daemon: owns storage, config, the run registry, and the
/// HTTP control plane. One instance per data directory, enforced by an
/// advisory lock on `<data-dir>/vayu.lock`.
#[derive(Parser)]
#[command(name = "vayu-engine")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Headless local API-testing engine")]
struct Cli {
    /// Loopback port for the control plane HTTP server
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Overrides the platform default data directory
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Log verbosity: 0 = warn, 1 = info, 2 = debug
    #[arg(long, default_value_t = 1)]
    verbose: u8,
}

fn default_data_dir() -> PathBuf {
    dirs::config_dir().unwrap_or_else(|| PathBuf::from(".")).join("vayu")
}

fn init_logging(verbose: u8, data_dir: &std::path::Path) -> Result<(), Box<dyn std::error::Error>> {
    let level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };

    let log_dir = data_dir.join("logs");
    std::fs::create_dir_all(&log_dir)?;
    let stamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let log_path = log_dir.join(format!("vayu_{stamp}.log"));
    let log_file = std::fs::OpenOptions::new().create(true).append(true).open(log_path)?;

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| format!("vayu_engine={level},vayu_core={level},tower_http=warn").into()))
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::fmt::layer().with_writer(log_file).with_ansi(false))
        .init();

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let data_dir = cli.data_dir.clone().unwrap_or_else(default_data_dir);

    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        eprintln!("failed to create data directory {}: {e}", data_dir.display());
        std::process::exit(1);
    }

    if let Err(e) = init_logging(cli.verbose, &data_dir) {
        eprintln!("failed to initialize logging: {e}");
        std::process::exit(1);
    }

    let lock_path = data_dir.join("vayu.lock");
    let _lock = match EngineLock::acquire(&lock_path) {
        Ok(lock) => lock,
        Err(e) => {
            error!(path = %lock_path.display(), error = %e, "another engine instance already holds the lock");
            std::process::exit(1);
        }
    };

    info!(data_dir = %data_dir.display(), port = cli.port, "starting vayu-engine");

    let storage = match Storage::open(&data_dir) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "failed to open storage");
            std::process::exit(1);
        }
    };

    let config = match Config::load(storage.clone()).await {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "failed to load configuration");
            std::process::exit(1);
        }
    };

    let script_pool = match ScriptPool::new(ScriptConfig::default()) {
        Ok(pool) => Some(Arc::new(pool)),
        Err(e) => {
            error!(error = %e, "failed to initialize script sandbox pool; running without pre/post-request scripting");
            None
        }
    };

    match storage.reconcile_stale_runs().await {
        Ok(0) => {}
        Ok(n) => info!(reconciled = n, "marked runs left running by a prior crash as failed"),
        Err(e) => error!(error = %e, "failed to reconcile stale runs at startup"),
    }

    let run_manager = Arc::new(RunManager::new(storage.clone(), script_pool.clone()));
    let transport = Arc::new(HttpTransport::default());

    let state = AppState {
        storage: storage.clone(),
        config,
        run_manager: Arc::clone(&run_manager),
        script_pool,
        transport,
    };
    let app = create_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], cli.port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(addr = %addr, error = %e, "failed to bind control plane listener");
            std::process::exit(2);
        }
    };

    info!(addr = %addr, "control plane listening");

    let shutdown_run_manager = Arc::clone(&run_manager);
    let shutdown = async move {
        let ctrl_c = async { tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler") };
        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install SIGTERM handler")
                .recv()
                .await;
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
        info!("shutdown signal received, stopping active runs before draining the control plane");

        // Stop every active run first — each `stop_run` call waits (bounded)
        // for that run's own metrics flush to land in storage before
        // returning, so by the time this future resolves and axum tears
        // down the control plane, storage already reflects every run's
        // final state.
        for id in shutdown_run_manager.get_all_active_runs() {
            if let Err(e) = shutdown_run_manager.stop_run(id).await {
                error!(run_id = %id, error = %e, "failed to stop run during shutdown");
            }
        }
        info!("all active runs stopped, shutting down control plane");
    };

    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        error!(error = %e, "control plane server error");
        std::process::exit(2);
    }

    info!("vayu-engine stopped cleanly");
}
