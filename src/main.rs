use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use deadbrick::admission::{AdmissionController, RejectAction};
use deadbrick::config::{DeadbrickConfig, LogFormat, LoggingConfig};
use deadbrick::http::{HttpServer, ServeOutcome};

/// A deliberately fragile HTTP service for resilience testing.
#[derive(Debug, Parser)]
#[command(name = "deadbrick", version, about)]
struct Cli {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Seconds to stay unavailable after a failure symptom
    #[arg(long)]
    recovery_window_secs: Option<u64>,

    /// Token bucket refill rate, per second
    #[arg(long)]
    rate: Option<f64>,

    /// Token bucket capacity
    #[arg(long)]
    window: Option<f64>,

    /// close-connection or exit-process
    #[arg(long)]
    on_reject: Option<RejectAction>,

    /// Default log filter, overridden by RUST_LOG
    #[arg(long)]
    log_level: Option<String>,

    /// text or json
    #[arg(long)]
    log_format: Option<LogFormat>,
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<DeadbrickConfig> {
        let mut config = match &self.config {
            Some(path) => DeadbrickConfig::from_file(path)?,
            None => DeadbrickConfig::default(),
        };

        if let Some(addr) = self.listen {
            config.server.listen_addr = addr;
        }
        if let Some(secs) = self.recovery_window_secs {
            config.admission.recovery_window_secs = secs;
        }
        if let Some(rate) = self.rate {
            config.admission.rate = rate;
        }
        if let Some(window) = self.window {
            config.admission.window = window;
        }
        if let Some(action) = self.on_reject {
            config.admission.on_reject = action;
        }
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if let Some(format) = self.log_format {
            config.logging.format = format;
        }

        config.validate()?;
        Ok(config)
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    match logging.format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    init_tracing(&config.logging);

    info!("Starting Deadbrick");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        listen_addr = %config.server.listen_addr,
        recovery_window_secs = config.admission.recovery_window_secs,
        rate = config.admission.rate,
        window = config.admission.window,
        on_reject = ?config.admission.on_reject,
        fault_policy = ?config.admission.fault_policy,
        "Configuration loaded"
    );

    let controller = Arc::new(AdmissionController::from_config(&config.admission));
    let server = HttpServer::bind(
        config.server.listen_addr,
        controller,
        config.connection_settings(),
    )
    .await?;

    info!("Listening on http://{}", server.local_addr()?);

    match server.serve_with_shutdown(wait_for_shutdown()).await? {
        ServeOutcome::Shutdown => info!("Deadbrick stopped"),
        ServeOutcome::Halted(reason) => info!(reason = %reason, "Deadbrick died"),
    }
    Ok(())
}

/// Resolve on the first SIGINT or SIGTERM.
///
/// If a handler cannot be installed the other one still applies; if neither
/// can, the server runs until killed.
async fn wait_for_shutdown() {
    let interrupt = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let received = tokio::select! {
        _ = interrupt => "SIGINT",
        _ = terminate => "SIGTERM",
    };
    info!(signal = received, "Shutting down, no longer accepting connections");
}
