use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use fluux_component::{ComponentBuilder, ComponentConfig, ComponentError};
use tokio::sync::broadcast;
use tracing::{error, info};

#[derive(Debug, Parser)]
#[command(name = "fluux-component", version, about = "XMPP component listener with mandatory STARTTLS")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Component JID (overrides the config file)
    #[arg(long)]
    jid: Option<String>,

    /// Listen host (overrides the config file)
    #[arg(long)]
    host: Option<String>,

    /// Listen port (overrides the config file)
    #[arg(long)]
    port: Option<u16>,

    /// Log to stderr. `--verbose=xmpp` also logs stream traffic.
    #[arg(short, long, num_args = 0..=1, default_missing_value = "default", require_equals = true)]
    verbose: Option<String>,

    /// Override the log directory (default: platform data dir)
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn default_log_dir() -> PathBuf {
    // Linux: ~/.local/share/com.processone.fluux-component/logs/
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("com.processone.fluux-component")
        .join("logs")
}

/// Daily-rotating log file, plus stderr when `--verbose` or `RUST_LOG` is set.
fn init_tracing(log_dir: &Path, verbose_level: Option<&str>) {
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    if let Err(e) = std::fs::create_dir_all(log_dir) {
        eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
    }

    let rust_log = std::env::var("RUST_LOG").is_ok();

    let file_filter = if rust_log {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::new("fluux_component=info,info")
    };

    let file_appender = tracing_appender::rolling::daily(log_dir, "fluux-component.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_filter(file_filter);

    let stderr_layer = if verbose_level.is_some() || rust_log {
        let stderr_filter = if rust_log {
            EnvFilter::from_default_env()
        } else if verbose_level == Some("xmpp") {
            EnvFilter::new("fluux_component=info,fluux_component::component::connection=debug,info")
        } else {
            EnvFilter::new("fluux_component=info,info")
        };
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(stderr_filter),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(file_layer)
        .with(stderr_layer)
        .init();

    // The writer thread must live until process exit.
    std::mem::forget(_guard);

    eprintln!("Log file: {}", log_dir.display());
}

fn load_config(args: &Args) -> Result<ComponentConfig, ComponentError> {
    let mut config = match &args.config {
        Some(path) => ComponentConfig::read(path)?,
        None => ComponentConfig::default(),
    };

    if let Some(jid) = &args.jid {
        config.jid = jid.clone();
    }
    if let Some(host) = &args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }

    config.validate()?;
    Ok(config)
}

async fn run(config: ComponentConfig) -> Result<(), ComponentError> {
    let component = ComponentBuilder::new(config).build()?;

    let (shutdown_tx, _) = broadcast::channel(1);
    let signal_tx = shutdown_tx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, shutting down");
            let _ = signal_tx.send(());
        }
    });

    component.run(shutdown_tx).await
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let log_dir = args.log_dir.clone().unwrap_or_else(default_log_dir);
    init_tracing(&log_dir, args.verbose.as_deref());

    info!(version = env!("CARGO_PKG_VERSION"), "Starting fluux-component");

    let result = match load_config(&args) {
        Ok(config) => run(config).await,
        Err(e) => Err(e),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "Component stopped with error");
            eprintln!("Error: {}", e);
            ExitCode::FAILURE
        }
    }
}
