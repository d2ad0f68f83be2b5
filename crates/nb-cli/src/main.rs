use anyhow::{Context, Result, bail};
use clap::Parser;
use nb_api::AppState;
use nb_core::{Blocker, MemoryFilter, PacketFilter, ServiceConfig};
use nb_iptables::IptablesCli;
use nb_metrics::MetricsCollector;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

const LOG_LEVELS: [&str; 4] = ["debug", "info", "warn", "error"];

#[derive(Parser, Debug)]
#[command(name = "network-blocker")]
#[command(version, about = "Block and unblock network traffic from a private iptables chain", long_about = None)]
struct Cli {
    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// debug, info, warn or error
    #[arg(long)]
    log_level: Option<String>,

    /// YAML config file; flags win over its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Keep rules in memory instead of calling iptables
    #[arg(long)]
    dry_run: bool,

    /// Do not hook the chain into OUTPUT
    #[arg(long)]
    no_outbound: bool,

    /// Restore removed rules when an insert fails
    #[arg(long)]
    rollback_on_failure: bool,
}

impl Cli {
    fn service_config(&self) -> Result<ServiceConfig> {
        let mut config = match &self.config {
            Some(path) => ServiceConfig::from_file(path)?,
            None => ServiceConfig::default(),
        };

        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if self.no_outbound {
            config.blocker.hook_outbound = false;
        }
        if self.rollback_on_failure {
            config.blocker.rollback_on_failure = true;
        }
        Ok(config)
    }
}

fn log_filter(level: &str) -> Result<EnvFilter> {
    let level = level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        bail!(
            "invalid log level '{}', expected one of {}",
            level,
            LOG_LEVELS.join("|")
        );
    }
    match std::env::var("RUST_LOG") {
        Ok(directives) if !directives.trim().is_empty() => {
            EnvFilter::try_new(directives).context("invalid RUST_LOG")
        }
        _ => Ok(EnvFilter::new(level)),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match cli.service_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    };

    match log_filter(&config.log_level) {
        Ok(filter) => tracing_subscriber::fmt().with_env_filter(filter).init(),
        Err(e) => {
            eprintln!("Error: {:#}", e);
            return ExitCode::FAILURE;
        }
    }

    match run(config, cli.dry_run).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(config: ServiceConfig, dry_run: bool) -> Result<()> {
    let filter: Box<dyn PacketFilter> = if dry_run {
        tracing::info!("Dry run: rules are kept in memory");
        Box::new(MemoryFilter::new())
    } else {
        Box::new(IptablesCli::new(config.blocker.iptables_path.clone()))
    };

    let blocker = Arc::new(Blocker::new(filter, &config.blocker)?);
    let metrics = Arc::new(MetricsCollector::new()?);
    tracing::info!(chain = blocker.chain_name(), "Initializing chain");

    let init = blocker.clone();
    tokio::task::spawn_blocking(move || init.initialize()).await??;
    tracing::info!(
        chain = blocker.chain_name(),
        hooks = ?blocker.hooks(),
        "Chain ready"
    );

    let addr = format!("{}:{}", config.host, config.port);
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            cleanup(&blocker, &metrics).await;
            return Err(e).with_context(|| format!("failed to listen on {}", addr));
        }
    };
    tracing::info!("Listening on http://{}", addr);

    let app = nb_api::router(AppState::new(blocker.clone(), metrics.clone()));
    let served = nb_api::serve(listener, app, shutdown_signal()).await;

    cleanup(&blocker, &metrics).await;
    served?;
    tracing::info!("network-blocker terminated");
    Ok(())
}

async fn cleanup(blocker: &Arc<Blocker>, metrics: &MetricsCollector) {
    tracing::info!(chain = blocker.chain_name(), "Removing chain");
    let worker = blocker.clone();
    match tokio::task::spawn_blocking(move || worker.cleanup()).await {
        Ok(report) => {
            if !report.is_clean() {
                tracing::warn!(failures = report.failures.len(), "Cleanup was incomplete");
            }
            metrics.record_cleanup_warnings(report.failures.len());
        }
        Err(e) => tracing::warn!("Cleanup worker failed: {}", e),
    }
}

/// Resolves on the first SIGINT or SIGTERM. A second signal exits at once.
async fn shutdown_signal() {
    let (tx, rx) = tokio::sync::oneshot::channel();

    tokio::spawn(async move {
        if let Err(e) = wait_for_signal().await {
            tracing::error!("Failed to listen for shutdown signals: {}", e);
            return std::future::pending::<()>().await;
        }
        tracing::info!("Shutting down");
        let _ = tx.send(());

        if wait_for_signal().await.is_ok() {
            tracing::warn!("Second signal received, exiting without cleanup");
            std::process::exit(1);
        }
    });

    let _ = rx.await;
}

async fn wait_for_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res,
            _ = term.recv() => Ok(()),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_defaults() {
        let cli = Cli::try_parse_from([
            "network-blocker",
            "--port",
            "9000",
            "--log-level",
            "warn",
            "--no-outbound",
            "--rollback-on-failure",
            "--dry-run",
        ])
        .unwrap();

        let config = cli.service_config().unwrap();
        assert!(cli.dry_run);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert_eq!(config.log_level, "warn");
        assert!(!config.blocker.hook_outbound);
        assert!(config.blocker.rollback_on_failure);
    }

    #[test]
    fn defaults_without_flags() {
        let cli = Cli::try_parse_from(["network-blocker"]).unwrap();
        let config = cli.service_config().unwrap();
        assert_eq!(config.port, 8086);
        assert_eq!(config.log_level, "debug");
        assert!(config.blocker.hook_outbound);
    }

    #[test]
    fn rejects_out_of_range_port() {
        assert!(Cli::try_parse_from(["network-blocker", "--port", "70000"]).is_err());
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let cli =
            Cli::try_parse_from(["network-blocker", "-c", "/nonexistent/network-blocker.yaml"])
                .unwrap();
        assert!(cli.service_config().is_err());
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        assert!(log_filter("verbose").is_err());
        assert!(log_filter("INFO").is_ok());
    }
}
