//! arkiv-daemon - webhook-driven ticket archival service.
//!
//! The binary wires the library together: configuration loading
//! (environment over YAML over defaults), tracing initialisation, the
//! axum listener, and coordinated shutdown.
//!
//! # Shutdown
//!
//! `SIGTERM`/`SIGINT` flips the shutdown state (new `/ingest` requests
//! answer 503), the HTTP server stops accepting connections, and running
//! jobs get the configured grace period to drain. Jobs still running at
//! the deadline are cancelled; they repair their ticket tags on the way
//! out.
//!
//! # Exit codes
//!
//! `0` on a normal shutdown, non-zero on configuration or startup
//! failure.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use arkiv_core::config::Settings;
use arkiv_core::ingress::{build_router, AppState};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// arkiv daemon - archive help-desk tickets as signed PDFs
#[derive(Parser, Debug)]
#[command(name = "arkiv-daemon")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file (defaults to $CONFIG_PATH)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level override (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    /// Log format override (human, json)
    #[arg(long)]
    log_format: Option<String>,

    /// Print the effective configuration (secrets redacted) and exit
    #[arg(long)]
    print_config: bool,
}

fn resolve_config_path(arg: Option<&PathBuf>, env_value: Option<String>) -> Option<String> {
    arg.map(|path| path.to_string_lossy().into_owned())
        .or_else(|| env_value.filter(|value| !value.trim().is_empty()))
}

fn init_tracing(level: &str, format: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    if format == "json" {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config_path = resolve_config_path(args.config.as_ref(), std::env::var("CONFIG_PATH").ok());
    let settings = Settings::load(config_path.as_deref(), std::env::vars())
        .context("configuration failed")?;

    if args.print_config {
        print!("{}", settings.to_redacted_yaml()?);
        return Ok(());
    }

    let level = args
        .log_level
        .as_deref()
        .unwrap_or(&settings.observability.log_level);
    let format = args
        .log_format
        .as_deref()
        .unwrap_or(&settings.observability.log_format);
    init_tracing(level, format);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;
    runtime.block_on(serve(Arc::new(settings)))
}

async fn serve(settings: Arc<Settings>) -> anyhow::Result<()> {
    let state = AppState::from_settings(Arc::clone(&settings)).context("startup failed")?;
    let shutdown = state.shutdown.clone();
    let executor = Arc::clone(&state.executor);
    let router = build_router(state);

    let addr: SocketAddr = format!("{}:{}", settings.server.host, settings.server.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid listen address {}:{}",
                settings.server.host, settings.server.port
            )
        })?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("cannot bind {addr}"))?;
    info!(
        addr = %addr,
        version = arkiv_core::SERVICE_VERSION,
        signing = settings.signing.enabled,
        "listening"
    );

    let signal_shutdown = shutdown.clone();
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        wait_for_termination().await;
        info!("shutdown signal received; refusing new work");
        signal_shutdown.begin_shutdown();
    })
    .await
    .context("server error")?;

    let grace = settings.workflow.shutdown_grace();
    info!(grace_seconds = grace.as_secs(), "draining running jobs");
    if !executor.drain(grace).await {
        warn!("grace period elapsed; cancelling remaining jobs");
        shutdown.cancel_running_jobs();
        if !executor.drain(Duration::from_secs(5)).await {
            warn!("jobs still running at forced-cancellation deadline");
        }
    }
    info!("shutdown complete");
    Ok(())
}

async fn wait_for_termination() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(err) => {
            warn!(error = %err, "cannot install SIGTERM handler; relying on ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
            return;
        },
    };
    tokio::select! {
        _ = sigterm.recv() => {},
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                warn!(error = %err, "ctrl-c handler failed");
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_path_prefers_the_flag_over_the_environment() {
        let flag = PathBuf::from("/etc/arkiv/config.yaml");
        assert_eq!(
            resolve_config_path(Some(&flag), Some("/env/config.yaml".to_owned())),
            Some("/etc/arkiv/config.yaml".to_owned())
        );
        assert_eq!(
            resolve_config_path(None, Some("/env/config.yaml".to_owned())),
            Some("/env/config.yaml".to_owned())
        );
        assert_eq!(resolve_config_path(None, Some("  ".to_owned())), None);
        assert_eq!(resolve_config_path(None, None), None);
    }

    #[test]
    fn args_parse_supported_flags() {
        let args = Args::parse_from([
            "arkiv-daemon",
            "--config",
            "/tmp/c.yaml",
            "--log-level",
            "debug",
            "--log-format",
            "json",
            "--print-config",
        ]);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/c.yaml")));
        assert_eq!(args.log_level.as_deref(), Some("debug"));
        assert_eq!(args.log_format.as_deref(), Some("json"));
        assert!(args.print_config);
    }
}
