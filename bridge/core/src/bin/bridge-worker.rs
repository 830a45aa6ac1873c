//! Bridge Worker - Worker-side entry point
//!
//! Launched by the host's supervisor. Reads the bridge variables from its
//! environment, serves the built-in worker callbacks and runs until the host
//! stops it or disappears.
//!
//! # Usage
//!
//! ```bash
//! BRIDGE_EXTENSION_DIR=/opt/ext BRIDGE_TRANSPORT=file bridge-worker -- --forwarded args
//!
//! # Verbose logging
//! RUST_LOG=debug bridge-worker
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: leave the bridge and exit
//!
//! # Exit codes
//!
//! - `0`: clean shutdown, or the host went away
//! - `2`: the bridge environment is missing or names an unknown strategy

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::{error, info};

use bridge_core::{
    CallArgs, CallbackProxy, CallbackRegistry, ProcessRole, TransportConfig, WorkerBootstrap,
};

/// Worker half of the callback bridge
#[derive(Parser, Debug)]
#[command(name = "bridge-worker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "BRIDGE_WORKER_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Host liveness poll interval in milliseconds, 0 disables the watchdog
    /// (defaults to the value passed by the host)
    #[arg(long, value_name = "MS")]
    watchdog_interval_ms: Option<u64>,

    /// How long calls into the host wait for a result, in milliseconds
    #[arg(long, env = "BRIDGE_CALL_TIMEOUT", default_value_t = 30_000, value_name = "MS")]
    call_timeout_ms: u64,

    /// Arguments forwarded by the host, exposed through `worker.args`
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    forwarded: Vec<String>,
}

/// Logs go to stderr; stdout belongs to the worker's application
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("bridge_worker={level},bridge_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();
}

/// Callbacks every worker serves
fn builtin_callbacks(
    forwarded: Vec<String>,
    host: Arc<OnceLock<Arc<CallbackProxy>>>,
) -> Result<CallbackRegistry> {
    let registry = CallbackRegistry::new(ProcessRole::Worker);

    registry.register("worker.ping", |_args: CallArgs| async { Ok(json!("pong")) })?;

    registry.register("worker.echo", |args: CallArgs| async move {
        Ok(json!({
            "positional": args.positional,
            "keyword": args.keyword,
        }))
    })?;

    registry.register("worker.add", |args: CallArgs| async move {
        let mut total: i64 = 0;
        for value in &args.positional {
            total += value
                .as_i64()
                .with_context(|| format!("cannot add non-integer {value}"))?;
        }
        Ok(json!(total))
    })?;

    registry.register("worker.pid", |_args: CallArgs| async {
        Ok(json!(std::process::id()))
    })?;

    registry.register("worker.args", move |_args: CallArgs| {
        let forwarded = forwarded.clone();
        async move { Ok(json!(forwarded)) }
    })?;

    registry.register("worker.sleep", |args: CallArgs| async move {
        let ms = args
            .arg(0)
            .and_then(serde_json::Value::as_u64)
            .context("expected a duration in milliseconds")?;
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(json!(ms))
    })?;

    registry.register("worker.call_host", move |args: CallArgs| {
        let host = Arc::clone(&host);
        async move {
            let proxy = host
                .get()
                .cloned()
                .context("the bridge to the host is not up yet")?;
            let mut positional = args.positional.into_iter();
            let identifier = positional
                .next()
                .and_then(|v| v.as_str().map(str::to_owned))
                .context("first argument must name a host callback")?;
            let forwarded = CallArgs {
                positional: positional.collect(),
                keyword: args.keyword,
            };
            Ok(proxy.invoke(&identifier, forwarded).await?)
        }
    })?;

    Ok(registry)
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        _ = sigint.recv() => info!("Received SIGINT, shutting down"),
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Received Ctrl-C, shutting down");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let role = ProcessRole::Worker
        .activate()
        .context("Failed to fix the process role")?;

    let defaults = TransportConfig {
        call_timeout_ms: args.call_timeout_ms,
        ..TransportConfig::default()
    };
    let mut bootstrap = match WorkerBootstrap::from_env(defaults) {
        Ok(bootstrap) => bootstrap,
        Err(e) => {
            error!(error = %e, "Worker cannot join the bridge");
            std::process::exit(2);
        }
    };
    if let Some(ms) = args.watchdog_interval_ms {
        bootstrap = bootstrap.with_watchdog((ms > 0).then_some(Duration::from_millis(ms)));
    }

    info!(
        pid = std::process::id(),
        role = %role,
        version = env!("CARGO_PKG_VERSION"),
        "Bridge worker starting"
    );

    let host = Arc::new(OnceLock::new());
    let registry = builtin_callbacks(args.forwarded, Arc::clone(&host))?;
    let runtime = bootstrap
        .launch(registry)
        .await
        .context("Failed to join the bridge")?;
    // worker.call_host fails until this is set.
    let _ = host.set(runtime.proxy());

    info!(
        callbacks = ?runtime.registry().identifiers(),
        ipc_dir = %runtime.settings().ipc_dir.display(),
        "Worker ready"
    );

    let result = wait_for_shutdown().await;
    runtime.shutdown().await;
    info!("Bridge worker stopped");
    result
}
