//! Bridge Host - Launches and supervises a bridge worker
//!
//! Loads the bridge configuration, starts the worker with the host half of
//! the bridge installed, and either runs one call into the worker or stays up
//! until it is told to stop.
//!
//! # Usage
//!
//! ```bash
//! # Start with the configured worker and wait for a signal
//! bridge-host --install-dir /opt/engine --extension-dir /opt/ext
//!
//! # One call into the worker, printed as JSON
//! bridge-host --invoke worker.add --arg 2 --arg 40
//!
//! # Custom config file and transport
//! bridge-host --config ./bridge.toml --transport socket
//!
//! # Verbose logging
//! RUST_LOG=debug bridge-host
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: stop the worker gracefully, then exit

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use bridge_core::config::{self, ConfigOverrides};
use bridge_core::transport::{self, TransportStrategy};
use bridge_core::{
    kill_armed_workers, CallArgs, CallbackProxy, CallbackRegistry, IpcContext, PipInstaller,
    ProcessRole, WorkerSupervisor,
};

/// How often the worker process is checked while waiting
const WORKER_POLL: Duration = Duration::from_millis(500);

/// Bridge Host - starts a worker and serves host callbacks to it
#[derive(Parser, Debug)]
#[command(name = "bridge-host")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "BRIDGE_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Worker install directory
    #[arg(long, value_name = "DIR")]
    install_dir: Option<PathBuf>,

    /// Extension directory shared with the worker
    #[arg(long, value_name = "DIR")]
    extension_dir: Option<PathBuf>,

    /// Transport strategy (file, socket)
    #[arg(short = 't', long, value_parser = parse_strategy, value_name = "NAME")]
    transport: Option<TransportStrategy>,

    /// Rendezvous directory shared with the worker
    #[arg(long, value_name = "DIR")]
    ipc_dir: Option<PathBuf>,

    /// Script passed to the worker executable
    #[arg(long, value_name = "FILE")]
    bootstrap: Option<PathBuf>,

    /// Seconds to wait for the worker to exit before killing it
    #[arg(long, value_name = "SECS")]
    graceful_timeout_secs: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "BRIDGE_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Invoke one worker callback, print its result and exit
    #[arg(long, value_name = "IDENTIFIER")]
    invoke: Option<String>,

    /// Positional argument for --invoke, as JSON (bare words are strings)
    #[arg(long = "arg", value_name = "JSON")]
    call_args: Vec<String>,

    /// Arguments forwarded to the worker
    #[arg(last = true)]
    forwarded: Vec<String>,
}

fn parse_strategy(name: &str) -> Result<TransportStrategy, String> {
    transport::lookup(name).map_err(|e| e.to_string())
}

/// Parse `--arg` values; anything that is not JSON is taken as a string
fn parse_call_args(raw: &[String]) -> CallArgs {
    CallArgs::positional(
        raw.iter()
            .map(|s| serde_json::from_str(s).unwrap_or_else(|_| Value::String(s.clone()))),
    )
}

/// Initialize logging with the specified level
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("bridge_host={level},bridge_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();
}

/// Callbacks the worker may invoke in the host
fn host_callbacks() -> Result<CallbackRegistry> {
    let registry = CallbackRegistry::new(ProcessRole::Host);

    registry.register("host.ping", |_args: CallArgs| async { Ok(json!("pong")) })?;

    registry.register("host.log", |args: CallArgs| async move {
        let message = args
            .arg(0)
            .map(|v| v.as_str().map_or_else(|| v.to_string(), str::to_owned))
            .unwrap_or_default();
        info!(target: "bridge_host::worker", "{message}");
        Ok(Value::Null)
    })?;

    registry.register("host.pid", |_args: CallArgs| async {
        Ok(json!(std::process::id()))
    })?;

    Ok(registry)
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    Ok(tokio::select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    })
}

#[cfg(not(unix))]
async fn shutdown_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    Ok("Ctrl-C")
}

/// Wait for a signal or for the worker to exit on its own
async fn run_until_stopped(supervisor: &mut WorkerSupervisor) -> Result<()> {
    let signal = shutdown_signal();
    tokio::pin!(signal);
    let mut ticker = tokio::time::interval(WORKER_POLL);

    loop {
        tokio::select! {
            received = &mut signal => {
                let received = received?;
                info!(signal = received, "Shutdown requested");
                return Ok(());
            }
            _ = ticker.tick() => {
                if supervisor.has_exited() {
                    warn!(pid = ?supervisor.worker_pid(), "Worker exited on its own");
                    return Ok(());
                }
            }
        }
    }
}

/// Run one call into the worker, giving up as soon as the worker exits
async fn invoke_while_running(
    supervisor: &mut WorkerSupervisor,
    proxy: &CallbackProxy,
    identifier: &str,
    args: CallArgs,
) -> Result<Value> {
    let call = proxy.invoke(identifier, args);
    tokio::pin!(call);
    let mut ticker = tokio::time::interval(WORKER_POLL);

    loop {
        tokio::select! {
            biased;
            result = &mut call => {
                return result.with_context(|| format!("Call to {identifier} failed"));
            }
            _ = ticker.tick() => {
                if let Some(status) = supervisor.exit_status() {
                    bail!("Worker exited ({status}) before {identifier} returned");
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        kill_armed_workers();
        default_hook(info);
    }));

    info!("Bridge host starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let role = ProcessRole::Host
        .activate()
        .context("Failed to fix the process role")?;

    let mut bridge_config = match args.config {
        Some(ref path) => config::load_config_from_path(Some(path.clone())),
        None => config::load_config(),
    }
    .context("Failed to load configuration")?;

    let mut overrides = ConfigOverrides::new();
    overrides.install_dir = args.install_dir;
    overrides.extension_dir = args.extension_dir;
    overrides.strategy = args.transport;
    overrides.ipc_dir = args.ipc_dir;
    overrides.bootstrap = args.bootstrap;
    overrides.graceful_timeout_secs = args.graceful_timeout_secs;
    if !args.forwarded.is_empty() {
        overrides.forwarded_args = Some(args.forwarded);
    }
    overrides.apply(&mut bridge_config);

    info!(
        source = %bridge_config.source(),
        config_file = ?bridge_config.config_file_path,
        "Configuration loaded"
    );

    let supervisor_config = bridge_config
        .to_supervisor_config()
        .context("Incomplete worker configuration")?;
    let context = IpcContext::new(role, bridge_config.resolved_transport())
        .context("Failed to set up the host IPC context")?;
    info!(
        strategy = %context.strategy(),
        ipc_dir = %context.ipc_dir().display(),
        "Transport selected"
    );

    let mut supervisor = WorkerSupervisor::new(
        supervisor_config,
        context,
        host_callbacks()?,
        Arc::new(PipInstaller),
    );
    supervisor.start().await.context("Failed to start the worker")?;

    let result = match (args.invoke, supervisor.proxy()) {
        (Some(identifier), Some(proxy)) => {
            let call_args = parse_call_args(&args.call_args);
            invoke_while_running(&mut supervisor, &proxy, &identifier, call_args)
                .await
                .and_then(|value| {
                    println!("{}", serde_json::to_string_pretty(&value)?);
                    Ok(())
                })
        }
        (Some(identifier), None) => Err(anyhow::anyhow!(
            "Cannot invoke {identifier}: worker supervision is disabled"
        )),
        (None, Some(_)) => run_until_stopped(&mut supervisor).await,
        (None, None) => {
            info!("Worker supervision disabled, nothing to do");
            Ok(())
        }
    };

    info!("Shutting down...");
    supervisor.stop().await;

    match result {
        Ok(()) => {
            info!("Bridge host stopped cleanly");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Bridge host stopped with error");
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_args_accept_json_and_bare_words() {
        let args = parse_call_args(&["2".into(), "{\"a\":1}".into(), "hello".into()]);
        assert_eq!(args.positional, vec![json!(2), json!({"a": 1}), json!("hello")]);
    }

    #[test]
    fn test_cli_parses_invoke_and_forwarded_args() {
        let args = Args::try_parse_from([
            "bridge-host",
            "--install-dir",
            "/opt/engine",
            "--transport",
            "FILE",
            "--invoke",
            "worker.add",
            "--arg",
            "1",
            "--arg",
            "2",
            "--",
            "--listen",
            "0.0.0.0",
        ])
        .unwrap();

        assert_eq!(args.install_dir, Some(PathBuf::from("/opt/engine")));
        assert_eq!(args.transport, Some(TransportStrategy::File));
        assert_eq!(args.invoke.as_deref(), Some("worker.add"));
        assert_eq!(args.call_args, vec!["1", "2"]);
        assert_eq!(args.forwarded, vec!["--listen", "0.0.0.0"]);
    }

    #[test]
    fn test_cli_rejects_unknown_transport() {
        assert!(Args::try_parse_from(["bridge-host", "--transport", "pigeon"]).is_err());
    }

    #[tokio::test]
    async fn test_host_callbacks_are_host_bound() {
        let registry = host_callbacks().unwrap();
        assert_eq!(registry.role(), ProcessRole::Host);
        assert_eq!(registry.identifiers(), vec!["host.log", "host.pid", "host.ping"]);

        // Nothing runs before the process has a role
        assert!(registry.call_local("host.ping", CallArgs::none()).await.is_err());

        ProcessRole::Host.activate().unwrap();
        let pong = registry.call_local("host.ping", CallArgs::none()).await.unwrap();
        assert_eq!(pong, json!("pong"));
    }
}
