//! Bridge Core - Role-Restricted Host/Worker Callbacks over Local IPC
//!
//! This crate connects a long-lived host process with a worker process it
//! spawns, so that each side can invoke named functions in the other and get
//! their return values back. Every function is bound to the process role it
//! must run in.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────── Host ────────────────┐      ┌─────────────── Worker ───────────────┐
//! │                                      │      │                                      │
//! │  WorkerSupervisor ── spawn ──────────┼──────┼─► WorkerBootstrap                    │
//! │        │                             │ env  │        │                             │
//! │  CallbackProxy ──► worker.calls ─────┼──────┼─► CallbackListener ─► registry       │
//! │        ▲                             │      │        │                             │
//! │        └───────── host.results ◄─────┼──────┼────────┘                             │
//! │                                      │      │                                      │
//! │  CallbackListener ◄── host.calls ◄───┼──────┼── CallbackProxy                      │
//! │                                      │      │  LivenessWatchdog ─► polls host pid  │
//! └──────────────────────────────────────┘      └──────────────────────────────────────┘
//! ```
//!
//! # Key Types
//!
//! - [`ProcessRole`]: set-once role token of the running process
//! - [`CallbackRegistry`]: role-scoped dispatch table
//! - [`IpcContext`]: role and transport settings; installs a [`Bridge`]
//! - [`CallbackProxy`]: invokes callbacks in the peer process
//! - [`WorkerSupervisor`]: spawns and stops the worker (host side)
//! - [`WorkerBootstrap`]: joins the bridge from inside the worker
//! - [`LivenessWatchdog`]: ends an orphaned worker
//!
//! # Quick Start
//!
//! ```ignore
//! use bridge_core::{CallArgs, CallbackRegistry, InstallOptions, IpcContext, ProcessRole};
//! use bridge_core::transport::TransportConfig;
//!
//! let role = ProcessRole::Host.activate()?;
//! let registry = CallbackRegistry::new(role);
//! registry.register("host.ping", |_args| async { Ok(serde_json::json!("pong")) })?;
//!
//! let context = IpcContext::new(role, TransportConfig::default())?;
//! let bridge = context.install_bridge(registry, InstallOptions { clear_on_init: true }).await?;
//! let value = bridge.invoke("worker.render", CallArgs::positional([1.into()])).await?;
//! bridge.shutdown().await;
//! ```
//!
//! # Module Overview
//!
//! - [`role`]: process role token and role guards
//! - [`transport`]: transport strategies (file spool, Unix socket) and framing
//! - [`envelope`]: call and result envelopes
//! - [`registry`]: callback registration
//! - [`listener`]: serves registered callbacks to the peer
//! - [`proxy`]: calls into the peer
//! - [`context`]: per-process bridge installation
//! - [`supervisor`]: worker discovery, environment, spawn and shutdown
//! - [`watchdog`]: host liveness polling inside the worker
//! - [`worker`]: worker-side bootstrap
//! - [`requirements`]: requirements file checking
//! - [`config`]: TOML and environment configuration

#![warn(missing_docs)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod listener;
pub mod proxy;
pub mod registry;
pub mod requirements;
pub mod role;
pub mod supervisor;
pub mod transport;
pub mod watchdog;
pub mod worker;

// Re-exports for convenience
pub use config::{
    load_config, load_config_from_path, BridgeConfigFile, ConfigError, ConfigOverrides,
    ConfigSource,
};
pub use context::{Bridge, InstallOptions, IpcContext};
pub use envelope::{CallArgs, CallEnvelope, CallOutcome, CorrelationId, ResultEnvelope};
pub use error::{BridgeError, Result};
pub use listener::CallbackListener;
pub use proxy::CallbackProxy;
pub use registry::{Callback, CallbackRegistry, CallbackResult};
pub use role::{restrict_to, ProcessRole, Restricted, RoleGuard};
pub use supervisor::{
    kill_armed_workers, DependencyInstaller, NoopInstaller, PipInstaller, SupervisorConfig,
    WorkerHandle, WorkerSupervisor,
};
pub use transport::{TransportConfig, TransportStrategy};
pub use watchdog::{process_exists, LivenessWatchdog};
pub use worker::{SearchPath, WorkerBootstrap, WorkerRuntime, WorkerSettings};
