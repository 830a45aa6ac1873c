//! IPC context
//!
//! Owns the role and transport settings of one process and installs the
//! listener/proxy pair. At most one pair is installed per context at a time.
//! A context never contradicts the process-wide role token.

use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;

use crate::envelope::CallArgs;
use crate::error::{BridgeError, Result};
use crate::listener::CallbackListener;
use crate::proxy::CallbackProxy;
use crate::registry::CallbackRegistry;
use crate::role::{self, ProcessRole};
use crate::transport::{self, MailboxId, Transport, TransportConfig, TransportStrategy};

/// How [`IpcContext::install_bridge`] treats messages already pending
#[derive(Clone, Copy, Debug, Default)]
pub struct InstallOptions {
    /// Discard anything left in this process's mailboxes, and calls queued
    /// for the peer, before starting
    ///
    /// The host sets this before spawning the worker so leftovers of a
    /// crashed session are never dispatched on either side. The worker
    /// leaves it unset so calls the host made before the worker came up
    /// survive.
    pub clear_on_init: bool,
}

/// Role and transport settings of this process
#[derive(Clone, Debug)]
pub struct IpcContext {
    role: ProcessRole,
    transport: TransportConfig,
    installed: Arc<AtomicBool>,
}

impl IpcContext {
    /// Context for `role`
    ///
    /// # Errors
    ///
    /// `WrongProcessRole` if the process already activated the other role.
    pub fn new(role: ProcessRole, transport: TransportConfig) -> Result<Self> {
        let context = Self {
            role,
            transport,
            installed: Arc::new(AtomicBool::new(false)),
        };
        context.ensure_consistent()?;
        Ok(context)
    }

    /// Role of this context
    pub fn role(&self) -> ProcessRole {
        self.role
    }

    /// Selected transport strategy
    pub fn strategy(&self) -> TransportStrategy {
        self.transport.strategy
    }

    /// Transport settings shared by the listener and proxy
    pub fn transport_config(&self) -> &TransportConfig {
        &self.transport
    }

    /// Rendezvous root shared with the peer
    pub fn ipc_dir(&self) -> PathBuf {
        self.transport.resolved_ipc_dir()
    }

    /// Whether a listener/proxy pair is currently installed
    pub fn has_bridge(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    /// Fail unless the process-wide role token is unset or equals this role
    pub(crate) fn ensure_consistent(&self) -> Result<()> {
        match ProcessRole::active() {
            Some(active) if active != self.role => Err(BridgeError::WrongProcessRole {
                callable: format!("{} IPC context", self.role),
                required: self.role,
                active: Some(active),
            }),
            _ => Ok(()),
        }
    }

    /// Run `fut` as this context's role
    ///
    /// Role-restricted code inside `fut` sees this role while the process
    /// has no role token of its own; once a token is set it always wins.
    ///
    /// # Errors
    ///
    /// `WrongProcessRole` if the process activated the other role.
    pub async fn scope<F: Future>(&self, fut: F) -> Result<F::Output> {
        self.ensure_consistent()?;
        Ok(role::scoped(self.role, fut).await)
    }

    /// Open a transport of the configured strategy receiving from `inbox`
    pub fn open_transport(&self, inbox: MailboxId) -> Result<Box<dyn Transport>> {
        Ok(transport::open_transport(&self.transport, inbox)?)
    }

    /// Start the listener for `registry` and build the proxy to the peer
    ///
    /// # Errors
    ///
    /// `WrongProcessRole` if the registry belongs to the other role or the
    /// process activated the other role, `BridgeAlreadyInstalled` if this
    /// context already has a live bridge.
    pub async fn install_bridge(
        &self,
        registry: CallbackRegistry,
        options: InstallOptions,
    ) -> Result<Bridge> {
        self.ensure_consistent()?;
        if registry.role() != self.role {
            return Err(BridgeError::WrongProcessRole {
                callable: "callback listener".into(),
                required: registry.role(),
                active: Some(self.role),
            });
        }
        if self
            .installed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(BridgeError::BridgeAlreadyInstalled(self.role));
        }
        let release = InstallGuard(Arc::clone(&self.installed));

        let calls = MailboxId::calls(self.role);
        let results = MailboxId::results(self.role);
        let mut listener_transport = self.open_transport(calls.clone())?;
        let mut proxy_transport = self.open_transport(results.clone())?;

        if options.clear_on_init {
            let stale_calls = listener_transport.clear(&calls).await?;
            let stale_results = proxy_transport.clear(&results).await?;
            let stale_peer_calls = proxy_transport
                .clear(&MailboxId::calls(self.role.peer()))
                .await?;
            if stale_calls + stale_results + stale_peer_calls > 0 {
                tracing::info!(
                    role = %self.role,
                    stale_calls,
                    stale_results,
                    stale_peer_calls,
                    "Discarded messages left by a previous session"
                );
            }
        }

        let proxy = Arc::new(CallbackProxy::new(
            self.role,
            proxy_transport,
            self.transport.call_timeout(),
        ));
        let listener = CallbackListener::start(registry.clone(), self.role, listener_transport);

        tracing::info!(
            role = %self.role,
            strategy = %self.strategy(),
            ipc_dir = %self.ipc_dir().display(),
            "IPC bridge installed"
        );

        Ok(Bridge {
            listener,
            proxy,
            registry,
            _release: release,
        })
    }
}

/// Clears the installed flag when the bridge goes away
#[derive(Debug)]
struct InstallGuard(Arc<AtomicBool>);

impl Drop for InstallGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Installed listener/proxy pair
pub struct Bridge {
    listener: CallbackListener,
    proxy: Arc<CallbackProxy>,
    registry: CallbackRegistry,
    _release: InstallGuard,
}

impl Bridge {
    /// Proxy into the peer process
    pub fn proxy(&self) -> Arc<CallbackProxy> {
        Arc::clone(&self.proxy)
    }

    /// Registry served by the listener
    pub fn registry(&self) -> &CallbackRegistry {
        &self.registry
    }

    /// Whether the listener task is still running
    pub fn is_listening(&self) -> bool {
        self.listener.is_running()
    }

    /// Shorthand for `proxy().invoke(..)`
    pub async fn invoke(&self, identifier: &str, args: CallArgs) -> Result<Value> {
        self.proxy.invoke(identifier, args).await
    }

    /// Stop the listener and release the context
    pub async fn shutdown(mut self) {
        self.listener.stop().await;
        tracing::info!(role = %self.listener.role(), "IPC bridge shut down");
    }
}
