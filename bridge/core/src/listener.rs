//! Callback listener
//!
//! Background task that receives call envelopes from the process's calls
//! mailbox, dispatches them through the registry one at a time, and sends
//! the result envelope back to the caller's results mailbox.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;

use crate::envelope::{self, CallEnvelope, ResultEnvelope};
use crate::registry::CallbackRegistry;
use crate::role::{self, ProcessRole};
use crate::transport::{MailboxId, Transport, TransportError};

/// Upper bound on how long `stop()` waits for an idle receive to return
const RECEIVE_SLICE: Duration = Duration::from_millis(100);

/// Pause after a failed receive before trying again
const ERROR_BACKOFF: Duration = Duration::from_millis(250);

/// Handle to a running listener task
pub struct CallbackListener {
    role: ProcessRole,
    stop: Arc<AtomicBool>,
    task: Option<JoinHandle<()>>,
}

impl CallbackListener {
    /// Spawn the dispatch loop on the current runtime
    ///
    /// `active` is the role of this process; every dispatch is checked
    /// against it.
    pub fn start(
        registry: CallbackRegistry,
        active: ProcessRole,
        transport: Box<dyn Transport>,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let task = tokio::spawn(run(registry, active, transport, Arc::clone(&stop)));
        Self {
            role: active,
            stop,
            task: Some(task),
        }
    }

    /// Role the listener dispatches as
    pub fn role(&self) -> ProcessRole {
        self.role
    }

    /// Whether the dispatch loop is still running
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Signal the loop to exit and wait for it
    ///
    /// A call being dispatched is finished first; nothing is dispatched
    /// after this returns.
    pub async fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(role = %self.role, error = %e, "Listener task ended abnormally");
            }
        }
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run(
    registry: CallbackRegistry,
    active: ProcessRole,
    mut transport: Box<dyn Transport>,
    stop: Arc<AtomicBool>,
) {
    tracing::info!(
        role = %active,
        inbox = %transport.inbox(),
        strategy = %transport.strategy(),
        "Callback listener started"
    );

    while !stop.load(Ordering::SeqCst) {
        let payload = match transport.receive(RECEIVE_SLICE).await {
            Ok(Some(payload)) => payload,
            Ok(None) => continue,
            Err(TransportError::ConnectionClosed) => {
                tracing::error!(
                    role = %active,
                    inbox = %transport.inbox(),
                    "Inbox closed, listener stopping"
                );
                break;
            }
            Err(e) => {
                tracing::warn!(role = %active, error = %e, "Listener receive failed");
                tokio::time::sleep(ERROR_BACKOFF).await;
                continue;
            }
        };

        let call: CallEnvelope = match envelope::decode(&payload) {
            Ok(call) => call,
            Err(e) => {
                tracing::warn!(role = %active, error = %e, "Discarding undecodable call envelope");
                continue;
            }
        };

        let reply_to = MailboxId::results(call.caller);
        let result = dispatch(&registry, active, call).await;

        let bytes = match envelope::encode(&result) {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode result envelope");
                continue;
            }
        };
        if let Err(e) = transport.send(&reply_to, &bytes).await {
            tracing::warn!(
                correlation_id = %result.correlation_id,
                reply_to = %reply_to,
                error = %e,
                "Failed to deliver result"
            );
        }
    }

    tracing::info!(role = %active, "Callback listener stopped");
}

/// Run one call envelope to completion and build its result
///
/// `active` stands in for the process role only while no process-wide
/// token is set.
pub(crate) async fn dispatch(
    registry: &CallbackRegistry,
    active: ProcessRole,
    call: CallEnvelope,
) -> ResultEnvelope {
    role::scoped(active, dispatch_in_role(registry, call)).await
}

async fn dispatch_in_role(registry: &CallbackRegistry, call: CallEnvelope) -> ResultEnvelope {
    let CallEnvelope {
        correlation_id,
        caller,
        target,
        args,
    } = call;

    tracing::debug!(
        correlation_id = %correlation_id,
        caller = %caller,
        target = %target,
        "Dispatching remote call"
    );

    let callback = match registry.resolve(&target) {
        Ok(Some(callback)) => callback,
        Ok(None) => {
            tracing::warn!(target = %target, "Remote call to unregistered callback");
            return ResultEnvelope::error(
                correlation_id,
                format!(
                    "no callback registered under {target} in the {} process",
                    registry.role()
                ),
            );
        }
        Err(e) => return ResultEnvelope::error(correlation_id, e.to_string()),
    };

    match AssertUnwindSafe(callback(args)).catch_unwind().await {
        Ok(Ok(value)) => ResultEnvelope::ok(correlation_id, value),
        Ok(Err(err)) => {
            tracing::debug!(target = %target, error = %format!("{err:#}"), "Callback returned an error");
            ResultEnvelope::error(correlation_id, format!("{err:#}"))
        }
        Err(_) => {
            tracing::error!(target = %target, "Callback panicked");
            ResultEnvelope::error(correlation_id, format!("callback {target} panicked"))
        }
    }
}
