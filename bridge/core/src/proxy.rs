//! Callback proxy
//!
//! Invokes callbacks registered in the peer process and waits for the
//! matching result. Calls through one proxy are serialized: the next call is
//! sent only after the previous one resolved or timed out.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::envelope::{self, CallArgs, CallEnvelope, CallOutcome, ResultEnvelope};
use crate::error::{BridgeError, Result};
use crate::role::ProcessRole;
use crate::transport::{MailboxId, Transport};

/// Caller side of the bridge, bound to the results mailbox of its process
pub struct CallbackProxy {
    caller: ProcessRole,
    call_timeout: Duration,
    transport: Mutex<Box<dyn Transport>>,
}

impl CallbackProxy {
    /// Proxy for calls made by `caller` into its peer
    pub fn new(caller: ProcessRole, transport: Box<dyn Transport>, call_timeout: Duration) -> Self {
        Self {
            caller,
            call_timeout,
            transport: Mutex::new(transport),
        }
    }

    /// Role whose callbacks this proxy invokes
    pub fn target(&self) -> ProcessRole {
        self.caller.peer()
    }

    /// How long a call waits for its result
    pub fn call_timeout(&self) -> Duration {
        self.call_timeout
    }

    /// Invoke `identifier` in the peer with the default timeout
    pub async fn invoke(&self, identifier: &str, args: CallArgs) -> Result<Value> {
        self.invoke_with_timeout(identifier, args, self.call_timeout)
            .await
    }

    /// Invoke and deserialize the returned value
    pub async fn invoke_as<T: DeserializeOwned>(&self, identifier: &str, args: CallArgs) -> Result<T> {
        let value = self.invoke(identifier, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Invoke `identifier` in the peer, waiting at most `timeout` overall
    ///
    /// # Errors
    ///
    /// `RemoteCallTimeout` if no matching result arrives in time,
    /// `RemoteExecutionError` if the peer reports a failure.
    pub async fn invoke_with_timeout(
        &self,
        identifier: &str,
        args: CallArgs,
        timeout: Duration,
    ) -> Result<Value> {
        let deadline = Instant::now() + timeout;
        let timed_out = || BridgeError::RemoteCallTimeout {
            identifier: identifier.to_string(),
            timeout,
        };

        let mut transport = tokio::time::timeout_at(deadline, self.transport.lock())
            .await
            .map_err(|_| timed_out())?;

        let call = CallEnvelope::new(self.caller, identifier, args);
        let correlation_id = call.correlation_id;
        let target = MailboxId::calls(self.target());
        transport.send(&target, &envelope::encode(&call)?).await?;

        tracing::debug!(
            correlation_id = %correlation_id,
            target = %identifier,
            peer = %self.target(),
            "Remote call sent"
        );

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!(correlation_id = %correlation_id, target = %identifier, "Remote call timed out");
                return Err(timed_out());
            }

            let Some(payload) = transport.receive(remaining).await? else {
                continue;
            };

            let result: ResultEnvelope = match envelope::decode(&payload) {
                Ok(result) => result,
                Err(e) => {
                    tracing::warn!(error = %e, "Discarding undecodable result envelope");
                    continue;
                }
            };

            if result.correlation_id != correlation_id {
                // Late answer to a call that already timed out
                tracing::debug!(
                    expected = %correlation_id,
                    received = %result.correlation_id,
                    "Discarding result for another call"
                );
                continue;
            }

            return match result.outcome {
                CallOutcome::Ok { value } => Ok(value),
                CallOutcome::Error { message } => Err(BridgeError::RemoteExecutionError {
                    identifier: identifier.to_string(),
                    message,
                }),
            };
        }
    }
}

impl std::fmt::Debug for CallbackProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackProxy")
            .field("caller", &self.caller)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}
