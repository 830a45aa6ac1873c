//! Callback registry
//!
//! Maps identifiers to async callbacks bound to one process role. The
//! listener dispatches remote calls through it; in-process callers use
//! [`CallbackRegistry::call_local`]. Both paths run the role guard.

use std::future::Future;
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;

use crate::envelope::CallArgs;
use crate::error::{BridgeError, Result};
use crate::role::{ProcessRole, RoleGuard};

/// What a callback resolves to
pub type CallbackResult = anyhow::Result<Value>;

/// Type-erased callback
pub type Callback = Arc<dyn Fn(CallArgs) -> BoxFuture<'static, CallbackResult> + Send + Sync>;

struct Registration {
    guard: RoleGuard,
    callback: Callback,
}

/// Identifier → callback table for one role
///
/// Cloning shares the table, so callbacks registered after the listener
/// started are visible to it.
#[derive(Clone)]
pub struct CallbackRegistry {
    role: ProcessRole,
    entries: Arc<DashMap<String, Registration>>,
}

impl CallbackRegistry {
    /// Empty registry whose callbacks are bound to `role`
    pub fn new(role: ProcessRole) -> Self {
        Self {
            role,
            entries: Arc::new(DashMap::new()),
        }
    }

    /// Role every callback in this registry is bound to
    pub fn role(&self) -> ProcessRole {
        self.role
    }

    /// Register `callback` under `identifier`
    ///
    /// # Errors
    ///
    /// `DuplicateCallback` if the identifier is taken.
    pub fn register<F, Fut>(&self, identifier: impl Into<String>, callback: F) -> Result<()>
    where
        F: Fn(CallArgs) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CallbackResult> + Send + 'static,
    {
        let identifier = identifier.into();
        match self.entries.entry(identifier.clone()) {
            Entry::Occupied(_) => Err(BridgeError::DuplicateCallback(identifier)),
            Entry::Vacant(slot) => {
                tracing::debug!(role = %self.role, identifier = %identifier, "Registered callback");
                slot.insert(Registration {
                    guard: RoleGuard::new(self.role, identifier),
                    callback: Arc::new(move |args| callback(args).boxed()),
                });
                Ok(())
            }
        }
    }

    /// Remove a callback; returns whether it existed
    pub fn unregister(&self, identifier: &str) -> bool {
        self.entries.remove(identifier).is_some()
    }

    /// Whether `identifier` is registered
    pub fn contains(&self, identifier: &str) -> bool {
        self.entries.contains_key(identifier)
    }

    /// Number of registered callbacks
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered identifiers, sorted
    pub fn identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.entries.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Look up a callback and check it may run in the current role
    ///
    /// Returns `Ok(None)` for unknown identifiers. The map guard is released
    /// before returning so a callback may register further callbacks.
    pub(crate) fn resolve(&self, identifier: &str) -> Result<Option<Callback>> {
        let Some(entry) = self.entries.get(identifier) else {
            return Ok(None);
        };
        entry.guard.enforce()?;
        Ok(Some(Arc::clone(&entry.callback)))
    }

    /// Run a callback in this process
    ///
    /// The role is taken from [`ProcessRole::current`].
    ///
    /// # Errors
    ///
    /// `WrongProcessRole` if the current role is not this registry's role
    /// or no role is set, `UnknownCallback` if nothing is registered,
    /// `CallbackFailed` if the callback itself errors.
    pub async fn call_local(&self, identifier: &str, args: CallArgs) -> Result<Value> {
        let callback = self
            .resolve(identifier)?
            .ok_or_else(|| BridgeError::UnknownCallback {
                identifier: identifier.to_string(),
                role: self.role,
            })?;
        callback(args)
            .await
            .map_err(|err| BridgeError::CallbackFailed {
                identifier: identifier.to_string(),
                message: format!("{err:#}"),
            })
    }
}

impl std::fmt::Debug for CallbackRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("role", &self.role)
            .field("identifiers", &self.identifiers())
            .finish()
    }
}
