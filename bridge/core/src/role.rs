//! Process roles and role-restricted execution
//!
//! A process is either the host or the worker for its whole lifetime.
//! Callables bound to one role refuse to run in the other, whether invoked
//! directly or dispatched from the peer.
//!
//! Guards read the role from the process-wide token set by
//! [`ProcessRole::activate`]. A process that never activated a role (an
//! in-process harness running both halves) has no token; there the role of
//! the enclosing [`IpcContext::scope`](crate::IpcContext::scope) or listener
//! task stands in. With neither, every guard refuses.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Identity of a process in the bridge
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    /// Owns the application and spawns the worker
    Host,
    /// Runs the secondary engine, reachable only over IPC
    Worker,
}

static ACTIVE_ROLE: OnceLock<ProcessRole> = OnceLock::new();

tokio::task_local! {
    static SCOPED_ROLE: ProcessRole;
}

impl ProcessRole {
    /// Lowercase name, used in mailbox names and log fields
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Worker => "worker",
        }
    }

    /// The other role
    #[must_use]
    pub fn peer(self) -> Self {
        match self {
            Self::Host => Self::Worker,
            Self::Worker => Self::Host,
        }
    }

    /// Fix the role of the current process
    ///
    /// Activating the same role again is a no-op; switching roles is refused.
    pub fn activate(self) -> Result<Self> {
        let active = *ACTIVE_ROLE.get_or_init(|| self);
        if active == self {
            tracing::debug!(role = %self, "Process role active");
            Ok(active)
        } else {
            Err(BridgeError::RoleAlreadyActive {
                active,
                requested: self,
            })
        }
    }

    /// Role fixed by [`ProcessRole::activate`], if any
    #[must_use]
    pub fn active() -> Option<Self> {
        ACTIVE_ROLE.get().copied()
    }

    /// Role every guard is checked against
    ///
    /// The process-wide token when set, otherwise the role of the current
    /// task scope.
    #[must_use]
    pub fn current() -> Option<Self> {
        Self::active().or_else(|| SCOPED_ROLE.try_with(|role| *role).ok())
    }
}

/// Run `fut` with `role` as the task's role
///
/// Only consulted while no process-wide token is set.
pub(crate) async fn scoped<F: Future>(role: ProcessRole, fut: F) -> F::Output {
    SCOPED_ROLE.scope(role, fut).await
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessRole {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "host" => Ok(Self::Host),
            "worker" => Ok(Self::Worker),
            other => Err(format!("unknown process role: {other}")),
        }
    }
}

/// Binds a named callable to the role it may run in
#[derive(Clone, Debug)]
pub struct RoleGuard {
    required: ProcessRole,
    callable: String,
}

impl RoleGuard {
    /// Guard for `callable`, allowed only in `required`
    pub fn new(required: ProcessRole, callable: impl Into<String>) -> Self {
        Self {
            required,
            callable: callable.into(),
        }
    }

    /// Role the callable is bound to
    #[must_use]
    pub fn required(&self) -> ProcessRole {
        self.required
    }

    /// Name of the guarded callable
    #[must_use]
    pub fn callable(&self) -> &str {
        &self.callable
    }

    /// Fail with `WrongProcessRole` unless `active` is the required role
    pub fn check(&self, active: ProcessRole) -> Result<()> {
        if active == self.required {
            return Ok(());
        }
        tracing::warn!(
            callable = %self.callable,
            required = %self.required,
            active = %active,
            "Role-restricted call from the wrong process"
        );
        Err(BridgeError::WrongProcessRole {
            callable: self.callable.clone(),
            required: self.required,
            active: Some(active),
        })
    }

    /// Check against [`ProcessRole::current`]
    ///
    /// Fails with `WrongProcessRole` when no role is set at all.
    pub fn enforce(&self) -> Result<()> {
        match ProcessRole::current() {
            Some(active) => self.check(active),
            None => {
                tracing::warn!(
                    callable = %self.callable,
                    required = %self.required,
                    "Role-restricted call before a process role was set"
                );
                Err(BridgeError::WrongProcessRole {
                    callable: self.callable.clone(),
                    required: self.required,
                    active: None,
                })
            }
        }
    }
}

/// A function that only runs when the active role matches
///
/// ```
/// use bridge_core::{restrict_to, ProcessRole};
///
/// let double = restrict_to(ProcessRole::Host, "double", |x: i32| x * 2);
/// let render = restrict_to(ProcessRole::Worker, "render", |x: i32| x);
///
/// // No role yet: nothing runs
/// assert!(double.call(21).is_err());
///
/// ProcessRole::Host.activate().unwrap();
/// assert_eq!(double.call(21).unwrap(), 42);
/// assert!(render.call(1).is_err());
/// ```
#[derive(Clone, Debug)]
pub struct Restricted<F> {
    guard: RoleGuard,
    inner: F,
}

/// Wrap `inner` so it runs only in a process whose current role is `required`
pub fn restrict_to<F>(required: ProcessRole, callable: impl Into<String>, inner: F) -> Restricted<F> {
    Restricted {
        guard: RoleGuard::new(required, callable),
        inner,
    }
}

impl<F> Restricted<F> {
    /// Invoke the wrapped function after the role check
    ///
    /// The wrapped body is not executed when the check fails.
    pub fn call<A, R>(&self, args: A) -> Result<R>
    where
        F: Fn(A) -> R,
    {
        self.guard.enforce()?;
        Ok((self.inner)(args))
    }

    /// The guard applied to every call
    pub fn guard(&self) -> &RoleGuard {
        &self.guard
    }
}
