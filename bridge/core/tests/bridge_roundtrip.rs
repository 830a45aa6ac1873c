//! Host/worker round trips through real transports
//!
//! Both halves run in this test process, each with its own `IpcContext`
//! sharing one rendezvous directory. Every scenario runs once per transport
//! strategy.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};

use bridge_core::envelope::{self, CallEnvelope};
use bridge_core::transport::{MailboxId, Transport, TransportConfig, TransportError, TransportStrategy};
use bridge_core::{
    restrict_to, Bridge, BridgeError, CallArgs, CallbackListener, CallbackProxy, CallbackRegistry,
    InstallOptions, IpcContext, ProcessRole,
};

// =============================================================================
// Helpers
// =============================================================================

fn strategies() -> Vec<TransportStrategy> {
    vec![
        TransportStrategy::File,
        #[cfg(unix)]
        TransportStrategy::Socket,
    ]
}

fn transport_config(strategy: TransportStrategy, root: &Path) -> TransportConfig {
    let mut config = TransportConfig::with_strategy(strategy, root);
    config.poll_interval_ms = 5;
    config.call_timeout_ms = 5000;
    config.connect_timeout_ms = 2000;
    config
}

fn worker_callbacks() -> CallbackRegistry {
    let registry = CallbackRegistry::new(ProcessRole::Worker);
    registry
        .register("worker.echo", |args: CallArgs| async move {
            Ok(json!({ "positional": args.positional, "keyword": args.keyword }))
        })
        .unwrap();
    registry
        .register("worker.add", |args: CallArgs| async move {
            let a = args.arg(0).and_then(Value::as_i64).unwrap_or(0);
            let b = args.arg(1).and_then(Value::as_i64).unwrap_or(0);
            Ok(json!(a + b))
        })
        .unwrap();
    registry
        .register("worker.fail", |_args: CallArgs| async {
            Err(anyhow::anyhow!("model file is corrupt"))
        })
        .unwrap();
    registry
}

fn host_callbacks() -> CallbackRegistry {
    let registry = CallbackRegistry::new(ProcessRole::Host);
    registry
        .register("host.greet", |args: CallArgs| async move {
            let name = args.kwarg("name").and_then(Value::as_str).unwrap_or("stranger");
            Ok(json!(format!("hello, {name}")))
        })
        .unwrap();
    registry
}

struct Pair {
    host: Bridge,
    worker: Bridge,
}

impl Pair {
    async fn install(strategy: TransportStrategy, root: &Path) -> Self {
        let worker_ctx = IpcContext::new(ProcessRole::Worker, transport_config(strategy, root)).unwrap();
        let host_ctx = IpcContext::new(ProcessRole::Host, transport_config(strategy, root)).unwrap();

        let worker = worker_ctx
            .install_bridge(worker_callbacks(), InstallOptions::default())
            .await
            .unwrap();
        let host = host_ctx
            .install_bridge(host_callbacks(), InstallOptions { clear_on_init: true })
            .await
            .unwrap();
        Self { host, worker }
    }

    async fn shutdown(self) {
        self.host.shutdown().await;
        self.worker.shutdown().await;
    }
}

/// Transport that holds every send back for a fixed delay
struct DelayedTransport {
    inner: Box<dyn Transport>,
    delay: Duration,
}

#[async_trait]
impl Transport for DelayedTransport {
    fn strategy(&self) -> TransportStrategy {
        self.inner.strategy()
    }

    fn inbox(&self) -> &MailboxId {
        self.inner.inbox()
    }

    async fn send(&mut self, peer: &MailboxId, payload: &[u8]) -> Result<(), TransportError> {
        tokio::time::sleep(self.delay).await;
        self.inner.send(peer, payload).await
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>, TransportError> {
        self.inner.receive(timeout).await
    }

    async fn clear(&mut self, mailbox: &MailboxId) -> Result<usize, TransportError> {
        self.inner.clear(mailbox).await
    }
}

// =============================================================================
// Round Trips
// =============================================================================

#[tokio::test]
async fn test_positional_keyword_and_empty_arguments() {
    for strategy in strategies() {
        let dir = tempfile::tempdir().unwrap();
        let pair = Pair::install(strategy, dir.path()).await;

        let sum = pair
            .host
            .invoke("worker.add", CallArgs::positional([json!(2), json!(40)]))
            .await
            .unwrap();
        assert_eq!(sum, json!(42), "{strategy}");

        let echoed = pair
            .host
            .invoke(
                "worker.echo",
                CallArgs::positional([json!("a")]).with_keyword("steps", 20),
            )
            .await
            .unwrap();
        assert_eq!(
            echoed,
            json!({ "positional": ["a"], "keyword": { "steps": 20 } }),
            "{strategy}"
        );

        let empty = pair.host.invoke("worker.echo", CallArgs::none()).await.unwrap();
        assert_eq!(empty, json!({ "positional": [], "keyword": {} }), "{strategy}");

        pair.shutdown().await;
    }
}

#[tokio::test]
async fn test_worker_calls_back_into_host() {
    for strategy in strategies() {
        let dir = tempfile::tempdir().unwrap();
        let pair = Pair::install(strategy, dir.path()).await;

        let greeting: String = pair
            .worker
            .proxy()
            .invoke_as("host.greet", CallArgs::none().with_keyword("name", "worker"))
            .await
            .unwrap();
        assert_eq!(greeting, "hello, worker", "{strategy}");

        pair.shutdown().await;
    }
}

#[tokio::test]
async fn test_unknown_identifier_is_a_remote_error() {
    for strategy in strategies() {
        let dir = tempfile::tempdir().unwrap();
        let pair = Pair::install(strategy, dir.path()).await;

        let started = Instant::now();
        let err = pair
            .host
            .invoke("worker.missing", CallArgs::none())
            .await
            .unwrap_err();
        match err {
            BridgeError::RemoteExecutionError { identifier, message } => {
                assert_eq!(identifier, "worker.missing");
                assert!(message.contains("no callback registered"), "{message}");
            }
            other => panic!("expected RemoteExecutionError, got {other:?}"),
        }
        assert!(started.elapsed() < Duration::from_secs(5));

        pair.shutdown().await;
    }
}

#[tokio::test]
async fn test_callback_failure_is_forwarded_as_text() {
    for strategy in strategies() {
        let dir = tempfile::tempdir().unwrap();
        let pair = Pair::install(strategy, dir.path()).await;

        let err = pair.host.invoke("worker.fail", CallArgs::none()).await.unwrap_err();
        assert!(
            matches!(&err, BridgeError::RemoteExecutionError { message, .. } if message.contains("model file is corrupt")),
            "{err:?}"
        );

        // The listener keeps serving after a failed callback
        let sum = pair
            .host
            .invoke("worker.add", CallArgs::positional([json!(1), json!(1)]))
            .await
            .unwrap();
        assert_eq!(sum, json!(2));

        pair.shutdown().await;
    }
}

// =============================================================================
// Role Restriction
// =============================================================================

#[tokio::test]
async fn test_role_bound_callbacks_refuse_the_other_role() {
    let dir = tempfile::tempdir().unwrap();
    let config = transport_config(TransportStrategy::File, dir.path());
    let host_ctx = IpcContext::new(ProcessRole::Host, config.clone()).unwrap();
    let worker_ctx = IpcContext::new(ProcessRole::Worker, config).unwrap();

    let worker = worker_callbacks();
    let err = host_ctx
        .scope(worker.call_local("worker.add", CallArgs::none()))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::WrongProcessRole {
            required: ProcessRole::Worker,
            active: Some(ProcessRole::Host),
            ..
        }
    ));

    let host = host_callbacks();
    let err = worker_ctx
        .scope(host.call_local("host.greet", CallArgs::none()))
        .await
        .unwrap()
        .unwrap_err();
    assert!(matches!(
        err,
        BridgeError::WrongProcessRole {
            required: ProcessRole::Host,
            active: Some(ProcessRole::Worker),
            ..
        }
    ));

    // Outside any role nothing runs
    assert!(matches!(
        host.call_local("host.greet", CallArgs::none()).await,
        Err(BridgeError::WrongProcessRole { active: None, .. })
    ));

    let render = restrict_to(ProcessRole::Worker, "worker.render", |n: u32| n);
    let refused = host_ctx.scope(async { render.call(1) }).await.unwrap();
    assert!(matches!(refused, Err(BridgeError::WrongProcessRole { .. })));
    let rendered = worker_ctx.scope(async { render.call(7) }).await.unwrap();
    assert_eq!(rendered.unwrap(), 7);
}

#[tokio::test]
async fn test_listener_in_wrong_process_refuses_dispatch() {
    for strategy in strategies() {
        let dir = tempfile::tempdir().unwrap();
        let config = transport_config(strategy, dir.path());

        // Worker-bound callbacks served by a listener running as the host
        let misplaced_ctx = IpcContext::new(ProcessRole::Host, config.clone()).unwrap();
        let mut listener = CallbackListener::start(
            worker_callbacks(),
            ProcessRole::Host,
            misplaced_ctx
                .open_transport(MailboxId::calls(ProcessRole::Worker))
                .unwrap(),
        );

        let caller_ctx = IpcContext::new(ProcessRole::Host, config).unwrap();
        let proxy = CallbackProxy::new(
            ProcessRole::Host,
            caller_ctx
                .open_transport(MailboxId::results(ProcessRole::Host))
                .unwrap(),
            Duration::from_secs(5),
        );

        let err = proxy
            .invoke("worker.add", CallArgs::positional([json!(1), json!(2)]))
            .await
            .unwrap_err();
        match err {
            BridgeError::RemoteExecutionError { message, .. } => {
                assert!(message.contains("restricted to the worker process"), "{message}");
            }
            other => panic!("expected RemoteExecutionError, got {other:?}"),
        }

        listener.stop().await;
    }
}

// =============================================================================
// Ordering
// =============================================================================

#[tokio::test]
async fn test_sequential_calls_resolve_in_issue_order_under_latency() {
    for strategy in strategies() {
        let dir = tempfile::tempdir().unwrap();
        let config = transport_config(strategy, dir.path());
        let worker_ctx = IpcContext::new(ProcessRole::Worker, config.clone()).unwrap();
        let host_ctx = IpcContext::new(ProcessRole::Host, config).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let registry = CallbackRegistry::new(ProcessRole::Worker);
        let log = Arc::clone(&seen);
        registry
            .register("worker.record", move |args: CallArgs| {
                let log = Arc::clone(&log);
                async move {
                    let n = args.arg(0).cloned().unwrap_or(Value::Null);
                    log.lock().push(n.clone());
                    Ok(n)
                }
            })
            .unwrap();

        let mut listener = CallbackListener::start(
            registry,
            ProcessRole::Worker,
            Box::new(DelayedTransport {
                inner: worker_ctx
                    .open_transport(MailboxId::calls(ProcessRole::Worker))
                    .unwrap(),
                delay: Duration::from_millis(40),
            }),
        );
        let proxy = Arc::new(CallbackProxy::new(
            ProcessRole::Host,
            Box::new(DelayedTransport {
                inner: host_ctx
                    .open_transport(MailboxId::results(ProcessRole::Host))
                    .unwrap(),
                delay: Duration::from_millis(25),
            }),
            Duration::from_secs(5),
        ));

        let first = proxy
            .invoke("worker.record", CallArgs::positional([json!(1)]))
            .await
            .unwrap();
        let second = proxy
            .invoke("worker.record", CallArgs::positional([json!(2)]))
            .await
            .unwrap();
        assert_eq!((first, second), (json!(1), json!(2)), "{strategy}");

        // Concurrent callers share the proxy; each gets its own answer
        let mut tasks = Vec::new();
        for n in 3..6 {
            let proxy = Arc::clone(&proxy);
            tasks.push(tokio::spawn(async move {
                proxy
                    .invoke("worker.record", CallArgs::positional([json!(n)]))
                    .await
                    .map(|v| (n, v))
            }));
        }
        for task in tasks {
            let (n, value) = task.await.unwrap().unwrap();
            assert_eq!(value, json!(n));
        }

        let seen = seen.lock().clone();
        assert_eq!(seen.len(), 5);
        assert_eq!(&seen[..2], &[json!(1), json!(2)]);

        listener.stop().await;
    }
}

// =============================================================================
// Stale State and Timeouts
// =============================================================================

#[tokio::test]
async fn test_stale_result_from_previous_session_is_cleared() {
    let dir = tempfile::tempdir().unwrap();
    let config = transport_config(TransportStrategy::File, dir.path());

    // A result nobody is waiting for, left in the host's results mailbox
    let worker_ctx = IpcContext::new(ProcessRole::Worker, config.clone()).unwrap();
    let mut stray = worker_ctx
        .open_transport(MailboxId::calls(ProcessRole::Worker))
        .unwrap();
    let orphan = CallEnvelope::new(ProcessRole::Host, "worker.add", CallArgs::none());
    stray
        .send(
            &MailboxId::results(ProcessRole::Host),
            &envelope::encode(&bridge_core::ResultEnvelope::ok(orphan.correlation_id, json!(-1)))
                .unwrap(),
        )
        .await
        .unwrap();
    drop(stray);

    let pair = Pair::install(TransportStrategy::File, dir.path()).await;
    let sum = pair
        .host
        .invoke("worker.add", CallArgs::positional([json!(3), json!(4)]))
        .await
        .unwrap();
    assert_eq!(sum, json!(7));
    pair.shutdown().await;
}

#[tokio::test]
async fn test_stale_call_is_never_dispatched_after_reinit() {
    let dir = tempfile::tempdir().unwrap();
    let config = transport_config(TransportStrategy::File, dir.path());

    let hits = Arc::new(AtomicUsize::new(0));
    let counting = || {
        let registry = CallbackRegistry::new(ProcessRole::Host);
        let hits = Arc::clone(&hits);
        registry
            .register("host.count", move |_args: CallArgs| {
                let hits = Arc::clone(&hits);
                async move { Ok(json!(hits.fetch_add(1, Ordering::SeqCst) + 1)) }
            })
            .unwrap();
        registry
    };

    // A crashed worker session left a call for the host behind
    let crashed = IpcContext::new(ProcessRole::Worker, config.clone()).unwrap();
    let mut sender = crashed
        .open_transport(MailboxId::results(ProcessRole::Worker))
        .unwrap();
    let stale = CallEnvelope::new(ProcessRole::Worker, "host.count", CallArgs::none());
    sender
        .send(&MailboxId::calls(ProcessRole::Host), &envelope::encode(&stale).unwrap())
        .await
        .unwrap();
    drop(sender);

    let host_ctx = IpcContext::new(ProcessRole::Host, config.clone()).unwrap();
    let host = host_ctx
        .install_bridge(counting(), InstallOptions { clear_on_init: true })
        .await
        .unwrap();
    let worker_ctx = IpcContext::new(ProcessRole::Worker, config).unwrap();
    let worker = worker_ctx
        .install_bridge(CallbackRegistry::new(ProcessRole::Worker), InstallOptions::default())
        .await
        .unwrap();

    let value = worker.invoke("host.count", CallArgs::none()).await.unwrap();
    assert_eq!(value, json!(1));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    worker.shutdown().await;
    host.shutdown().await;
}

#[tokio::test]
async fn test_call_queued_for_worker_is_dropped_on_host_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = transport_config(TransportStrategy::File, dir.path());

    let hits = Arc::new(AtomicUsize::new(0));
    let registry = CallbackRegistry::new(ProcessRole::Worker);
    let counter = Arc::clone(&hits);
    registry
        .register("worker.count", move |_args: CallArgs| {
            let counter = Arc::clone(&counter);
            async move { Ok(json!(counter.fetch_add(1, Ordering::SeqCst) + 1)) }
        })
        .unwrap();

    // The previous host queued a call and died before a worker took it
    let crashed = IpcContext::new(ProcessRole::Host, config.clone()).unwrap();
    let mut sender = crashed
        .open_transport(MailboxId::results(ProcessRole::Host))
        .unwrap();
    let stale = CallEnvelope::new(ProcessRole::Host, "worker.count", CallArgs::none());
    sender
        .send(&MailboxId::calls(ProcessRole::Worker), &envelope::encode(&stale).unwrap())
        .await
        .unwrap();
    drop(sender);

    // Restart: the host installs with clearing, then the worker joins as
    // `WorkerBootstrap` does
    let host_ctx = IpcContext::new(ProcessRole::Host, config.clone()).unwrap();
    let host = host_ctx
        .install_bridge(host_callbacks(), InstallOptions { clear_on_init: true })
        .await
        .unwrap();
    let worker_ctx = IpcContext::new(ProcessRole::Worker, config).unwrap();
    let worker = worker_ctx
        .install_bridge(registry, InstallOptions::default())
        .await
        .unwrap();

    let value = host.invoke("worker.count", CallArgs::none()).await.unwrap();
    assert_eq!(value, json!(1));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(hits.load(Ordering::SeqCst), 1);

    host.shutdown().await;
    worker.shutdown().await;
}

#[tokio::test]
async fn test_call_without_listener_times_out() {
    for strategy in strategies() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = transport_config(strategy, dir.path());
        config.connect_timeout_ms = 200;
        let host_ctx = IpcContext::new(ProcessRole::Host, config).unwrap();
        let host = host_ctx
            .install_bridge(host_callbacks(), InstallOptions { clear_on_init: true })
            .await
            .unwrap();

        let started = Instant::now();
        let err = host
            .proxy()
            .invoke_with_timeout("worker.add", CallArgs::none(), Duration::from_millis(300))
            .await
            .unwrap_err();
        assert!(err.is_retryable(), "{strategy}: {err:?}");
        if strategy == TransportStrategy::File {
            assert!(matches!(err, BridgeError::RemoteCallTimeout { .. }));
        }
        assert!(started.elapsed() < Duration::from_secs(3));

        host.shutdown().await;
    }
}
