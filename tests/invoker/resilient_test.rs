//! Tests for `src/invoker/mod.rs`: retry, breaker and cancellation.

use std::io::{Cursor, Write};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use harbormaster::audit::AuditTrail;
use harbormaster::config::{BreakerConfig, RetryConfig};
use harbormaster::invoker::{CallFailure, CircuitState, InvokeError, ResilientInvoker};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
struct SharedBuf(Arc<Mutex<Cursor<Vec<u8>>>>);

impl SharedBuf {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Cursor::new(Vec::new()))))
    }

    fn contents(&self) -> String {
        let cursor = self.0.lock().expect("test lock");
        String::from_utf8_lossy(cursor.get_ref()).to_string()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().expect("test lock").write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.0.lock().expect("test lock").flush()
    }
}

struct SetOnDrop(Arc<AtomicBool>);

impl Drop for SetOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

fn breaker(threshold: u32, max_requests: u32) -> BreakerConfig {
    BreakerConfig {
        max_requests,
        interval_secs: 0,
        cooldown_secs: 30,
        failure_threshold: threshold,
    }
}

fn retry(max_attempts: u32) -> RetryConfig {
    RetryConfig {
        max_attempts,
        wait_min_ms: 100,
        wait_max_ms: 1_000,
        request_timeout_secs: 5,
    }
}

fn status(code: u16) -> CallFailure {
    CallFailure::Status {
        status: code,
        retry_after: None,
        body: "upstream says no".to_owned(),
    }
}

fn invoker(threshold: u32, max_requests: u32, attempts: u32) -> (ResilientInvoker, SharedBuf) {
    let buf = SharedBuf::new();
    let audit = Arc::new(AuditTrail::from_writer(Box::new(buf.clone())));
    (
        ResilientInvoker::new(&breaker(threshold, max_requests), &retry(attempts), audit),
        buf,
    )
}

#[tokio::test(start_paused = true)]
async fn opens_after_consecutive_failures_and_fails_fast() {
    let (invoker, buf) = invoker(3, 1, 1);
    let cancel = CancellationToken::new();
    let calls = AtomicU32::new(0);

    for _ in 0..3 {
        let result: Result<(), _> = invoker
            .call("crm", "get", &cancel, || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(status(503))
            })
            .await;
        assert!(matches!(result, Err(InvokeError::Status { status: 503, .. })));
    }
    assert_eq!(
        invoker.breaker_stats("crm").expect("stats").state,
        CircuitState::Open
    );

    let result: Result<(), _> = invoker
        .call("crm", "get", &cancel, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await;
    let err = result.expect_err("refused");
    assert!(err.is_circuit_open());
    assert_eq!(calls.load(Ordering::SeqCst), 3, "wrapped call not invoked");

    let log = buf.contents();
    assert!(log.contains("\"action\":\"circuit_breaker_state_change\""));
    assert!(log.contains("\"action\":\"integration_crm_get\""));
}

#[tokio::test(start_paused = true)]
async fn cooldown_then_trial_success_closes() {
    let (invoker, _) = invoker(1, 1, 1);
    let cancel = CancellationToken::new();

    let _: Result<(), _> = invoker
        .call("billing", "post", &cancel, || async { Err(status(500)) })
        .await;
    tokio::time::advance(Duration::from_secs(31)).await;

    let value = invoker
        .call("billing", "post", &cancel, || async { Ok::<_, CallFailure>(7) })
        .await
        .expect("trial call succeeds");
    assert_eq!(value, 7);
    let stats = invoker.breaker_stats("billing").expect("stats");
    assert_eq!(stats.state, CircuitState::Closed);
    assert_eq!(stats.consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn trial_failure_reopens() {
    let (invoker, _) = invoker(1, 1, 1);
    let cancel = CancellationToken::new();

    let _: Result<(), _> = invoker
        .call("billing", "post", &cancel, || async { Err(status(500)) })
        .await;
    tokio::time::advance(Duration::from_secs(31)).await;
    let _: Result<(), _> = invoker
        .call("billing", "post", &cancel, || async {
            Err(CallFailure::Transport("connection reset".to_owned()))
        })
        .await;

    assert_eq!(
        invoker.breaker_stats("billing").expect("stats").state,
        CircuitState::Open
    );
}

#[tokio::test(start_paused = true)]
async fn retry_after_delays_next_attempt() {
    let (invoker, _) = invoker(5, 1, 3);
    let cancel = CancellationToken::new();
    let attempts = Mutex::new(Vec::new());

    let value = invoker
        .call("crm", "get", &cancel, || {
            let mut seen = attempts.lock().expect("test lock");
            seen.push(Instant::now());
            let first = seen.len() == 1;
            async move {
                if first {
                    Err(CallFailure::Status {
                        status: 429,
                        retry_after: Some(Duration::from_secs(2)),
                        body: String::new(),
                    })
                } else {
                    Ok("done")
                }
            }
        })
        .await
        .expect("second attempt succeeds");
    assert_eq!(value, "done");

    let seen = attempts.lock().expect("test lock");
    assert_eq!(seen.len(), 2);
    assert!(seen[1].duration_since(seen[0]) >= Duration::from_secs(2));
}

#[tokio::test(start_paused = true)]
async fn transport_errors_retry_up_to_max_attempts() {
    let (invoker, _) = invoker(10, 1, 4);
    let cancel = CancellationToken::new();
    let calls = AtomicU32::new(0);

    let result: Result<(), _> = invoker
        .call("crm", "get", &cancel, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CallFailure::Transport("connection refused".to_owned()))
        })
        .await;

    assert!(matches!(result, Err(InvokeError::Transport { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    // One admitted call, one breaker failure.
    assert_eq!(
        invoker.breaker_stats("crm").expect("stats").consecutive_failures,
        1
    );
}

#[tokio::test(start_paused = true)]
async fn client_errors_are_not_retried_but_count_against_breaker() {
    let (invoker, _) = invoker(1, 1, 4);
    let cancel = CancellationToken::new();
    let calls = AtomicU32::new(0);

    let result: Result<(), _> = invoker
        .call("crm", "get", &cancel, || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(status(404))
        })
        .await;

    assert!(matches!(result, Err(InvokeError::Status { status: 404, .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let stats = invoker.breaker_stats("crm").expect("stats");
    assert_eq!(stats.state, CircuitState::Open);
    assert_eq!(stats.total_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn cancellation_drops_the_in_flight_attempt() {
    let (invoker, _) = invoker(1, 1, 3);
    let cancel = CancellationToken::new();
    let dropped = Arc::new(AtomicBool::new(false));

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(1)).await;
        trigger.cancel();
    });

    let flag = dropped.clone();
    let result: Result<(), _> = invoker
        .call("crm", "get", &cancel, || {
            let guard = SetOnDrop(flag.clone());
            async move {
                let _guard = guard;
                tokio::time::sleep(Duration::from_secs(3_600)).await;
                Ok(())
            }
        })
        .await;

    assert!(matches!(result, Err(InvokeError::Cancelled { .. })));
    assert!(dropped.load(Ordering::SeqCst), "attempt future was dropped");
    let stats = invoker.breaker_stats("crm").expect("stats");
    assert_eq!(stats.state, CircuitState::Closed);
    assert_eq!(stats.total_failures, 0);
}
