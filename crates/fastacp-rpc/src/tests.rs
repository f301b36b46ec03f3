//! Engine scenarios over in-memory pipes.
//!
//! Two kinds of fixtures: a pair of engines wired to each other, and one
//! engine facing a raw line peer that lets a test read and write the exact
//! wire traffic.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use fastacp_core::{AcpError, ErrorCode, ProtocolConfig};
use fastacp_protocol::schema::methods::CANCEL_REQUEST;
use fastacp_transport::testing::{DEFAULT_PIPE_CAPACITY, LinePeer, connected_pair, line_peer};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;

use crate::{CancelOrigin, HandlerError, Protocol, ProtocolError, ProtocolState, RpcCallError};

const WAIT: Duration = Duration::from_secs(5);
const QUIET: Duration = Duration::from_millis(150);

fn engine_pair() -> (Protocol, Protocol) {
    let (a, b) = connected_pair();
    (
        Protocol::with_config(Arc::new(a), ProtocolConfig::default()),
        Protocol::with_config(Arc::new(b), ProtocolConfig::default()),
    )
}

fn started_pair() -> (Protocol, Protocol) {
    let (a, b) = engine_pair();
    a.start().unwrap();
    b.start().unwrap();
    (a, b)
}

fn engine_with_raw_peer(config: ProtocolConfig) -> (Protocol, LinePeer) {
    let (transport, peer) = line_peer(DEFAULT_PIPE_CAPACITY);
    (Protocol::with_config(Arc::new(transport), config), peer)
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_echo_request_wire_format() {
    let (protocol, mut peer) = engine_with_raw_peer(ProtocolConfig::default());
    protocol.set_request_handler("test/testRequest", |_ctx, params| async move {
        Ok(params.unwrap_or(Value::Null))
    });
    protocol.start().unwrap();

    peer.send(&json!({
        "jsonrpc": "2.0",
        "id": 5,
        "method": "test/testRequest",
        "params": { "message": "Test" }
    }))
    .await
    .unwrap();

    assert_eq!(
        peer.recv().await.unwrap(),
        json!({ "jsonrpc": "2.0", "id": 5, "result": { "message": "Test" } })
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unknown_method_gets_method_not_found() {
    let (a, _b) = started_pair();
    let err = a.send_request("no/such", None).await.unwrap_err();
    let remote = err.as_remote().expect("remote error");
    assert_eq!(remote.code, ErrorCode::MethodNotFound);
    assert_eq!(remote.message, "Method not found: no/such");
    assert_eq!(a.pending_outgoing_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_out_of_order_responses_reach_their_callers() {
    let (protocol, mut peer) = engine_with_raw_peer(ProtocolConfig::default());
    protocol.start().unwrap();

    let mut calls = Vec::new();
    for n in 0..3 {
        let protocol = protocol.clone();
        calls.push(tokio::spawn(async move {
            protocol.send_request("count", Some(json!({ "n": n }))).await
        }));
    }

    let mut requests = Vec::new();
    for _ in 0..3 {
        requests.push(peer.recv().await.unwrap());
    }
    for request in requests.iter().rev() {
        peer.send(&json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "result": { "echo": request["params"]["n"] }
        }))
        .await
        .unwrap();
    }

    for (n, call) in calls.into_iter().enumerate() {
        let result = call.await.unwrap().unwrap();
        assert_eq!(result, json!({ "echo": n }));
    }
    assert_eq!(protocol.pending_outgoing_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_orphaned_response_is_ignored() {
    let (protocol, mut peer) = engine_with_raw_peer(ProtocolConfig::default());
    protocol.set_request_handler("ping", |_ctx, _params| async { Ok(json!("pong")) });
    protocol.start().unwrap();

    peer.send(&json!({ "jsonrpc": "2.0", "id": 999, "result": {} }))
        .await
        .unwrap();
    peer.send(&json!({ "jsonrpc": "2.0", "id": 1, "method": "ping" }))
        .await
        .unwrap();
    assert_eq!(peer.recv().await.unwrap()["result"], json!("pong"));
    assert_eq!(protocol.state(), ProtocolState::Started);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_notifications_delivered_in_order() {
    let (a, b) = engine_pair();
    let (tx, mut rx) = mpsc::unbounded_channel();
    b.set_notification_handler("log", move |_ctx, params| {
        let _ = tx.send(params);
        async { Ok(()) }
    });
    a.start().unwrap();
    b.start().unwrap();

    for n in 0..5 {
        a.send_notification("log", Some(json!(n))).unwrap();
    }
    for n in 0..5 {
        let params = timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(params, Some(json!(n)));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handler_error_mapping() {
    let (a, b) = started_pair();
    b.set_request_handler("expected", |_ctx, _params| async {
        Err(HandlerError::expected("Unknown session"))
    });
    b.set_request_handler("auth", |_ctx, _params| async {
        Err(HandlerError::Rpc(AcpError::auth_required("login first")))
    });
    b.set_request_handler("panics", |_ctx, _params| async {
        if true {
            panic!("handler blew up");
        }
        Ok(Value::Null)
    });

    let err = a.send_request("expected", None).await.unwrap_err();
    let remote = err.as_remote().unwrap();
    assert_eq!(remote.code, ErrorCode::InvalidParams);
    assert_eq!(remote.message, "Unknown session");

    let err = a.send_request("auth", None).await.unwrap_err();
    assert_eq!(err.as_remote().unwrap().code, ErrorCode::AuthRequired);

    let err = a.send_request("panics", None).await.unwrap_err();
    let remote = err.as_remote().unwrap();
    assert_eq!(remote.code, ErrorCode::InternalError);
    assert!(remote.message.contains("handler blew up"));

    // The engine survives the panic.
    let err = a.send_request("expected", None).await.unwrap_err();
    assert_eq!(err.as_remote().unwrap().code, ErrorCode::InvalidParams);
    assert_eq!(b.pending_incoming_count(), 0);
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Add {
    a: i64,
    b: i64,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
struct Sum {
    sum: i64,
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_typed_handlers_and_calls() {
    let (a, b) = started_pair();
    b.set_typed_request_handler("add", |_ctx, params: Add| async move {
        Ok(Sum {
            sum: params.a + params.b,
        })
    });

    let sum: Sum = a.request("add", &Add { a: 2, b: 3 }).await.unwrap();
    assert_eq!(sum, Sum { sum: 5 });

    let err = a
        .send_request("add", Some(json!({ "a": "two" })))
        .await
        .unwrap_err();
    assert_eq!(err.as_remote().unwrap().code, ErrorCode::ParseError);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_typed_calls_take_unsized_params() {
    let (a, b) = started_pair();
    b.set_typed_request_handler("total", |_ctx, items: Vec<i64>| async move {
        Ok(items.iter().sum::<i64>())
    });
    let (note_tx, mut note_rx) = mpsc::unbounded_channel();
    b.set_typed_notification_handler("note", move |_ctx, text: String| {
        let _ = note_tx.send(text);
        async { Ok(()) }
    });

    let items: &[i64] = &[1, 2, 3];
    let total: i64 = a.request("total", items).await.unwrap();
    assert_eq!(total, 6);

    a.notify("note", "hello").unwrap();
    let note = timeout(WAIT, note_rx.recv()).await.unwrap().unwrap();
    assert_eq!(note, "hello");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_configured_size_limit_reaches_transport() {
    let mut config = ProtocolConfig::default();
    config.max_message_size = 128;
    let (protocol, mut peer) = engine_with_raw_peer(config);
    protocol.set_request_handler("ping", |_ctx, _params| async { Ok(json!("pong")) });
    protocol.start().unwrap();

    peer.send(&json!({
        "jsonrpc": "2.0",
        "id": 1,
        "method": "ping",
        "params": { "padding": "x".repeat(256) }
    }))
    .await
    .unwrap();
    assert!(peer.recv_within(QUIET).await.is_none());

    peer.send(&json!({ "jsonrpc": "2.0", "id": 2, "method": "ping" }))
        .await
        .unwrap();
    let response = peer.recv().await.unwrap();
    assert_eq!(response["id"], json!(2));
    assert_eq!(response["result"], json!("pong"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_nested_call_back_to_caller() {
    let (a, b) = started_pair();
    a.set_request_handler("a/name", |_ctx, _params| async { Ok(json!("alice")) });
    b.set_request_handler("b/greet", |ctx, _params| async move {
        let name = ctx.protocol().send_request("a/name", None).await?;
        Ok::<_, HandlerError>(json!(format!("hello {}", name.as_str().unwrap_or_default())))
    });

    let greeting = a.send_request("b/greet", None).await.unwrap();
    assert_eq!(greeting, json!("hello alice"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handlers_interleave_on_single_worker() {
    let (a, b) = started_pair();
    let (gate_tx, gate_rx) = oneshot::channel::<()>();
    let gate = Arc::new(std::sync::Mutex::new(Some(gate_rx)));
    let gate_tx = Arc::new(std::sync::Mutex::new(Some(gate_tx)));

    b.set_request_handler("wait", move |_ctx, _params| {
        let gate = gate.lock().unwrap().take();
        async move {
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            Ok(json!("waited"))
        }
    });
    b.set_request_handler("open", move |_ctx, _params| {
        let gate_tx = gate_tx.lock().unwrap().take();
        async move {
            if let Some(tx) = gate_tx {
                let _ = tx.send(());
            }
            Ok(json!("opened"))
        }
    });

    let waiting = {
        let a = a.clone();
        tokio::spawn(async move { a.send_request("wait", None).await })
    };
    assert_eq!(a.send_request("open", None).await.unwrap(), json!("opened"));
    assert_eq!(
        timeout(WAIT, waiting).await.unwrap().unwrap().unwrap(),
        json!("waited")
    );
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bulk_cancel_reaches_remote_handler() {
    let (a, b) = started_pair();
    let (started_tx, started_rx) = oneshot::channel();
    let started_tx = Arc::new(std::sync::Mutex::new(Some(started_tx)));
    let (seen_tx, seen_rx) = oneshot::channel();
    let seen_tx = Arc::new(std::sync::Mutex::new(Some(seen_tx)));

    b.set_request_handler("forever", move |ctx, _params| {
        let started = started_tx.lock().unwrap().take();
        let seen = seen_tx.lock().unwrap().take();
        async move {
            if let Some(started) = started {
                let _ = started.send(());
            }
            ctx.cancelled().await;
            if let Some(seen) = seen {
                let _ = seen.send(ctx.cancellation().cloned());
            }
            Err(HandlerError::Cancelled("stopped".into()))
        }
    });

    let call = {
        let a = a.clone();
        tokio::spawn(async move { a.send_request("forever", None).await })
    };
    timeout(WAIT, started_rx).await.unwrap().unwrap();
    a.cancel_pending_outgoing_requests("user abort");

    let err = timeout(WAIT, call).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(
        &err,
        RpcCallError::Cancelled { origin: CancelOrigin::Local, reason } if reason == "user abort"
    ));

    let observed = timeout(WAIT, seen_rx).await.unwrap().unwrap().unwrap();
    assert_eq!(observed.origin, CancelOrigin::Remote);
    assert_eq!(observed.reason, "user abort");
    assert_eq!(a.pending_outgoing_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dropped_call_sends_exactly_one_cancel() {
    let (protocol, mut peer) = engine_with_raw_peer(ProtocolConfig::default());
    protocol.start().unwrap();

    let call = {
        let protocol = protocol.clone();
        tokio::spawn(async move { protocol.send_request("slow", None).await })
    };
    let request = peer.recv().await.unwrap();
    call.abort();
    let _ = call.await;

    let cancel = peer.recv().await.unwrap();
    assert_eq!(cancel["method"], json!(CANCEL_REQUEST));
    assert_eq!(cancel["params"]["requestId"], request["id"]);
    assert!(cancel.get("id").is_none());
    assert!(peer.recv_within(QUIET).await.is_none());
    assert_eq!(protocol.pending_outgoing_count(), 0);

    // A late answer is an orphan.
    peer.send(&json!({ "jsonrpc": "2.0", "id": request["id"], "result": 1 }))
        .await
        .unwrap();
    assert!(peer.recv_within(QUIET).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_cancelled_response_sends_no_cancel() {
    let (protocol, mut peer) = engine_with_raw_peer(ProtocolConfig::default());
    protocol.start().unwrap();

    let call = {
        let protocol = protocol.clone();
        tokio::spawn(async move { protocol.send_request("slow", None).await })
    };
    let request = peer.recv().await.unwrap();
    peer.send(&json!({
        "jsonrpc": "2.0",
        "id": request["id"],
        "error": { "code": -32800, "message": "agent stopped" }
    }))
    .await
    .unwrap();

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(
        &err,
        RpcCallError::Cancelled { origin: CancelOrigin::Remote, reason } if reason == "agent stopped"
    ));
    assert!(peer.recv_within(QUIET).await.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_remote_cancel_suppresses_response() {
    let (protocol, mut peer) = engine_with_raw_peer(ProtocolConfig::default());
    let (started_tx, started_rx) = oneshot::channel();
    let started_tx = Arc::new(std::sync::Mutex::new(Some(started_tx)));
    protocol.set_request_handler("forever", move |ctx, _params| {
        let started = started_tx.lock().unwrap().take();
        async move {
            if let Some(started) = started {
                let _ = started.send(());
            }
            ctx.cancelled().await;
            Ok(Value::Null)
        }
    });
    protocol.start().unwrap();

    peer.send(&json!({ "jsonrpc": "2.0", "id": "r1", "method": "forever" }))
        .await
        .unwrap();
    timeout(WAIT, started_rx).await.unwrap().unwrap();
    assert_eq!(protocol.pending_incoming_count(), 1);

    peer.send(&json!({
        "jsonrpc": "2.0",
        "method": CANCEL_REQUEST,
        "params": { "requestId": "r1", "message": "never mind" }
    }))
    .await
    .unwrap();

    assert!(peer.recv_within(QUIET).await.is_none());
    assert_eq!(protocol.pending_incoming_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_local_incoming_cancel_answers_cancelled() {
    let (a, b) = started_pair();
    let (started_tx, started_rx) = oneshot::channel();
    let started_tx = Arc::new(std::sync::Mutex::new(Some(started_tx)));
    b.set_request_handler("forever", move |ctx, _params| {
        let started = started_tx.lock().unwrap().take();
        async move {
            if let Some(started) = started {
                let _ = started.send(());
            }
            ctx.cancelled().await;
            ctx.checkpoint()?;
            Ok::<_, HandlerError>(Value::Null)
        }
    });

    let call = {
        let a = a.clone();
        tokio::spawn(async move { a.send_request("forever", None).await })
    };
    timeout(WAIT, started_rx).await.unwrap().unwrap();
    b.cancel_pending_incoming_requests("shutting down");

    let err = timeout(WAIT, call).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(
        &err,
        RpcCallError::Cancelled { origin: CancelOrigin::Remote, reason } if reason == "shutting down"
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_for_unknown_request_is_ignored() {
    let (protocol, mut peer) = engine_with_raw_peer(ProtocolConfig::default());
    protocol.set_request_handler("ping", |_ctx, _params| async { Ok(json!("pong")) });
    protocol.start().unwrap();

    peer.send(&json!({
        "jsonrpc": "2.0",
        "method": CANCEL_REQUEST,
        "params": { "requestId": 77 }
    }))
    .await
    .unwrap();
    peer.send(&json!({ "jsonrpc": "2.0", "id": 2, "method": "ping" }))
        .await
        .unwrap();
    assert_eq!(peer.recv().await.unwrap()["result"], json!("pong"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_configured_timeout_cancels_remote() {
    let config = ProtocolConfig::default().with_request_timeout(Duration::from_millis(50));
    let (protocol, mut peer) = engine_with_raw_peer(config);
    protocol.start().unwrap();

    let err = protocol.send_request("slow", None).await.unwrap_err();
    assert!(matches!(err, RpcCallError::Timeout(_)));

    let request = peer.recv().await.unwrap();
    let cancel = peer.recv().await.unwrap();
    assert_eq!(cancel["method"], json!(CANCEL_REQUEST));
    assert_eq!(cancel["params"]["requestId"], request["id"]);
    assert!(peer.recv_within(QUIET).await.is_none());
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lifecycle_transitions() {
    let (a, _b) = engine_pair();
    assert_eq!(a.state(), ProtocolState::Created);
    assert!(matches!(
        a.send_request("x", None).await,
        Err(RpcCallError::NotStarted)
    ));

    a.start().unwrap();
    assert_eq!(a.state(), ProtocolState::Started);
    assert!(matches!(a.start(), Err(ProtocolError::AlreadyStarted)));

    a.close();
    a.close();
    assert_eq!(a.state(), ProtocolState::Closed);
    assert!(matches!(a.start(), Err(ProtocolError::Closed)));
    assert!(matches!(
        a.send_request("x", None).await,
        Err(RpcCallError::Closed)
    ));
    assert!(a.send_notification("x", None).is_err());
}

#[test]
fn test_start_requires_runtime() {
    let (a, _b) = engine_pair();
    assert!(matches!(a.start(), Err(ProtocolError::NoRuntime)));
    assert_eq!(a.state(), ProtocolState::Created);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_cancels_pending_calls() {
    let (a, b) = started_pair();
    let entered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&entered);
    b.set_request_handler("forever", move |ctx, _params| {
        counter.fetch_add(1, Ordering::SeqCst);
        async move {
            ctx.cancelled().await;
            Ok(Value::Null)
        }
    });

    let call = {
        let a = a.clone();
        tokio::spawn(async move { a.send_request("forever", None).await })
    };
    while entered.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    a.close();

    let err = timeout(WAIT, call).await.unwrap().unwrap().unwrap_err();
    assert!(matches!(
        &err,
        RpcCallError::Cancelled { origin: CancelOrigin::Local, reason } if reason == crate::CLOSED_REASON
    ));
    assert_eq!(a.pending_outgoing_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_peer_close_closes_engine() {
    let (a, b) = started_pair();
    a.close();
    timeout(WAIT, b.closed()).await.unwrap();
    assert_eq!(b.state(), ProtocolState::Closed);
}
