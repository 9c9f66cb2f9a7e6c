//! Command multiplexer integration tests: correlation, single-flight
//! discipline, timeouts, nesting, and shutdown.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use buslink::{
    loopback_pair, BusMessage, CallError, CommandMux, Dispatcher, FramedLink, HandlerError,
    Nested, OpcodeHandler,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

struct Echo;

#[async_trait]
impl OpcodeHandler for Echo {
    async fn handle(&self, msg: BusMessage) -> Result<Option<Bytes>, HandlerError> {
        Ok(Some(msg.data.slice(1..)))
    }
}

/// Holds every call until the test releases the gate.
struct Gated {
    gate: Arc<Notify>,
}

#[async_trait]
impl OpcodeHandler for Gated {
    async fn handle(&self, msg: BusMessage) -> Result<Option<Bytes>, HandlerError> {
        self.gate.notified().await;
        Ok(Some(msg.data.slice(1..)))
    }
}

fn linked_muxes(responder: Dispatcher, call_timeout: Duration) -> (CommandMux, CommandMux) {
    let (a, b) = loopback_pair(64);
    let a = FramedLink::new(Box::new(a), Duration::from_millis(20));
    let b = FramedLink::new(Box::new(b), Duration::from_millis(20));
    (
        CommandMux::with_timeout(a, Dispatcher::new(), call_timeout),
        CommandMux::with_timeout(b, responder, call_timeout),
    )
}

fn spawn_both(caller: &CommandMux, responder: &CommandMux, cancel: &CancellationToken) {
    let (c, r) = (caller.clone(), responder.clone());
    let (tc, tr) = (cancel.clone(), cancel.clone());
    tokio::spawn(async move { c.run(tc).await });
    tokio::spawn(async move { r.run(tr).await });
}

#[tokio::test]
async fn second_call_on_busy_channel_fails_immediately() {
    let gate = Arc::new(Notify::new());
    let responder_table = Dispatcher::new().with(1, Arc::new(Gated { gate: gate.clone() }));
    let (caller, responder) = linked_muxes(responder_table, Duration::from_secs(10));
    let cancel = CancellationToken::new();
    spawn_both(&caller, &responder, &cancel);

    let first = {
        let caller = caller.clone();
        tokio::spawn(async move { caller.call(7, 1, b"first").await })
    };
    // let the first call register and reach the gated handler
    tokio::time::sleep(Duration::from_millis(20)).await;

    let err = caller.call(7, 1, b"second").await.unwrap_err();
    assert!(matches!(err, CallError::Busy(7)));

    // the failed second call must not disturb the pending one
    gate.notify_one();
    let reply = first.await.unwrap().unwrap();
    assert_eq!(&reply[..], b"first");
    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn timeout_is_distinct_from_remote_error() {
    // no responder task: calls can never complete
    let (a, _b) = loopback_pair(64);
    let link = FramedLink::new(Box::new(a), Duration::from_millis(20));
    let caller = CommandMux::with_timeout(link, Dispatcher::new(), Duration::from_secs(10));

    let err = caller.call(1, 2, b"").await.unwrap_err();
    assert!(matches!(err, CallError::Timeout));

    // the channel is free again after the timeout
    let err = caller.call(1, 2, b"").await.unwrap_err();
    assert!(matches!(err, CallError::Timeout));
}

#[tokio::test]
async fn remote_failure_reported_as_remote() {
    struct Refuse;

    #[async_trait]
    impl OpcodeHandler for Refuse {
        async fn handle(&self, _msg: BusMessage) -> Result<Option<Bytes>, HandlerError> {
            Err("not today".into())
        }
    }

    let responder_table = Dispatcher::new().with(4, Arc::new(Refuse));
    let (caller, responder) = linked_muxes(responder_table, Duration::from_secs(10));
    let cancel = CancellationToken::new();
    spawn_both(&caller, &responder, &cancel);

    match caller.call(2, 4, b"").await.unwrap_err() {
        CallError::Remote(text) => assert_eq!(text, "not today"),
        other => panic!("expected remote error, got {other}"),
    }
    cancel.cancel();
}

#[tokio::test]
async fn nested_dispatch_two_levels_deep() {
    // innermost echo at opcode 5, wrapped twice
    let level2 = Dispatcher::new().with(5, Arc::new(Echo));
    let level1 = Dispatcher::new().with(6, Arc::new(Nested(level2)));
    let responder_table = Dispatcher::new().with(1, Arc::new(Nested(level1)));

    let (caller, responder) = linked_muxes(responder_table, Duration::from_secs(10));
    let cancel = CancellationToken::new();
    spawn_both(&caller, &responder, &cancel);

    // outer opcode 1 | inner opcode 6 | innermost opcode 5 | payload
    let args = [6u8 << 5, 5u8 << 5, 0xDE, 0xAD];
    let reply = caller.call(3, 1, &args).await.unwrap();
    assert_eq!(&reply[..], &[0xDE, 0xAD]);
    cancel.cancel();
}

#[tokio::test]
async fn concurrent_calls_on_distinct_channels() {
    let responder_table = Dispatcher::new().with(1, Arc::new(Echo));
    let (caller, responder) = linked_muxes(responder_table, Duration::from_secs(10));
    let cancel = CancellationToken::new();
    spawn_both(&caller, &responder, &cancel);

    let mut tasks = Vec::new();
    for ch in 0u16..8 {
        let caller = caller.clone();
        tasks.push(tokio::spawn(async move {
            let body = [ch as u8; 4];
            let reply = caller.call(ch, 1, &body).await.unwrap();
            assert_eq!(&reply[..], &body);
        }));
    }
    for t in tasks {
        t.await.unwrap();
    }
    cancel.cancel();
}

#[tokio::test]
async fn shutdown_fails_pending_calls() {
    let gate = Arc::new(Notify::new());
    let responder_table = Dispatcher::new().with(1, Arc::new(Gated { gate }));
    let (caller, responder) = linked_muxes(responder_table, Duration::from_secs(10));
    let cancel = CancellationToken::new();
    spawn_both(&caller, &responder, &cancel);

    let pending = {
        let caller = caller.clone();
        tokio::spawn(async move { caller.call(1, 1, b"").await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    // cancelling the reader fails the call instead of leaving it
    // suspended until the timeout
    cancel.cancel();
    let err = pending.await.unwrap().unwrap_err();
    assert!(matches!(err, CallError::Closed));
}
