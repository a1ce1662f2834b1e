//! End-to-end bridge scenarios driven through a loopback worker.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use sidecar::bridge::{
    BridgeConfig, BridgeError, BridgeState, ExecuteOptions, LoopbackSpawner, MessageKind,
    RequestId, RetryPolicy, Task, TaskBridge, TaskResponse, WorkerEndpoint,
};

/// No message should arrive within this window.
const QUIET: Duration = Duration::from_millis(50);

struct Harness {
    bridge: Arc<TaskBridge>,
    endpoint: WorkerEndpoint,
    endpoints: UnboundedReceiver<WorkerEndpoint>,
}

async fn handshake(
    bridge: &TaskBridge,
    endpoints: &mut UnboundedReceiver<WorkerEndpoint>,
) -> WorkerEndpoint {
    let init = bridge.initialize();
    let worker = async {
        let mut endpoint = endpoints.recv().await.expect("bridge spawned a worker");
        let message = endpoint.recv().await.expect("init message");
        assert_eq!(message.kind(), MessageKind::Init);
        endpoint
            .responder()
            .respond(TaskResponse::ok(message.id, Value::Null));
        endpoint
    };
    let (result, endpoint) = tokio::join!(init, worker);
    result.expect("handshake succeeds");
    endpoint
}

async fn ready(config: BridgeConfig) -> Harness {
    let (spawner, mut endpoints) = LoopbackSpawner::new();
    let bridge = Arc::new(TaskBridge::new(config, Arc::new(spawner)));
    let endpoint = handshake(&bridge, &mut endpoints).await;
    Harness {
        bridge,
        endpoint,
        endpoints,
    }
}

#[tokio::test]
async fn test_back_to_back_calls_with_single_slot() {
    let Harness {
        bridge,
        mut endpoint,
        ..
    } = ready(BridgeConfig::default().with_max_concurrent(1)).await;
    let responder = endpoint.responder();

    let first = bridge
        .submit(&Task::summarize("first"), &ExecuteOptions::new())
        .await
        .unwrap();
    let second = bridge
        .submit(&Task::summarize("second"), &ExecuteOptions::new())
        .await
        .unwrap();

    let message = endpoint.recv().await.unwrap();
    assert_eq!(message.id, first.id());
    assert_eq!(message.payload["text"], json!("first"));
    assert_eq!(bridge.in_flight(), 1);
    assert_eq!(bridge.queued(), 1);

    // The second request stays queued until the first settles
    assert!(timeout(QUIET, endpoint.recv()).await.is_err());

    responder.respond(TaskResponse::ok(first.id(), json!("one")));
    assert_eq!(first.wait().await.unwrap(), json!("one"));

    let message = endpoint.recv().await.unwrap();
    assert_eq!(message.id, second.id());
    responder.respond(TaskResponse::ok(second.id(), json!("two")));
    assert_eq!(second.wait().await.unwrap(), json!("two"));
}

#[tokio::test]
async fn test_out_of_order_responses_route_by_id() {
    let Harness {
        bridge,
        mut endpoint,
        ..
    } = ready(BridgeConfig::default()).await;
    let responder = endpoint.responder();

    let mut handles = Vec::new();
    for text in ["a", "b", "c"] {
        handles.push(
            bridge
                .submit(&Task::summarize(text), &ExecuteOptions::new())
                .await
                .unwrap(),
        );
    }
    let mut messages = Vec::new();
    for _ in 0..3 {
        messages.push(endpoint.recv().await.unwrap());
    }

    for message in messages.iter().rev() {
        let text = message.payload["text"].clone();
        responder.respond(TaskResponse::ok(message.id, text));
    }

    let results: Vec<Value> = futures::future::join_all(handles.into_iter().map(|h| h.wait()))
        .await
        .into_iter()
        .map(Result::unwrap)
        .collect();
    assert_eq!(results, vec![json!("a"), json!("b"), json!("c")]);
}

#[tokio::test]
async fn test_timeout_without_response() {
    let Harness {
        bridge,
        mut endpoint,
        ..
    } = ready(BridgeConfig::default()).await;

    let options = ExecuteOptions::new().with_timeout(Duration::from_millis(50));
    let started = tokio::time::Instant::now();
    let (result, message) = tokio::join!(
        bridge.execute(Task::summarize("slow"), options),
        endpoint.recv()
    );
    let message = message.unwrap();

    assert_eq!(
        result.unwrap_err(),
        BridgeError::Timeout {
            id: message.id,
            timeout_ms: 50
        }
    );
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(!bridge.is_pending(message.id));
    assert_eq!(bridge.in_flight(), 0);

    // A late response is discarded without disturbing the bridge
    endpoint
        .responder()
        .respond(TaskResponse::ok(message.id, json!("late")));
    tokio::time::sleep(Duration::from_millis(20)).await;
    let stats = bridge.stats();
    assert_eq!(stats.timed_out, 1);
    assert_eq!(stats.discarded, 1);
    assert_eq!(bridge.state(), BridgeState::Ready);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_response_racing_timeout_settles_once() {
    const ROUNDS: u64 = 40;
    let Harness {
        bridge,
        mut endpoint,
        ..
    } = ready(BridgeConfig::default()).await;
    let responder = endpoint.responder();

    for _ in 0..ROUNDS {
        let handle = bridge
            .submit(
                &Task::summarize("race"),
                &ExecuteOptions::new().with_timeout(Duration::from_millis(5)),
            )
            .await
            .unwrap();
        let message = endpoint.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        responder.respond(TaskResponse::ok(message.id, json!(true)));

        match handle.wait().await {
            Ok(value) => assert_eq!(value, json!(true)),
            Err(BridgeError::Timeout { id, .. }) => assert_eq!(id, message.id),
            Err(other) => panic!("unexpected outcome: {}", other),
        }
    }

    tokio::time::sleep(Duration::from_millis(50)).await;
    let stats = bridge.stats();
    assert_eq!(stats.completed + stats.timed_out, ROUNDS);
    assert_eq!(stats.discarded, stats.timed_out);
    assert_eq!(stats.pending, 0);
    assert_eq!(stats.in_flight, 0);
}

#[tokio::test]
async fn test_cancel_in_flight_sends_abort() {
    let Harness {
        bridge,
        mut endpoint,
        ..
    } = ready(BridgeConfig::default()).await;
    let token = CancellationToken::new();

    let handle = bridge
        .submit(
            &Task::summarize("x"),
            &ExecuteOptions::new().with_cancellation(token.clone()),
        )
        .await
        .unwrap();
    let message = endpoint.recv().await.unwrap();
    token.cancel();

    assert_eq!(
        handle.wait().await.unwrap_err(),
        BridgeError::Cancelled(message.id)
    );
    let abort = endpoint.recv().await.unwrap();
    assert_eq!(abort.kind(), MessageKind::Abort);
    assert_eq!(abort.id, message.id);
    assert_eq!(bridge.stats().cancelled, 1);
}

#[tokio::test]
async fn test_cancel_queued_never_transmits() {
    let Harness {
        bridge,
        mut endpoint,
        ..
    } = ready(BridgeConfig::default().with_max_concurrent(1)).await;
    let responder = endpoint.responder();

    let first = bridge
        .submit(&Task::summarize("first"), &ExecuteOptions::new())
        .await
        .unwrap();
    let queued = bridge
        .submit(&Task::summarize("queued"), &ExecuteOptions::new())
        .await
        .unwrap();
    let queued_id = queued.id();
    endpoint.recv().await.unwrap();

    assert!(bridge.abort(queued_id));
    assert!(!bridge.abort(queued_id));
    assert_eq!(
        queued.wait().await.unwrap_err(),
        BridgeError::Cancelled(queued_id)
    );

    responder.respond(TaskResponse::ok(first.id(), Value::Null));
    first.wait().await.unwrap();

    // Neither the task nor an abort for it reaches the worker
    assert!(timeout(QUIET, endpoint.recv()).await.is_err());
}

#[tokio::test]
async fn test_dispose_rejects_queued_and_in_flight() {
    let Harness {
        bridge,
        mut endpoint,
        ..
    } = ready(BridgeConfig::default().with_max_concurrent(1)).await;

    let in_flight = bridge
        .submit(&Task::summarize("a"), &ExecuteOptions::new())
        .await
        .unwrap();
    let queued = bridge
        .submit(&Task::summarize("b"), &ExecuteOptions::new())
        .await
        .unwrap();
    endpoint.recv().await.unwrap();

    bridge.dispose();

    assert_eq!(in_flight.wait().await.unwrap_err(), BridgeError::Disposed);
    assert_eq!(queued.wait().await.unwrap_err(), BridgeError::Disposed);
    assert_eq!(bridge.stats().pending, 0);
    assert_eq!(bridge.stats().queued, 0);
}

#[tokio::test]
async fn test_reinitialize_after_dispose_keeps_ids_increasing() {
    let Harness {
        bridge,
        mut endpoint,
        mut endpoints,
    } = ready(BridgeConfig::default()).await;

    let before = bridge
        .submit(&Task::summarize("before"), &ExecuteOptions::new())
        .await
        .unwrap();
    let before_id = before.id();
    endpoint.recv().await.unwrap();
    bridge.dispose();

    assert_eq!(
        bridge
            .execute(Task::summarize("rejected"), ExecuteOptions::new())
            .await
            .unwrap_err(),
        BridgeError::NotInitialized
    );

    let mut endpoint = handshake(&bridge, &mut endpoints).await;
    assert_eq!(bridge.state(), BridgeState::Ready);

    let after = bridge
        .submit(&Task::summarize("after"), &ExecuteOptions::new())
        .await
        .unwrap();
    assert!(after.id() > before_id);

    let message = endpoint.recv().await.unwrap();
    endpoint
        .responder()
        .respond(TaskResponse::ok(message.id, json!("fresh")));
    assert_eq!(after.wait().await.unwrap(), json!("fresh"));
}

#[tokio::test]
async fn test_concurrent_initialize_shares_one_handshake() {
    let (spawner, mut endpoints) = LoopbackSpawner::new();
    let bridge = TaskBridge::new(BridgeConfig::default(), Arc::new(spawner));

    let worker = async {
        let mut endpoint = endpoints.recv().await.unwrap();
        let message = endpoint.recv().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        endpoint
            .responder()
            .respond(TaskResponse::ok(message.id, Value::Null));
        endpoint
    };
    let (a, b, c, _endpoint) = tokio::join!(
        bridge.initialize(),
        bridge.initialize(),
        bridge.initialize(),
        worker
    );
    a.unwrap();
    b.unwrap();
    c.unwrap();

    // Only one worker was ever spawned
    assert!(endpoints.try_recv().is_err());
}

#[tokio::test]
async fn test_handshake_timeout_leaves_bridge_retryable() {
    let (spawner, mut endpoints) = LoopbackSpawner::new();
    let bridge = TaskBridge::new(
        BridgeConfig::default().with_init_timeout(Duration::from_millis(30)),
        Arc::new(spawner),
    );

    let err = bridge.initialize().await.unwrap_err();
    assert!(matches!(err, BridgeError::InitializationFailure(_)));
    assert_eq!(bridge.state(), BridgeState::Uninitialized);
    let _silent = endpoints.recv().await.unwrap();

    handshake(&bridge, &mut endpoints).await;
    assert_eq!(bridge.state(), BridgeState::Ready);
}

#[tokio::test]
async fn test_rejected_handshake_surfaces_worker_error() {
    let (spawner, mut endpoints) = LoopbackSpawner::new();
    let bridge = TaskBridge::new(BridgeConfig::default(), Arc::new(spawner));

    let worker = async {
        let mut endpoint = endpoints.recv().await.unwrap();
        let message = endpoint.recv().await.unwrap();
        endpoint
            .responder()
            .respond(TaskResponse::failed(message.id, "webgpu unavailable"));
    };
    let (result, ()) = tokio::join!(bridge.initialize(), worker);
    assert_eq!(
        result.unwrap_err(),
        BridgeError::InitializationFailure("webgpu unavailable".to_string())
    );
}

#[tokio::test]
async fn test_execute_initializes_on_first_use() {
    let (spawner, mut endpoints) = LoopbackSpawner::new();
    let bridge = TaskBridge::new(BridgeConfig::default(), Arc::new(spawner));

    let worker = async {
        let mut endpoint = endpoints.recv().await.unwrap();
        let responder = endpoint.responder();
        let init = endpoint.recv().await.unwrap();
        responder.respond(TaskResponse::ok(init.id, Value::Null));
        let task = endpoint.recv().await.unwrap();
        assert_eq!(task.kind(), MessageKind::Task("summarize"));
        responder.respond(TaskResponse::ok(task.id, json!("done")));
    };
    let (result, ()) = tokio::join!(
        bridge.execute(Task::summarize("lazy"), ExecuteOptions::new()),
        worker
    );
    assert_eq!(result.unwrap(), json!("done"));
}

#[tokio::test]
async fn test_retry_resubmits_with_fresh_id() {
    let Harness {
        bridge,
        mut endpoint,
        ..
    } = ready(BridgeConfig::default()).await;
    let responder = endpoint.responder();

    let options =
        ExecuteOptions::new().with_retry(RetryPolicy::fixed(3, Duration::from_millis(5)));
    let worker = async {
        let first = endpoint.recv().await.unwrap();
        responder.respond(TaskResponse::failed(first.id, "transient"));
        let second = endpoint.recv().await.unwrap();
        assert!(second.id > first.id);
        responder.respond(TaskResponse::ok(second.id, json!("recovered")));
    };
    let (result, ()) = tokio::join!(bridge.execute(Task::summarize("x"), options), worker);

    assert_eq!(result.unwrap(), json!("recovered"));
    let stats = bridge.stats();
    assert_eq!(stats.submitted, 2);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.completed, 1);
}

#[tokio::test]
async fn test_progress_after_settlement_is_dropped() {
    let Harness {
        bridge,
        mut endpoint,
        ..
    } = ready(BridgeConfig::default()).await;
    let responder = endpoint.responder();
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_sink = Arc::clone(&calls);

    let handle = bridge
        .submit(
            &Task::summarize("x"),
            &ExecuteOptions::new().with_progress(move |_| {
                calls_in_sink.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();
    let message = endpoint.recv().await.unwrap();
    responder.respond(TaskResponse::ok(message.id, Value::Null));
    handle.wait().await.unwrap();

    responder.progress(sidecar::bridge::ProgressEvent::new(message.id, 99.0, "late", ""));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

// =============================================================================
// FIFO-bounded concurrency under random response order
// =============================================================================

async fn run_fifo_round(max_concurrent: usize, count: usize, seed: u64) {
    let Harness {
        bridge,
        mut endpoint,
        ..
    } = ready(BridgeConfig::default().with_max_concurrent(max_concurrent)).await;
    let responder = endpoint.responder();

    let mut handles = Vec::new();
    for i in 0..count {
        handles.push(
            bridge
                .submit(&Task::summarize(format!("task {}", i)), &ExecuteOptions::new())
                .await
                .unwrap(),
        );
    }
    let submitted: Vec<RequestId> = handles.iter().map(|h| h.id()).collect();

    let mut rng = StdRng::seed_from_u64(seed);
    let mut transmitted = Vec::new();
    let mut outstanding: Vec<RequestId> = Vec::new();
    loop {
        while let Ok(Some(message)) = timeout(Duration::from_millis(10), endpoint.recv()).await {
            transmitted.push(message.id);
            outstanding.push(message.id);
            assert!(
                outstanding.len() <= max_concurrent,
                "{} in flight with max_concurrent = {}",
                outstanding.len(),
                max_concurrent
            );
        }
        if outstanding.is_empty() {
            break;
        }
        let id = outstanding.swap_remove(rng.random_range(0..outstanding.len()));
        responder.respond(TaskResponse::ok(id, json!(id.value())));
    }

    assert_eq!(transmitted, submitted);
    for handle in handles {
        let id = handle.id();
        assert_eq!(handle.wait().await.unwrap(), json!(id.value()));
    }
}

#[tokio::test]
async fn test_fifo_bounded_concurrency_fixed_seeds() {
    for seed in 0..4 {
        run_fifo_round(2, 8, seed).await;
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_fifo_bounded_concurrency(
        max_concurrent in 1usize..4,
        count in 1usize..10,
        seed in any::<u64>(),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(run_fifo_round(max_concurrent, count, seed));
    }
}
