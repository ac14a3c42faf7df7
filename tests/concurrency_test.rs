#![cfg(feature = "testing")]

use hostbus::testing::{InMemoryEngine, InMemoryTransport};
use hostbus::{
    BoxError, EndpointConfiguration, FunctionContext, FunctionEndpoint, MapSource, StartState,
    WireMessage,
};
use serde::Deserialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Deserialize)]
struct Tick {
    n: usize,
}

fn tick(n: usize) -> WireMessage {
    WireMessage::new(format!(r#"{{"n":{}}}"#, n)).property("Bus.EnclosedMessageTypes", "Tick")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_invocations_start_engine_once() {
    let handled = Arc::new(AtomicUsize::new(0));
    let engine = {
        let handled = handled.clone();
        InMemoryEngine::new(InMemoryTransport::new()).handle(move |tick: Tick, _ctx| {
            let handled = handled.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(tick.n as u64 % 5)).await;
                handled.fetch_add(1, Ordering::SeqCst);
                Ok::<(), BoxError>(())
            }
        })
    };
    let configuration = EndpointConfiguration::builder()
        .source(MapSource::new())
        .endpoint_name("ticks")
        .build()
        .unwrap();
    let endpoint = Arc::new(
        FunctionEndpoint::builder()
            .configuration(configuration)
            .engine(engine.clone())
            .build()
            .unwrap(),
    );

    let mut tasks = tokio::task::JoinSet::new();
    for n in 0..64 {
        let endpoint = endpoint.clone();
        tasks.spawn(async move {
            let ctx = FunctionContext::new("Ticks");
            endpoint
                .process(&tick(n), &ctx, &CancellationToken::new())
                .await
        });
    }
    while let Some(result) = tasks.join_next().await {
        result.unwrap().unwrap();
    }

    assert_eq!(engine.starts(), 1);
    assert_eq!(handled.load(Ordering::SeqCst), 64);
    assert_eq!(endpoint.state(), StartState::Started);
}

#[tokio::test]
async fn test_cancelled_invocation_does_not_start_engine() {
    let engine = InMemoryEngine::new(InMemoryTransport::new());
    let configuration = EndpointConfiguration::builder()
        .source(MapSource::new())
        .endpoint_name("ticks")
        .build()
        .unwrap();
    let endpoint = FunctionEndpoint::builder()
        .configuration(configuration)
        .engine(engine.clone())
        .build()
        .unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = endpoint
        .process(&tick(1), &FunctionContext::new("Ticks"), &cancel)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert_eq!(engine.starts(), 0);
    assert_eq!(endpoint.state(), StartState::NotStarted);
}
