#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use worker_host::admission::AdmissionController;
use worker_host::registry::{
    Generation, LaunchCommand, LaunchParams, WorkerEvent, WorkerKind, WorkerRegistry,
};

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);
pub const QUIET_PERIOD: Duration = Duration::from_millis(300);

/// Run `script` with `sh -c`; launch flags land in `$@`.
pub fn sh(script: &str) -> LaunchCommand {
    LaunchCommand::new("sh").with_args(["-c", script, "worker"])
}

pub fn model_registry(script: &str, capacity: usize) -> Arc<WorkerRegistry> {
    WorkerRegistry::new(
        WorkerKind::Model,
        sh(script),
        AdmissionController::pool(capacity),
    )
}

pub fn param_finder_registry(script: &str) -> Arc<WorkerRegistry> {
    WorkerRegistry::new(
        WorkerKind::ParamFinder,
        sh(script),
        AdmissionController::exclusive(),
    )
}

pub fn model_params() -> LaunchParams {
    LaunchParams::Model {
        input: json!({ "series": [1, 2] }),
        aggregation: None,
        model: json!({ "name": "arima" }),
    }
}

pub fn param_finder_params() -> LaunchParams {
    LaunchParams::ParamFinder {
        input: json!({ "series": [1, 2] }),
    }
}

/// Subscribe to `id` and collect its events on a channel.
pub fn subscribe(registry: &WorkerRegistry, id: &str) -> mpsc::UnboundedReceiver<WorkerEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    registry.on(
        id,
        Arc::new(move |event: &WorkerEvent, _: Option<Generation>| {
            let _ = tx.send(event.clone());
        }),
    );
    rx
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> WorkerEvent {
    tokio::time::timeout(EVENT_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for worker event")
        .expect("event channel closed")
}

/// Collect events up to and including `close`.
pub async fn events_until_close(rx: &mut mpsc::UnboundedReceiver<WorkerEvent>) -> Vec<WorkerEvent> {
    let mut events = Vec::new();
    loop {
        let event = next_event(rx).await;
        let done = matches!(event, WorkerEvent::Close(_));
        events.push(event);
        if done {
            return events;
        }
    }
}

pub async fn assert_quiet<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>) {
    if let Ok(Some(event)) = tokio::time::timeout(QUIET_PERIOD, rx.recv()).await {
        panic!("unexpected event: {event:?}");
    }
}
