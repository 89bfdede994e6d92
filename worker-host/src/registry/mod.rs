//! Worker registry: owns the id → worker map for one worker kind.
//!
//! `create`/`remove`/`send_input` never wait on worker I/O. Everything a
//! worker does afterwards (output records, stderr, exit) arrives later as a
//! [`WorkerEvent`] on the id's listeners.

mod framing;
mod launch;
mod process;

pub use framing::{LineFramer, RecordTooLarge, MAX_RECORD_LEN};
pub use launch::{LaunchCommand, LaunchParams, WorkerKind};

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionController, Occupancy};
use crate::error::WorkerError;

/// Unclassified failure observed on a running worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RawFailure {
    /// The OS refused to start the process.
    Spawn(String),
    /// One record written to the worker's stderr.
    Stderr(String),
    /// Non-zero exit code, or `None` when killed by a signal.
    Exit(Option<i32>),
    /// An output record longer than the framing limit was dropped.
    RecordTooLarge { limit: usize },
}

/// Event scoped to one worker id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerEvent {
    /// One complete stdout record.
    Data(String),
    Error(RawFailure),
    /// The process is gone; `Some(0)` is a normal stop.
    Close(Option<i32>),
}

/// Identifies one worker process among all that have used an id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Generation(u64);

/// Receives each event with the generation of the worker it came from,
/// or `None` when emitted for an id with no live worker.
pub type Listener = Arc<dyn Fn(&WorkerEvent, Option<Generation>) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct WorkerHandle {
    params: LaunchParams,
    generation: Generation,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    started: Instant,
    stdin: Option<mpsc::UnboundedSender<String>>,
    kill: Option<oneshot::Sender<()>>,
}

impl WorkerHandle {
    fn terminate(mut self) {
        if let Some(kill) = self.kill.take() {
            // Err means the supervisor already finished.
            let _ = kill.send(());
        }
    }
}

#[derive(Default)]
struct RegistryState {
    workers: HashMap<String, WorkerHandle>,
    listeners: HashMap<String, Vec<(ListenerId, Listener)>>,
    next_generation: u64,
    next_listener: u64,
}

impl RegistryState {
    fn occupancy(&self, id: &str) -> Occupancy {
        Occupancy {
            active: self.workers.len(),
            id_active: self.workers.contains_key(id),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSnapshot {
    pub id: String,
    pub pid: Option<u32>,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatus {
    pub kind: WorkerKind,
    pub capacity: Option<usize>,
    /// Free pool slots; `None` when admission is per id.
    pub available_slots: Option<usize>,
    pub workers: Vec<WorkerSnapshot>,
}

pub struct WorkerRegistry {
    kind: WorkerKind,
    launcher: LaunchCommand,
    admission: AdmissionController,
    state: Mutex<RegistryState>,
}

impl WorkerRegistry {
    pub fn new(
        kind: WorkerKind,
        launcher: LaunchCommand,
        admission: AdmissionController,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            launcher,
            admission,
            state: Mutex::new(RegistryState::default()),
        })
    }

    pub fn kind(&self) -> WorkerKind {
        self.kind
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        // Every critical section leaves the maps consistent, so a panic
        // elsewhere does not invalidate them.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start a worker for `id` and return its generation.
    ///
    /// A process that cannot be spawned does not fail this call: the failure
    /// is reported as `error(Spawn)` followed by `close(None)`.
    pub fn create(
        self: &Arc<Self>,
        id: &str,
        params: LaunchParams,
    ) -> Result<Generation, WorkerError> {
        if params.kind() != self.kind {
            return Err(WorkerError::InvalidRequest(format!(
                "{} params sent to the {} registry",
                params.kind(),
                self.kind
            )));
        }

        let mut state = self.lock();
        self.admission.admit(id, state.occupancy(id))?;

        let generation = Generation(state.next_generation);
        state.next_generation += 1;

        let mut handle = WorkerHandle {
            params,
            generation,
            pid: None,
            started_at: Utc::now(),
            started: Instant::now(),
            stdin: None,
            kill: None,
        };

        match process::spawn(&self.launcher, &handle.params, self.kind.accepts_input()) {
            Ok(mut spawned) => {
                let (kill_tx, kill_rx) = oneshot::channel();
                handle.pid = spawned.pid;
                handle.stdin = spawned.stdin.take();
                handle.kill = Some(kill_tx);
                info!(worker_id = id, kind = %self.kind, pid = ?spawned.pid, "worker spawned");
                tokio::spawn(process::supervise(
                    Arc::clone(self),
                    id.to_string(),
                    generation,
                    spawned,
                    kill_rx,
                ));
            }
            Err(e) => {
                error!(
                    worker_id = id,
                    kind = %self.kind,
                    program = %self.launcher.program,
                    "failed to spawn worker: {e}"
                );
                let registry = Arc::clone(self);
                let worker_id = id.to_string();
                let message = e.to_string();
                tokio::spawn(async move {
                    registry.emit_from(
                        &worker_id,
                        generation,
                        WorkerEvent::Error(RawFailure::Spawn(message)),
                    );
                    registry.finish(&worker_id, generation, None);
                });
            }
        }

        state.workers.insert(id.to_string(), handle);
        Ok(generation)
    }

    /// Kill the worker and forget it. The id is reusable as soon as this
    /// returns; anything the dying process still writes is dropped.
    /// Listeners stay registered until `off`/`off_all`.
    pub fn remove(&self, id: &str) -> Result<(), WorkerError> {
        let handle = self
            .lock()
            .workers
            .remove(id)
            .ok_or_else(|| WorkerError::NotFound(id.to_string()))?;
        info!(worker_id = id, kind = %self.kind, pid = ?handle.pid, "worker removed");
        handle.terminate();
        Ok(())
    }

    /// Write one JSON record to the worker's stdin.
    pub fn send_input(&self, id: &str, data: &serde_json::Value) -> Result<(), WorkerError> {
        if !self.kind.accepts_input() {
            return Err(WorkerError::InvalidRequest(format!(
                "{} workers do not accept input",
                self.kind
            )));
        }

        let state = self.lock();
        let handle = state
            .workers
            .get(id)
            .ok_or_else(|| WorkerError::NotFound(id.to_string()))?;
        let Some(stdin) = &handle.stdin else {
            debug!(worker_id = id, "worker has no stdin; input dropped");
            return Ok(());
        };
        if stdin.send(format!("{data}\n")).is_err() {
            debug!(worker_id = id, "worker stdin closed; input dropped");
        }
        Ok(())
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().workers.keys().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().workers.contains_key(id)
    }

    pub fn active_count(&self) -> usize {
        self.lock().workers.len()
    }

    /// Slots a `create` for `id` would find free.
    pub fn available_slots(&self, id: &str) -> usize {
        let state = self.lock();
        self.admission.available_slots(state.occupancy(id))
    }

    pub fn status(&self) -> RegistryStatus {
        let state = self.lock();
        let mut workers: Vec<WorkerSnapshot> = state
            .workers
            .iter()
            .map(|(id, handle)| WorkerSnapshot {
                id: id.clone(),
                pid: handle.pid,
                started_at: handle.started_at,
                uptime_secs: handle.started.elapsed().as_secs(),
            })
            .collect();
        workers.sort_by(|a, b| a.id.cmp(&b.id));

        RegistryStatus {
            kind: self.kind,
            capacity: self.admission.capacity(),
            available_slots: self
                .admission
                .capacity()
                .map(|capacity| capacity.saturating_sub(state.workers.len())),
            workers,
        }
    }

    /// Kill every worker and drop every listener.
    pub fn shutdown(&self) {
        let handles: Vec<(String, WorkerHandle)> = {
            let mut state = self.lock();
            state.listeners.clear();
            state.workers.drain().collect()
        };
        for (id, handle) in handles {
            info!(worker_id = %id, kind = %self.kind, "stopping worker for shutdown");
            handle.terminate();
        }
    }

    // ------------------------------------------------------------------
    // Dispatch table
    // ------------------------------------------------------------------

    pub fn on(&self, id: &str, listener: Listener) -> ListenerId {
        let mut state = self.lock();
        let listener_id = ListenerId(state.next_listener);
        state.next_listener += 1;
        state
            .listeners
            .entry(id.to_string())
            .or_default()
            .push((listener_id, listener));
        listener_id
    }

    pub fn off(&self, id: &str, listener_id: ListenerId) {
        let mut state = self.lock();
        if let Some(listeners) = state.listeners.get_mut(id) {
            listeners.retain(|(lid, _)| *lid != listener_id);
            if listeners.is_empty() {
                state.listeners.remove(id);
            }
        }
    }

    pub fn off_all(&self, id: &str) {
        self.lock().listeners.remove(id);
    }

    pub fn listener_count(&self, id: &str) -> usize {
        self.lock().listeners.get(id).map_or(0, Vec::len)
    }

    /// Deliver `event` to the listeners registered for `id`, in
    /// registration order, tagged with the live worker's generation.
    /// Listeners run outside the registry lock.
    pub fn emit(&self, id: &str, event: WorkerEvent) {
        let (listeners, generation) = {
            let state = self.lock();
            (
                state.listeners.get(id).cloned().unwrap_or_default(),
                state.workers.get(id).map(|h| h.generation),
            )
        };
        Self::dispatch(&listeners, &event, generation);
    }

    /// Emit on behalf of a process, but only while its handle is live.
    fn emit_from(&self, id: &str, generation: Generation, event: WorkerEvent) {
        let listeners = {
            let state = self.lock();
            match state.workers.get(id) {
                Some(handle) if handle.generation == generation => {
                    state.listeners.get(id).cloned().unwrap_or_default()
                }
                _ => {
                    debug!(worker_id = id, ?event, "dropping event from removed worker");
                    return;
                }
            }
        };
        Self::dispatch(&listeners, &event, Some(generation));
    }

    /// The process is gone: forget its handle, then report `close`.
    fn finish(&self, id: &str, generation: Generation, code: Option<i32>) {
        let listeners = {
            let mut state = self.lock();
            match state.workers.get(id) {
                Some(handle) if handle.generation == generation => {
                    state.workers.remove(id);
                    state.listeners.get(id).cloned().unwrap_or_default()
                }
                _ => return,
            }
        };
        match code {
            Some(0) => info!(worker_id = id, kind = %self.kind, "worker exited normally"),
            _ => warn!(worker_id = id, kind = %self.kind, ?code, "worker exited abnormally"),
        }
        Self::dispatch(&listeners, &WorkerEvent::Close(code), Some(generation));
    }

    fn dispatch(
        listeners: &[(ListenerId, Listener)],
        event: &WorkerEvent,
        generation: Option<Generation>,
    ) {
        for (_, listener) in listeners {
            listener(event, generation);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    fn recorder() -> (Listener, Arc<StdMutex<Vec<WorkerEvent>>>) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener: Listener = Arc::new(move |event: &WorkerEvent, _: Option<Generation>| {
            sink.lock().unwrap().push(event.clone());
        });
        (listener, seen)
    }

    fn registry() -> Arc<WorkerRegistry> {
        WorkerRegistry::new(
            WorkerKind::Model,
            LaunchCommand::new("unused"),
            AdmissionController::pool(2),
        )
    }

    #[test]
    fn test_emit_only_reaches_that_id() {
        let registry = registry();
        let (a, seen_a) = recorder();
        let (b, seen_b) = recorder();
        registry.on("a", a);
        registry.on("b", b);

        registry.emit("a", WorkerEvent::Data("1".into()));
        registry.emit("a", WorkerEvent::Close(Some(0)));

        assert_eq!(
            *seen_a.lock().unwrap(),
            vec![WorkerEvent::Data("1".into()), WorkerEvent::Close(Some(0))]
        );
        assert!(seen_b.lock().unwrap().is_empty());
    }

    #[test]
    fn test_off_and_off_all() {
        let registry = registry();
        let (first, seen_first) = recorder();
        let (second, seen_second) = recorder();
        let first_id = registry.on("a", first);
        registry.on("a", second);
        assert_eq!(registry.listener_count("a"), 2);

        registry.off("a", first_id);
        registry.emit("a", WorkerEvent::Data("x".into()));
        assert!(seen_first.lock().unwrap().is_empty());
        assert_eq!(seen_second.lock().unwrap().len(), 1);

        registry.off_all("a");
        assert_eq!(registry.listener_count("a"), 0);
        registry.emit("a", WorkerEvent::Data("y".into()));
        assert_eq!(seen_second.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_listener_may_unsubscribe_during_dispatch() {
        let registry = registry();
        let inner = Arc::clone(&registry);
        registry.on(
            "a",
            Arc::new(move |_: &WorkerEvent, _: Option<Generation>| {
                inner.off_all("a");
            }),
        );
        registry.emit("a", WorkerEvent::Close(None));
        assert_eq!(registry.listener_count("a"), 0);
    }

    #[test]
    fn test_remove_unknown_id() {
        let registry = registry();
        assert_eq!(
            registry.remove("ghost"),
            Err(WorkerError::NotFound("ghost".into()))
        );
    }

    #[test]
    fn test_send_input_unknown_id() {
        let registry = registry();
        assert_eq!(
            registry.send_input("ghost", &json!([1, 2])),
            Err(WorkerError::NotFound("ghost".into()))
        );
    }

    #[test]
    fn test_param_finder_rejects_input() {
        let registry = WorkerRegistry::new(
            WorkerKind::ParamFinder,
            LaunchCommand::new("unused"),
            AdmissionController::exclusive(),
        );
        assert!(matches!(
            registry.send_input("m1", &json!([])),
            Err(WorkerError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_create_rejects_params_of_other_kind() {
        let registry = registry();
        let params = LaunchParams::ParamFinder { input: json!({}) };
        assert!(matches!(
            registry.create("a", params),
            Err(WorkerError::InvalidRequest(_))
        ));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn test_status_of_empty_pool() {
        let status = registry().status();
        assert_eq!(status.capacity, Some(2));
        assert_eq!(status.available_slots, Some(2));
        assert!(status.workers.is_empty());
    }
}
