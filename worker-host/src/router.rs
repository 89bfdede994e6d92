//! EventRouter - bridge between a UI endpoint and one [`WorkerRegistry`].
//!
//! Inbound commands become registry calls. Registry events for attached ids
//! are relayed to the endpoint, with errors classified on the way out.
//! An id is either fully attached or fully detached:
//!
//! ```text
//! UNATTACHED --create ok--> ATTACHED --remove / forwarded close--> UNATTACHED
//! ```

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use shared_types::{Command, ErrorPayload, InboundMessage, ListResponse, OutboundMessage};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify;
use crate::error::WorkerError;
use crate::ipc::IpcChannel;
use crate::registry::{Generation, LaunchParams, ListenerId, WorkerEvent, WorkerRegistry};

/// Destination for outbound events, e.g. a UI connection.
pub trait Endpoint: Send + Sync {
    fn send(&self, message: OutboundMessage);
}

impl Endpoint for mpsc::UnboundedSender<OutboundMessage> {
    fn send(&self, message: OutboundMessage) {
        if mpsc::UnboundedSender::send(self, message).is_err() {
            debug!("endpoint closed; outbound message dropped");
        }
    }
}

/// Identifies one `start` call, so a transport only stops its own session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(u64);

struct Attachment {
    /// The relay registered with the registry for this id.
    listener: ListenerId,
    /// Worker whose events are forwarded. `None` accepts any worker.
    generation: Option<Generation>,
}

#[derive(Default)]
struct RouterState {
    endpoint: Option<(EndpointId, Arc<dyn Endpoint>)>,
    next_endpoint: u64,
    attached: HashMap<String, Attachment>,
    listening: Option<CancellationToken>,
}

impl RouterState {
    fn forward(&self, message: OutboundMessage) {
        match &self.endpoint {
            Some((_, endpoint)) => endpoint.send(message),
            None => debug!(worker_id = %message.id, "no endpoint; outbound message dropped"),
        }
    }
}

pub struct EventRouter {
    registry: Arc<WorkerRegistry>,
    channel: Arc<IpcChannel>,
    state: Mutex<RouterState>,
}

impl EventRouter {
    pub fn new(registry: Arc<WorkerRegistry>, channel: IpcChannel) -> Arc<Self> {
        Arc::new(Self {
            registry,
            channel: Arc::new(channel),
            state: Mutex::new(RouterState::default()),
        })
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    pub fn channel_name(&self) -> &'static str {
        self.channel.name()
    }

    fn lock(&self) -> MutexGuard<'_, RouterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Begin draining the command channel and forwarding to `endpoint`.
    /// Calling again while listening only swaps the endpoint.
    pub fn start(self: &Arc<Self>, endpoint: Arc<dyn Endpoint>) -> EndpointId {
        let mut state = self.lock();
        let endpoint_id = EndpointId(state.next_endpoint);
        state.next_endpoint += 1;
        state.endpoint = Some((endpoint_id, endpoint));

        if state.listening.is_none() {
            let token = CancellationToken::new();
            state.listening = Some(token.clone());
            tokio::spawn(Arc::clone(self).listen(token));
            info!(channel = self.channel.name(), "router listening");
        }
        endpoint_id
    }

    /// Stop listening and forget the endpoint.
    pub fn stop(&self) {
        let mut state = self.lock();
        state.endpoint = None;
        if let Some(token) = state.listening.take() {
            token.cancel();
            info!(channel = self.channel.name(), "router stopped");
        }
    }

    /// `stop`, then unregister every relay so the registry can be reused.
    pub fn shutdown(&self) {
        self.stop();
        let attached: Vec<(String, Attachment)> = self.lock().attached.drain().collect();
        for (id, attachment) in attached {
            self.registry.off(&id, attachment.listener);
        }
    }

    /// `stop`, unless another endpoint has been started since `endpoint_id`.
    pub fn stop_endpoint(&self, endpoint_id: EndpointId) {
        let current = self.lock().endpoint.as_ref().map(|(id, _)| *id);
        if current == Some(endpoint_id) {
            self.stop();
        }
    }

    pub fn is_listening(&self) -> bool {
        self.lock().listening.is_some()
    }

    async fn listen(self: Arc<Self>, token: CancellationToken) {
        let channel = Arc::clone(&self.channel);
        let mut inbox = channel.inbox.lock().await;
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                request = inbox.recv() => {
                    let Some(request) = request else { break };
                    let reply = self.handle_command(&request.message);
                    if let Some(reply_tx) = request.reply {
                        let _ = reply_tx.send(reply);
                    }
                }
            }
        }
        debug!(channel = channel.name(), "router listener exited");
    }

    /// Apply one UI command. Registry failures are forwarded as `error`
    /// events for the command's id and never escape this call.
    pub fn handle_command(self: &Arc<Self>, message: &InboundMessage) -> Option<ListResponse> {
        match self.dispatch(message) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(
                    channel = self.channel.name(),
                    worker_id = %message.id,
                    command = %message.command,
                    "command failed: {e}"
                );
                let payload = ErrorPayload {
                    error: classify::from_worker_error(&e),
                    originating_command: Some(message.clone()),
                };
                self.lock()
                    .forward(OutboundMessage::error(message.id.clone(), &payload));
                None
            }
        }
    }

    fn dispatch(
        self: &Arc<Self>,
        message: &InboundMessage,
    ) -> Result<Option<ListResponse>, WorkerError> {
        let id = message.id.as_str();
        match message.command {
            Command::Create => {
                require_id(id)?;
                let params = LaunchParams::from_create_params(self.registry.kind(), &message.params)?;
                // The router lock is held across `create`, so the new
                // worker's events wait until its generation is recorded.
                let mut state = self.lock();
                let newly_attached = self.attach_locked(&mut state, id);
                match self.registry.create(id, params) {
                    Ok(generation) => {
                        if let Some(attachment) = state.attached.get_mut(id) {
                            attachment.generation = Some(generation);
                        }
                        Ok(None)
                    }
                    Err(e) => {
                        let undo = if newly_attached {
                            state.attached.remove(id)
                        } else {
                            None
                        };
                        drop(state);
                        if let Some(attachment) = undo {
                            self.registry.off(id, attachment.listener);
                        }
                        Err(e)
                    }
                }
            }
            Command::Remove => {
                require_id(id)?;
                self.detach(id);
                self.registry.remove(id)?;
                Ok(None)
            }
            Command::List => {
                let mut ids = self.registry.ids();
                ids.sort();
                Ok(Some(ListResponse { ids }))
            }
            Command::SendInput => {
                require_id(id)?;
                self.registry.send_input(id, &message.params)?;
                Ok(None)
            }
        }
    }

    /// Start relaying `id`'s events. Returns false if already attached.
    pub fn attach(self: &Arc<Self>, id: &str) -> bool {
        let mut state = self.lock();
        self.attach_locked(&mut state, id)
    }

    fn attach_locked(self: &Arc<Self>, state: &mut RouterState, id: &str) -> bool {
        if state.attached.contains_key(id) {
            return false;
        }
        let router: Weak<Self> = Arc::downgrade(self);
        let relay_id = id.to_string();
        let listener = self.registry.on(
            id,
            Arc::new(
                move |event: &WorkerEvent, generation: Option<Generation>| {
                    if let Some(router) = router.upgrade() {
                        router.relay(&relay_id, event, generation);
                    }
                },
            ),
        );
        state.attached.insert(
            id.to_string(),
            Attachment {
                listener,
                generation: None,
            },
        );
        debug!(channel = self.channel.name(), worker_id = id, "attached");
        true
    }

    /// Stop relaying `id`'s events. Once this returns nothing more is
    /// forwarded for `id`, whatever the registry emits.
    pub fn detach(&self, id: &str) {
        let attachment = self.lock().attached.remove(id);
        if let Some(attachment) = attachment {
            self.registry.off(id, attachment.listener);
            debug!(channel = self.channel.name(), worker_id = id, "detached");
        }
    }

    pub fn is_attached(&self, id: &str) -> bool {
        self.lock().attached.contains_key(id)
    }

    /// Registered as the registry listener for every attached id.
    fn relay(&self, id: &str, event: &WorkerEvent, generation: Option<Generation>) {
        let mut state = self.lock();
        // The attachment check and the send happen under one lock so a
        // concurrent `detach` cannot interleave.
        let Some(attachment) = state.attached.get(id) else {
            return;
        };
        if let (Some(current), Some(from)) = (attachment.generation, generation) {
            if current != from {
                debug!(
                    channel = self.channel.name(),
                    worker_id = id,
                    ?event,
                    "dropping event from superseded worker"
                );
                return;
            }
        }
        match event {
            WorkerEvent::Data(record) => state.forward(OutboundMessage::data(id, record.clone())),
            WorkerEvent::Error(failure) => {
                let payload = ErrorPayload {
                    error: classify::classify(failure),
                    originating_command: None,
                };
                state.forward(OutboundMessage::error(id, &payload));
            }
            WorkerEvent::Close(code) => {
                state.forward(OutboundMessage::close(id, *code));
                let attachment = state.attached.remove(id);
                drop(state);
                if let Some(attachment) = attachment {
                    self.registry.off(id, attachment.listener);
                }
            }
        }
    }
}

fn require_id(id: &str) -> Result<(), WorkerError> {
    if id.is_empty() {
        return Err(WorkerError::InvalidRequest("worker id must not be empty".into()));
    }
    Ok(())
}
