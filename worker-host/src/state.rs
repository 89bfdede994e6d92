use std::sync::Arc;

use shared_types::{MODEL_CHANNEL, PARAM_FINDER_CHANNEL};

use crate::admission::AdmissionController;
use crate::config::Config;
use crate::ipc::{IpcChannel, IpcSender};
use crate::registry::{WorkerKind, WorkerRegistry};
use crate::router::EventRouter;

/// One worker kind as seen by the transport: its router and the sending
/// half of the router's command channel.
#[derive(Clone)]
pub struct WorkerHub {
    pub router: Arc<EventRouter>,
    pub sender: IpcSender,
}

impl WorkerHub {
    pub fn new(registry: Arc<WorkerRegistry>, channel_name: &'static str) -> Self {
        let (channel, sender) = IpcChannel::new(channel_name);
        Self {
            router: EventRouter::new(registry, channel),
            sender,
        }
    }

    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        self.router.registry()
    }
}

pub struct AppState {
    pub models: WorkerHub,
    pub param_finders: WorkerHub,
}

impl AppState {
    pub fn from_config(config: &Config) -> Arc<Self> {
        let models = WorkerRegistry::new(
            WorkerKind::Model,
            config.model_runner.clone(),
            AdmissionController::for_host(config.max_concurrent_models),
        );
        let param_finders = WorkerRegistry::new(
            WorkerKind::ParamFinder,
            config.param_finder.clone(),
            AdmissionController::exclusive(),
        );
        Self::new(models, param_finders)
    }

    pub fn new(models: Arc<WorkerRegistry>, param_finders: Arc<WorkerRegistry>) -> Arc<Self> {
        Arc::new(Self {
            models: WorkerHub::new(models, MODEL_CHANNEL),
            param_finders: WorkerHub::new(param_finders, PARAM_FINDER_CHANNEL),
        })
    }

    /// Look up a hub by its channel name.
    pub fn hub(&self, channel: &str) -> Option<&WorkerHub> {
        match channel {
            MODEL_CHANNEL => Some(&self.models),
            PARAM_FINDER_CHANNEL => Some(&self.param_finders),
            _ => None,
        }
    }

    /// Stop both routers and kill every worker.
    pub fn shutdown(&self) {
        for hub in [&self.models, &self.param_finders] {
            hub.router.shutdown();
            hub.registry().shutdown();
        }
    }
}
