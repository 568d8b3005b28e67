use std::sync::Arc;

use crate::config::Config;
use crate::detect::agent::AgentRegistry;
use crate::detect::engine::Pipeline;
use crate::detect::incident::IncidentManager;
use crate::detect::EventSender;
use crate::storage::Pool;

/// Shared handles for the API handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: Pool,
    pub agents: Arc<AgentRegistry>,
    pub incidents: Arc<IncidentManager>,
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    /// Wire the engine components together. All of them publish on `events`.
    pub fn new(config: Arc<Config>, pool: Pool, events: EventSender) -> Self {
        let agents = Arc::new(AgentRegistry::new(events.clone()));
        let incidents = Arc::new(IncidentManager::new(config.dedup, agents.clone(), events.clone()));
        let pipeline = Arc::new(Pipeline::new(config.clone(), incidents.clone(), events));
        Self {
            config,
            pool,
            agents,
            incidents,
            pipeline,
        }
    }
}
