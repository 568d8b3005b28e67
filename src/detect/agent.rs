//! Registry of monitoring agents, one per source.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use crate::detect::{Agent, AgentStatus, AgentType, DetectError, EngineEvent, EventSender};

/// Agents keyed by source id.
pub struct AgentRegistry {
    agents: RwLock<HashMap<String, Agent>>,
    events: EventSender,
}

impl AgentRegistry {
    pub fn new(events: EventSender) -> Self {
        Self {
            agents: RwLock::new(HashMap::new()),
            events,
        }
    }

    fn publish(&self, agent: &Agent) {
        self.events.send(EngineEvent::AgentUpdated(agent.clone()));
    }

    /// Register the agent for a source. Registering a source that already has
    /// an agent returns the existing agent unchanged.
    pub async fn register(
        &self,
        source_id: &str,
        agent_type: AgentType,
        capabilities: Vec<String>,
        protocol: &str,
        now: DateTime<Utc>,
    ) -> Agent {
        let mut agents = self.agents.write().await;
        if let Some(existing) = agents.get(source_id) {
            debug!(source_id, agent_id = %existing.id, "agent already registered");
            return existing.clone();
        }
        let agent = Agent {
            id: Uuid::new_v4(),
            agent_type,
            source_id: source_id.to_string(),
            status: AgentStatus::Active,
            last_heartbeat: now,
            detections_24h: 0,
            capabilities,
            protocol: protocol.to_string(),
            registered_at: now,
        };
        info!(source_id, agent_id = %agent.id, agent_type = %agent_type, "agent registered");
        agents.insert(source_id.to_string(), agent.clone());
        drop(agents);
        self.publish(&agent);
        agent
    }

    /// Replace the registry contents with previously persisted agents.
    pub async fn restore(&self, restored: Vec<Agent>) {
        let mut agents = self.agents.write().await;
        agents.clear();
        for agent in restored {
            agents.insert(agent.source_id.clone(), agent);
        }
    }

    pub async fn get_by_source(&self, source_id: &str) -> Option<Agent> {
        self.agents.read().await.get(source_id).cloned()
    }

    pub async fn get(&self, agent_id: Uuid) -> Option<Agent> {
        self.agents
            .read()
            .await
            .values()
            .find(|a| a.id == agent_id)
            .cloned()
    }

    pub async fn list(&self) -> Vec<Agent> {
        let mut list: Vec<Agent> = self.agents.read().await.values().cloned().collect();
        list.sort_by(|a, b| a.source_id.cmp(&b.source_id));
        list
    }

    /// Record a heartbeat. A heartbeat revives an inactive agent.
    pub async fn heartbeat(&self, agent_id: Uuid, now: DateTime<Utc>) -> Result<Agent, DetectError> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .values_mut()
            .find(|a| a.id == agent_id)
            .ok_or_else(|| DetectError::not_found("agent", agent_id))?;
        agent.last_heartbeat = now;
        if agent.status == AgentStatus::Inactive {
            agent.status = AgentStatus::Active;
        }
        let agent = agent.clone();
        drop(agents);
        self.publish(&agent);
        Ok(agent)
    }

    pub async fn set_status(&self, agent_id: Uuid, status: AgentStatus) -> Result<Agent, DetectError> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .values_mut()
            .find(|a| a.id == agent_id)
            .ok_or_else(|| DetectError::not_found("agent", agent_id))?;
        agent.status = status;
        let agent = agent.clone();
        drop(agents);
        self.publish(&agent);
        Ok(agent)
    }

    /// Count one detection against the source's agent.
    pub async fn record_detection(&self, source_id: &str) -> Result<Agent, DetectError> {
        let mut agents = self.agents.write().await;
        let agent = agents
            .get_mut(source_id)
            .ok_or_else(|| DetectError::not_found("source", source_id))?;
        agent.detections_24h += 1;
        let agent = agent.clone();
        drop(agents);
        self.publish(&agent);
        Ok(agent)
    }

    /// Periodic tick: zero every agent's 24h detection counter.
    pub async fn reset_detection_counters(&self) {
        let mut agents = self.agents.write().await;
        for agent in agents.values_mut() {
            agent.detections_24h = 0;
        }
        let snapshot: Vec<Agent> = agents.values().cloned().collect();
        drop(agents);
        debug!(agents = snapshot.len(), "detection counters reset");
        for agent in &snapshot {
            self.publish(agent);
        }
    }

    /// Mark active agents whose last heartbeat is older than `timeout` as
    /// inactive. Returns the agents that changed.
    pub async fn mark_stale(&self, now: DateTime<Utc>, timeout: Duration) -> Vec<Agent> {
        let mut agents = self.agents.write().await;
        let mut changed = Vec::new();
        for agent in agents.values_mut() {
            if agent.status == AgentStatus::Active && now - agent.last_heartbeat > timeout {
                agent.status = AgentStatus::Inactive;
                info!(source_id = %agent.source_id, agent_id = %agent.id, "agent heartbeat stale");
                changed.push(agent.clone());
            }
        }
        drop(agents);
        for agent in &changed {
            self.publish(agent);
        }
        changed
    }
}
