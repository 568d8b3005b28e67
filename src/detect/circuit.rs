//! Safety circuit read model.
//!
//! Everything here is recomputed from the incident and agent sets; nothing is
//! counted incrementally, so a restart loses no fidelity.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::detect::{ActionStatus, Agent, AgentStatus, Incident, SafetyZone, Severity};

const TRAILING_WINDOW_HOURS: i64 = 24;
const RECENT_INCIDENTS: usize = 10;
const TOP_SOURCES: usize = 5;

fn in_trailing_window(incident: &Incident, now: DateTime<Utc>) -> bool {
    let cutoff = now - Duration::hours(TRAILING_WINDOW_HOURS);
    incident.created_at > cutoff && incident.created_at <= now
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SafetyCircuitStatus {
    pub green_actions_24h: usize,
    pub yellow_pending: usize,
    pub red_alerts_24h: usize,
    pub agents_active: usize,
    pub agents_total: usize,
    /// Most recent unresolved incident.
    pub last_incident: Option<Incident>,
}

impl SafetyCircuitStatus {
    pub fn compute(incidents: &[Incident], agents: &[Agent], now: DateTime<Utc>) -> Self {
        let mut green = 0;
        let mut yellow_pending = 0;
        let mut red = 0;
        for incident in incidents.iter().filter(|i| in_trailing_window(i, now)) {
            match incident.action_zone {
                SafetyZone::Green => green += 1,
                SafetyZone::Yellow if incident.action_status == ActionStatus::PendingApproval => {
                    yellow_pending += 1
                }
                SafetyZone::Yellow => {}
                SafetyZone::Red => red += 1,
            }
        }

        let last_incident = incidents
            .iter()
            .filter(|i| !i.resolved)
            .max_by_key(|i| i.created_at)
            .cloned();

        Self {
            green_actions_24h: green,
            yellow_pending,
            red_alerts_24h: red,
            agents_active: agents.iter().filter(|a| a.status == AgentStatus::Active).count(),
            agents_total: agents.len(),
            last_incident,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SourceIncidentCount {
    pub source_id: String,
    pub incident_count: usize,
}

/// Dashboard summary of the last 24 hours.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SentinelSummary {
    pub total_incidents_24h: usize,
    pub critical_incidents_24h: usize,
    pub active_agents: usize,
    pub safety_circuit: SafetyCircuitStatus,
    pub recent_incidents: Vec<Incident>,
    pub top_affected_sources: Vec<SourceIncidentCount>,
}

impl SentinelSummary {
    pub fn compute(incidents: &[Incident], agents: &[Agent], now: DateTime<Utc>) -> Self {
        let safety_circuit = SafetyCircuitStatus::compute(incidents, agents, now);
        let recent: Vec<&Incident> = incidents.iter().filter(|i| in_trailing_window(i, now)).collect();

        let mut per_source: HashMap<&str, usize> = HashMap::new();
        for incident in &recent {
            *per_source.entry(incident.source_id.as_str()).or_default() += 1;
        }
        let mut top: Vec<SourceIncidentCount> = per_source
            .into_iter()
            .map(|(source_id, incident_count)| SourceIncidentCount {
                source_id: source_id.to_string(),
                incident_count,
            })
            .collect();
        // Ties broken by source id so the ordering is stable.
        top.sort_by(|a, b| {
            b.incident_count
                .cmp(&a.incident_count)
                .then_with(|| a.source_id.cmp(&b.source_id))
        });
        top.truncate(TOP_SOURCES);

        let mut newest: Vec<Incident> = incidents.to_vec();
        newest.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        newest.truncate(RECENT_INCIDENTS);

        Self {
            total_incidents_24h: recent.len(),
            critical_incidents_24h: recent
                .iter()
                .filter(|i| i.severity == Severity::Critical)
                .count(),
            active_agents: safety_circuit.agents_active,
            safety_circuit,
            recent_incidents: newest,
            top_affected_sources: top,
        }
    }
}
