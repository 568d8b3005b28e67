//! Incident lifecycle: creation with duplicate suppression, operator
//! approval, resolution.
//!
//! ```text
//! created -> auto_executed ----------------------> resolved
//!         -> pending_approval -> approved/rejected -> resolved
//!         -> alert_only -------------------------> resolved
//! ```
//! (`pending_approval` may also be resolved directly.) Nothing leaves
//! `resolved`; only the operator notes of a resolved incident may change.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DedupConfig;
use crate::detect::agent::AgentRegistry;
use crate::detect::{
    ActionStatus, DetectError, Detection, EngineEvent, EventSender, Incident, SafetyZone, Severity,
};

/// Incidents are deduplicated per source and incident type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct DedupKey {
    source_id: String,
    incident_type: String,
}

impl DedupKey {
    fn of(incident: &Incident) -> Self {
        Self {
            source_id: incident.source_id.clone(),
            incident_type: incident.incident_type.clone(),
        }
    }
}

/// Most recent incident created under a key.
#[derive(Debug, Clone, Copy)]
struct LastCreated {
    id: Uuid,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DetectionOutcome {
    Created(Incident),
    /// Folded into an incident created within the dedup window.
    Suppressed { existing: Uuid },
}

impl DetectionOutcome {
    pub fn created(&self) -> Option<&Incident> {
        match self {
            DetectionOutcome::Created(incident) => Some(incident),
            DetectionOutcome::Suppressed { .. } => None,
        }
    }
}

/// Query parameters for listing incidents.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct IncidentFilter {
    pub severity: Option<Severity>,
    pub source_id: Option<String>,
    pub resolved: Option<bool>,
    pub limit: Option<usize>,
}

impl IncidentFilter {
    pub fn matches(&self, incident: &Incident) -> bool {
        self.severity.map_or(true, |s| incident.severity == s)
            && self
                .source_id
                .as_deref()
                .map_or(true, |s| incident.source_id == s)
            && self.resolved.map_or(true, |r| incident.resolved == r)
    }
}

pub struct IncidentManager {
    dedup: DedupConfig,
    agents: Arc<AgentRegistry>,
    incidents: RwLock<HashMap<Uuid, Arc<Mutex<Incident>>>>,
    /// Per-key creation locks; each holds the last incident created under
    /// the key so check-then-create is atomic.
    slots: Mutex<HashMap<DedupKey, Arc<Mutex<Option<LastCreated>>>>>,
    events: EventSender,
}

impl IncidentManager {
    pub fn new(dedup: DedupConfig, agents: Arc<AgentRegistry>, events: EventSender) -> Self {
        Self {
            dedup,
            agents,
            incidents: RwLock::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn agents(&self) -> &Arc<AgentRegistry> {
        &self.agents
    }

    fn publish(&self, event: EngineEvent) {
        self.events.send(event);
    }

    async fn slot(&self, key: DedupKey) -> Arc<Mutex<Option<LastCreated>>> {
        let mut slots = self.slots.lock().await;
        slots.entry(key).or_default().clone()
    }

    async fn entry(&self, id: Uuid) -> Result<Arc<Mutex<Incident>>, DetectError> {
        self.incidents
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| DetectError::not_found("incident", id))
    }

    /// Handle one detection.
    ///
    /// The source's agent counter always increments. An incident is created
    /// unless one was already created for the same source and incident type
    /// within the dedup window, resolved or not.
    pub async fn record_detection(&self, detection: Detection) -> Result<DetectionOutcome, DetectError> {
        let agent = self.agents.record_detection(&detection.source_id).await?;

        let key = DedupKey {
            source_id: detection.source_id.clone(),
            incident_type: detection.incident_type.clone(),
        };
        let slot = self.slot(key).await;
        let mut last = slot.lock().await;

        if let Some(prev) = *last {
            let window = self.dedup.window();
            let gap = detection.detected_at - prev.created_at;
            if gap < window && gap > -window {
                debug!(
                    source_id = %detection.source_id,
                    incident_type = %detection.incident_type,
                    existing = %prev.id,
                    gap_secs = gap.num_seconds(),
                    "detection suppressed within dedup window"
                );
                return Ok(DetectionOutcome::Suppressed { existing: prev.id });
            }
        }

        let incident = Incident::from_detection(&detection, Some(agent.agent_type));
        self.incidents
            .write()
            .await
            .insert(incident.id, Arc::new(Mutex::new(incident.clone())));
        *last = Some(LastCreated {
            id: incident.id,
            created_at: incident.created_at,
        });
        drop(last);

        info!(
            incident_id = %incident.id,
            source_id = %incident.source_id,
            incident_type = %incident.incident_type,
            severity = %incident.severity,
            zone = %incident.action_zone,
            status = %incident.action_status,
            "incident created"
        );
        self.publish(EngineEvent::IncidentCreated(incident.clone()));
        Ok(DetectionOutcome::Created(incident))
    }

    /// Approve or reject a yellow-zone action awaiting an operator.
    pub async fn approve_incident(
        &self,
        id: Uuid,
        approved: bool,
        notes: Option<String>,
    ) -> Result<Incident, DetectError> {
        let entry = self.entry(id).await?;
        let mut incident = entry.lock().await;

        if incident.resolved
            || incident.action_zone != SafetyZone::Yellow
            || incident.action_status != ActionStatus::PendingApproval
        {
            return Err(DetectError::InvalidTransition {
                id,
                action: if approved { "approve" } else { "reject" },
                zone: incident.action_zone,
                status: incident.action_status,
                resolved: incident.resolved,
            });
        }

        incident.action_status = if approved {
            ActionStatus::Approved
        } else {
            ActionStatus::Rejected
        };
        if notes.is_some() {
            incident.operator_notes = notes;
        }
        let snapshot = incident.clone();
        drop(incident);

        info!(incident_id = %id, status = %snapshot.action_status, "operator decision recorded");
        self.publish(EngineEvent::IncidentUpdated(snapshot.clone()));
        Ok(snapshot)
    }

    /// Resolve an incident. Resolving an already-resolved incident is a no-op
    /// that returns it unchanged.
    pub async fn resolve_incident(
        &self,
        id: Uuid,
        notes: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Incident, DetectError> {
        let entry = self.entry(id).await?;
        let mut incident = entry.lock().await;

        if incident.resolved {
            debug!(incident_id = %id, "incident already resolved");
            return Ok(incident.clone());
        }

        incident.resolved = true;
        incident.resolved_at = Some(now);
        if notes.is_some() {
            incident.operator_notes = notes;
        }
        let snapshot = incident.clone();
        drop(incident);

        info!(incident_id = %id, status = %snapshot.action_status, "incident resolved");
        self.publish(EngineEvent::IncidentUpdated(snapshot.clone()));
        Ok(snapshot)
    }

    /// Replace the operator notes. Allowed in every state.
    pub async fn annotate_incident(&self, id: Uuid, notes: String) -> Result<Incident, DetectError> {
        let entry = self.entry(id).await?;
        let mut incident = entry.lock().await;
        incident.operator_notes = Some(notes);
        let snapshot = incident.clone();
        drop(incident);

        self.publish(EngineEvent::IncidentUpdated(snapshot.clone()));
        Ok(snapshot)
    }

    pub async fn get(&self, id: Uuid) -> Result<Incident, DetectError> {
        let entry = self.entry(id).await?;
        let incident = entry.lock().await.clone();
        Ok(incident)
    }

    /// Every incident, newest first.
    pub async fn snapshot(&self) -> Vec<Incident> {
        let entries: Vec<Arc<Mutex<Incident>>> =
            self.incidents.read().await.values().cloned().collect();
        let mut incidents = Vec::with_capacity(entries.len());
        for entry in entries {
            incidents.push(entry.lock().await.clone());
        }
        incidents.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        incidents
    }

    pub async fn list(&self, filter: &IncidentFilter) -> Vec<Incident> {
        let mut incidents: Vec<Incident> = self
            .snapshot()
            .await
            .into_iter()
            .filter(|i| filter.matches(i))
            .collect();
        if let Some(limit) = filter.limit {
            incidents.truncate(limit);
        }
        incidents
    }

    /// Drop resolved incidents created before `horizon` from memory, along
    /// with dedup slots whose last incident is older than it. Unresolved
    /// incidents are kept whatever their age. Returns how many were evicted.
    pub async fn evict_resolved_before(&self, horizon: DateTime<Utc>) -> usize {
        let mut incidents = self.incidents.write().await;
        let mut expired = Vec::new();
        for (id, entry) in incidents.iter() {
            let incident = entry.lock().await;
            if incident.resolved && incident.created_at < horizon {
                expired.push(*id);
            }
        }
        for id in &expired {
            incidents.remove(id);
        }
        drop(incidents);

        let mut slots = self.slots.lock().await;
        let mut stale = Vec::new();
        for (key, slot) in slots.iter() {
            // A busy slot is mid-creation and therefore fresh.
            if let Ok(last) = slot.try_lock() {
                if last.map_or(true, |l| l.created_at < horizon) {
                    stale.push(key.clone());
                }
            }
        }
        for key in &stale {
            slots.remove(key);
        }
        drop(slots);

        if !expired.is_empty() {
            debug!(evicted = expired.len(), slots = stale.len(), "expired incidents evicted");
        }
        expired.len()
    }

    /// Replace the in-memory state with persisted incidents and re-seed the
    /// dedup slots from them.
    pub async fn restore(&self, restored: Vec<Incident>) {
        let mut latest: HashMap<DedupKey, LastCreated> = HashMap::new();
        for incident in &restored {
            let candidate = LastCreated {
                id: incident.id,
                created_at: incident.created_at,
            };
            latest
                .entry(DedupKey::of(incident))
                .and_modify(|cur| {
                    if candidate.created_at > cur.created_at {
                        *cur = candidate;
                    }
                })
                .or_insert(candidate);
        }

        let mut slots = self.slots.lock().await;
        slots.clear();
        for (key, last) in latest {
            slots.insert(key, Arc::new(Mutex::new(Some(last))));
        }
        drop(slots);

        let mut incidents = self.incidents.write().await;
        incidents.clear();
        for incident in restored {
            incidents.insert(incident.id, Arc::new(Mutex::new(incident)));
        }
        info!(incidents = incidents.len(), "incident state restored");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::escalation::{ActionSet, EscalationDecision, EscalationPolicy};
    use crate::detect::AgentType;
    use chrono::Duration;
    use crate::detect::event_channel;

    async fn manager() -> IncidentManager {
        let (tx, _rx) = event_channel(256);
        let agents = Arc::new(AgentRegistry::new(tx.clone()));
        agents
            .register("cnc-01", AgentType::Precision, vec![], "mqtt", Utc::now())
            .await;
        IncidentManager::new(DedupConfig::default(), agents, tx)
    }

    fn decision(zone: SafetyZone) -> EscalationDecision {
        let policy = EscalationPolicy::default();
        let actions = ActionSet::defaults_for("temperature");
        let ratio = match zone {
            SafetyZone::Green => 0.9,
            SafetyZone::Yellow => 0.97,
            SafetyZone::Red => 1.2,
        };
        policy.decide_ceiling(ratio * 100.0, 100.0, &actions).unwrap()
    }

    fn detection(zone: SafetyZone, at: DateTime<Utc>) -> Detection {
        Detection {
            source_id: "cnc-01".to_string(),
            incident_type: "temperature_threshold".to_string(),
            message: "temperature near ceiling".to_string(),
            detected_value: 97.0,
            threshold_value: 100.0,
            decision: decision(zone),
            z_score: Some(2.1),
            rate_of_change: None,
            detected_at: at,
        }
    }

    #[tokio::test]
    async fn test_dedup_window() {
        let m = manager().await;
        let t0 = Utc::now();

        let first = m.record_detection(detection(SafetyZone::Green, t0)).await.unwrap();
        let first = first.created().cloned().unwrap();
        let second = m
            .record_detection(detection(SafetyZone::Green, t0 + Duration::seconds(10)))
            .await
            .unwrap();
        assert_eq!(second, DetectionOutcome::Suppressed { existing: first.id });
        assert_eq!(m.snapshot().await.len(), 1);

        let third = m
            .record_detection(detection(SafetyZone::Green, t0 + Duration::seconds(400)))
            .await
            .unwrap();
        assert!(third.created().is_some());
        assert_eq!(m.snapshot().await.len(), 2);

        // Suppressed detections still count against the agent.
        let agent = m.agents().get_by_source("cnc-01").await.unwrap();
        assert_eq!(agent.detections_24h, 3);
    }

    #[tokio::test]
    async fn test_dedup_is_per_incident_type() {
        let m = manager().await;
        let t0 = Utc::now();
        m.record_detection(detection(SafetyZone::Green, t0)).await.unwrap();
        let mut other = detection(SafetyZone::Yellow, t0);
        other.incident_type = "temperature_spc_rule_1".to_string();
        assert!(m.record_detection(other).await.unwrap().created().is_some());
    }

    #[tokio::test]
    async fn test_resolved_incident_still_suppresses_within_window() {
        let m = manager().await;
        let t0 = Utc::now();
        let created = m.record_detection(detection(SafetyZone::Red, t0)).await.unwrap();
        let id = created.created().unwrap().id;
        m.resolve_incident(id, None, t0).await.unwrap();
        let again = m
            .record_detection(detection(SafetyZone::Red, t0 + Duration::seconds(60)))
            .await
            .unwrap();
        assert_eq!(again, DetectionOutcome::Suppressed { existing: id });
    }

    #[tokio::test]
    async fn test_unknown_source_creates_nothing() {
        let m = manager().await;
        let mut d = detection(SafetyZone::Green, Utc::now());
        d.source_id = "ghost".to_string();
        let err = m.record_detection(d).await.unwrap_err();
        assert!(matches!(err, DetectError::NotFound { .. }));
        assert!(m.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_duplicates_create_one_incident() {
        let m = Arc::new(manager().await);
        let at = Utc::now();
        let mut handles = Vec::new();
        for _ in 0..16 {
            let m = m.clone();
            handles.push(tokio::spawn(async move {
                m.record_detection(detection(SafetyZone::Yellow, at)).await
            }));
        }
        let mut created = 0;
        for h in handles {
            if h.await.unwrap().unwrap().created().is_some() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(m.snapshot().await.len(), 1);
        assert_eq!(
            m.agents().get_by_source("cnc-01").await.unwrap().detections_24h,
            16
        );
    }

    #[tokio::test]
    async fn test_approve_and_reject_pending() {
        let m = manager().await;
        let t0 = Utc::now();
        let pending = m.record_detection(detection(SafetyZone::Yellow, t0)).await.unwrap();
        let id = pending.created().unwrap().id;
        assert_eq!(pending.created().unwrap().action_status, ActionStatus::PendingApproval);

        let approved = m
            .approve_incident(id, true, Some("coolant topped up".into()))
            .await
            .unwrap();
        assert_eq!(approved.action_status, ActionStatus::Approved);
        assert_eq!(approved.operator_notes.as_deref(), Some("coolant topped up"));

        // A second decision is not a valid transition.
        let err = m.approve_incident(id, false, None).await.unwrap_err();
        assert!(matches!(err, DetectError::InvalidTransition { action: "reject", .. }));

        let mut other = detection(SafetyZone::Yellow, t0);
        other.incident_type = "vibration_threshold".to_string();
        let id2 = m.record_detection(other).await.unwrap().created().unwrap().id;
        let rejected = m.approve_incident(id2, false, None).await.unwrap();
        assert_eq!(rejected.action_status, ActionStatus::Rejected);
        assert!(m.resolve_incident(id2, None, t0).await.unwrap().resolved);
    }

    #[tokio::test]
    async fn test_approve_green_is_invalid() {
        let m = manager().await;
        let created = m.record_detection(detection(SafetyZone::Green, Utc::now())).await.unwrap();
        let id = created.created().unwrap().id;
        let err = m.approve_incident(id, true, None).await.unwrap_err();
        assert_eq!(
            err,
            DetectError::InvalidTransition {
                id,
                action: "approve",
                zone: SafetyZone::Green,
                status: ActionStatus::AutoExecuted,
                resolved: false,
            }
        );
        assert_eq!(m.get(id).await.unwrap().action_status, ActionStatus::AutoExecuted);
    }

    #[tokio::test]
    async fn test_approve_after_resolve_is_invalid() {
        let m = manager().await;
        let t0 = Utc::now();
        let id = m
            .record_detection(detection(SafetyZone::Yellow, t0))
            .await
            .unwrap()
            .created()
            .unwrap()
            .id;
        m.resolve_incident(id, None, t0).await.unwrap();
        assert!(matches!(
            m.approve_incident(id, true, None).await,
            Err(DetectError::InvalidTransition { resolved: true, .. })
        ));
    }

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let m = manager().await;
        let t0 = Utc::now();
        let id = m
            .record_detection(detection(SafetyZone::Red, t0))
            .await
            .unwrap()
            .created()
            .unwrap()
            .id;
        let first = m.resolve_incident(id, Some("reset breaker".into()), t0).await.unwrap();
        let second = m
            .resolve_incident(id, Some("ignored".into()), t0 + Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(first.resolved_at, Some(t0));
        assert_eq!(second, first);

        let annotated = m.annotate_incident(id, "root cause: fan".into()).await.unwrap();
        assert_eq!(annotated.resolved_at, Some(t0));
        assert_eq!(annotated.operator_notes.as_deref(), Some("root cause: fan"));
    }

    #[tokio::test]
    async fn test_missing_incident() {
        let m = manager().await;
        let id = Uuid::new_v4();
        assert!(matches!(
            m.resolve_incident(id, None, Utc::now()).await,
            Err(DetectError::NotFound { kind: "incident", .. })
        ));
        assert!(m.approve_incident(id, true, None).await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_approve_and_resolve() {
        let m = Arc::new(manager().await);
        let t0 = Utc::now();
        let id = m
            .record_detection(detection(SafetyZone::Yellow, t0))
            .await
            .unwrap()
            .created()
            .unwrap()
            .id;

        let a = {
            let m = m.clone();
            tokio::spawn(async move { m.approve_incident(id, true, None).await })
        };
        let r = {
            let m = m.clone();
            tokio::spawn(async move { m.resolve_incident(id, None, t0).await })
        };
        let approve = a.await.unwrap();
        r.await.unwrap().unwrap();

        let end = m.get(id).await.unwrap();
        assert!(end.resolved);
        match approve {
            Ok(_) => assert_eq!(end.action_status, ActionStatus::Approved),
            Err(_) => assert_eq!(end.action_status, ActionStatus::PendingApproval),
        }
    }

    #[tokio::test]
    async fn test_eviction_keeps_open_and_recent() {
        let m = manager().await;
        let now = Utc::now();
        let day_ago = now - Duration::hours(30);

        let old_resolved = m.record_detection(detection(SafetyZone::Red, day_ago)).await.unwrap();
        let old_resolved = old_resolved.created().unwrap().id;
        m.resolve_incident(old_resolved, None, day_ago).await.unwrap();

        let mut open = detection(SafetyZone::Yellow, day_ago);
        open.incident_type = "vibration_threshold_yellow".to_string();
        let old_open = m.record_detection(open).await.unwrap().created().unwrap().id;

        let mut recent = detection(SafetyZone::Green, now);
        recent.incident_type = "humidity_threshold_green".to_string();
        let recent = m.record_detection(recent).await.unwrap().created().unwrap().id;
        m.resolve_incident(recent, None, now).await.unwrap();

        assert_eq!(m.evict_resolved_before(now - Duration::hours(24)).await, 1);
        assert!(m.get(old_resolved).await.is_err());
        assert!(m.get(old_open).await.is_ok());
        assert!(m.get(recent).await.is_ok());
        assert_eq!(m.snapshot().await.len(), 2);

        // The evicted key no longer suppresses anything.
        let again = m.record_detection(detection(SafetyZone::Red, now)).await.unwrap();
        assert!(again.created().is_some());
    }

    #[tokio::test]
    async fn test_list_filters_and_restore() {
        let m = manager().await;
        let t0 = Utc::now();
        m.record_detection(detection(SafetyZone::Red, t0)).await.unwrap();
        let mut vib = detection(SafetyZone::Green, t0 + Duration::seconds(1));
        vib.incident_type = "vibration_threshold".to_string();
        m.record_detection(vib).await.unwrap();

        let critical = m
            .list(&IncidentFilter {
                severity: Some(Severity::Critical),
                ..Default::default()
            })
            .await;
        assert_eq!(critical.len(), 1);
        let newest = m
            .list(&IncidentFilter {
                limit: Some(1),
                ..Default::default()
            })
            .await;
        assert_eq!(newest[0].incident_type, "vibration_threshold");

        // Restored state keeps suppressing inside the window.
        let saved = m.snapshot().await;
        let restored = manager().await;
        restored.restore(saved).await;
        let again = restored
            .record_detection(detection(SafetyZone::Red, t0 + Duration::seconds(30)))
            .await
            .unwrap();
        assert!(matches!(again, DetectionOutcome::Suppressed { .. }));
    }
}
