//! Escalation, incident lifecycle and safety circuit roll-up.

pub mod agent;
pub mod circuit;
pub mod engine;
pub mod escalation;
pub mod incident;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use self::engine::Measurement;
use self::escalation::EscalationDecision;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum DetectError {
    #[error("cannot {action} incident {id}: zone {zone}, status {status}, resolved {resolved}")]
    InvalidTransition {
        id: Uuid,
        action: &'static str,
        zone: SafetyZone,
        status: ActionStatus,
        resolved: bool,
    },
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },
    #[error("unknown {kind}: {value:?}")]
    UnknownVariant { kind: &'static str, value: String },
    #[error("invalid measurement: {0}")]
    InvalidMeasurement(String),
    #[error("stream {0} is not accepting measurements")]
    StreamClosed(String),
}

impl DetectError {
    pub(crate) fn not_found(kind: &'static str, id: impl ToString) -> Self {
        DetectError::NotFound {
            kind,
            id: id.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Closed vocabularies
// ---------------------------------------------------------------------------

/// Severity levels for detected incidents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(DetectError::UnknownVariant {
                kind: "severity",
                value: other.to_string(),
            }),
        }
    }
}

/// Safety circuit tier: how much autonomy the system has to act.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafetyZone {
    /// Remediation runs automatically.
    Green,
    /// Remediation waits for an operator.
    Yellow,
    /// Alert only, never remediated automatically.
    Red,
}

impl SafetyZone {
    pub fn as_str(&self) -> &'static str {
        match self {
            SafetyZone::Green => "green",
            SafetyZone::Yellow => "yellow",
            SafetyZone::Red => "red",
        }
    }

    /// The status an incident starts in for this zone.
    pub fn initial_status(&self) -> ActionStatus {
        match self {
            SafetyZone::Green => ActionStatus::AutoExecuted,
            SafetyZone::Yellow => ActionStatus::PendingApproval,
            SafetyZone::Red => ActionStatus::AlertOnly,
        }
    }
}

impl std::str::FromStr for SafetyZone {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "green" => Ok(SafetyZone::Green),
            "yellow" => Ok(SafetyZone::Yellow),
            "red" => Ok(SafetyZone::Red),
            other => Err(DetectError::UnknownVariant {
                kind: "safety zone",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionStatus {
    AutoExecuted,
    PendingApproval,
    Approved,
    Rejected,
    AlertOnly,
}

impl ActionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionStatus::AutoExecuted => "auto_executed",
            ActionStatus::PendingApproval => "pending_approval",
            ActionStatus::Approved => "approved",
            ActionStatus::Rejected => "rejected",
            ActionStatus::AlertOnly => "alert_only",
        }
    }
}

impl std::str::FromStr for ActionStatus {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "auto_executed" => Ok(ActionStatus::AutoExecuted),
            "pending_approval" => Ok(ActionStatus::PendingApproval),
            "approved" => Ok(ActionStatus::Approved),
            "rejected" => Ok(ActionStatus::Rejected),
            "alert_only" => Ok(ActionStatus::AlertOnly),
            other => Err(DetectError::UnknownVariant {
                kind: "action status",
                value: other.to_string(),
            }),
        }
    }
}

/// Family of equipment an agent watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Precision,
    Facility,
    Assembly,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::Precision => "precision",
            AgentType::Facility => "facility",
            AgentType::Assembly => "assembly",
        }
    }
}

impl std::str::FromStr for AgentType {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "precision" => Ok(AgentType::Precision),
            "facility" => Ok(AgentType::Facility),
            "assembly" => Ok(AgentType::Assembly),
            other => Err(DetectError::UnknownVariant {
                kind: "agent type",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Active,
    Inactive,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Active => "active",
            AgentStatus::Inactive => "inactive",
            AgentStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = DetectError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(AgentStatus::Active),
            "inactive" => Ok(AgentStatus::Inactive),
            "error" => Ok(AgentStatus::Error),
            other => Err(DetectError::UnknownVariant {
                kind: "agent status",
                value: other.to_string(),
            }),
        }
    }
}

macro_rules! display_as_str {
    ($($ty:ty),*) => {
        $(impl std::fmt::Display for $ty {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        })*
    };
}

display_as_str!(Severity, SafetyZone, ActionStatus, AgentType, AgentStatus);

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A detection handed to the incident manager: either a control-rule
/// violation or a threshold ceiling breach, already escalated.
#[derive(Debug, Clone)]
pub struct Detection {
    pub source_id: String,
    pub incident_type: String,
    pub message: String,
    pub detected_value: f64,
    pub threshold_value: f64,
    pub decision: EscalationDecision,
    pub z_score: Option<f64>,
    pub rate_of_change: Option<f64>,
    pub detected_at: DateTime<Utc>,
}

/// An incident with its escalation tier and lifecycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub id: Uuid,
    pub source_id: String,
    pub severity: Severity,
    pub incident_type: String,
    pub message: String,
    pub detected_value: f64,
    pub threshold_value: f64,
    pub recommended_action: String,
    pub action_status: ActionStatus,
    pub action_zone: SafetyZone,
    pub agent_type: Option<AgentType>,
    pub z_score: Option<f64>,
    pub rate_of_change: Option<f64>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub operator_notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Incident {
    pub fn from_detection(detection: &Detection, agent_type: Option<AgentType>) -> Self {
        let decision = &detection.decision;
        Self {
            id: Uuid::new_v4(),
            source_id: detection.source_id.clone(),
            severity: decision.severity,
            incident_type: detection.incident_type.clone(),
            message: detection.message.clone(),
            detected_value: detection.detected_value,
            threshold_value: detection.threshold_value,
            recommended_action: decision.recommended_action.clone(),
            action_status: decision.action_status,
            action_zone: decision.action_zone,
            agent_type,
            z_score: detection.z_score,
            rate_of_change: detection.rate_of_change,
            resolved: false,
            resolved_at: None,
            operator_notes: None,
            created_at: detection.detected_at,
        }
    }
}

/// One monitoring agent per source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: Uuid,
    pub agent_type: AgentType,
    pub source_id: String,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    pub detections_24h: u64,
    pub capabilities: Vec<String>,
    pub protocol: String,
    pub registered_at: DateTime<Utc>,
}

/// Change notifications for the store and any subscribers. Sent after all
/// engine locks are released.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    MeasurementRecorded(Measurement),
    IncidentCreated(Incident),
    IncidentUpdated(Incident),
    AgentUpdated(Agent),
}

/// Publishing side of the engine event channels. Incident and agent events
/// go on an unbounded queue and are never dropped; measurement events go on
/// a bounded broadcast channel and are dropped for a lagging receiver.
#[derive(Debug, Clone)]
pub struct EventSender {
    lifecycle: mpsc::UnboundedSender<EngineEvent>,
    measurements: broadcast::Sender<EngineEvent>,
}

pub struct EventReceiver {
    pub lifecycle: mpsc::UnboundedReceiver<EngineEvent>,
    pub measurements: broadcast::Receiver<EngineEvent>,
}

/// Create the engine event channels; `capacity` bounds the measurement side.
pub fn event_channel(capacity: usize) -> (EventSender, EventReceiver) {
    let (lifecycle_tx, lifecycle_rx) = mpsc::unbounded_channel();
    let (measurements_tx, measurements_rx) = broadcast::channel(capacity);
    (
        EventSender {
            lifecycle: lifecycle_tx,
            measurements: measurements_tx,
        },
        EventReceiver {
            lifecycle: lifecycle_rx,
            measurements: measurements_rx,
        },
    )
}

impl EventSender {
    /// Never blocks. Having no receiver is fine.
    pub fn send(&self, event: EngineEvent) {
        match event {
            EngineEvent::MeasurementRecorded(_) => {
                let _ = self.measurements.send(event);
            }
            _ => {
                let _ = self.lifecycle.send(event);
            }
        }
    }
}

impl Agent {
    pub fn uptime_hours(&self, now: DateTime<Utc>) -> f64 {
        (now - self.registered_at).num_seconds().max(0) as f64 / 3600.0
    }
}
