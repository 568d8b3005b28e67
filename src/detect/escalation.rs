//! Three-tier escalation policy.
//!
//! Ceiling proximity is judged against an externally supplied hard limit
//! (e.g. equipment max rating), independently of the statistical baseline.
//! Control-rule violations escalate by rule severity.

use serde::{Deserialize, Serialize};

use crate::analysis::rules::{Violation, ViolationSeverity};
use crate::config::EscalationConfig;
use crate::detect::{ActionStatus, SafetyZone, Severity};

/// Recommended action per safety zone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSet {
    pub green: String,
    pub yellow: String,
    pub red: String,
}

impl ActionSet {
    /// Built-in actions for well-known parameters.
    pub fn defaults_for(parameter: &str) -> Self {
        let (green, yellow, red) = match parameter {
            "temperature" => ("increase_coolant", "reduce_thermal_load", "emergency_stop"),
            "vibration" => ("schedule_inspection", "alert_maintenance", "emergency_stop"),
            _ => ("schedule_inspection", "request_operator_review", "emergency_stop"),
        };
        Self {
            green: green.to_string(),
            yellow: yellow.to_string(),
            red: red.to_string(),
        }
    }

    pub fn for_zone(&self, zone: SafetyZone) -> &str {
        match zone {
            SafetyZone::Green => &self.green,
            SafetyZone::Yellow => &self.yellow,
            SafetyZone::Red => &self.red,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscalationDecision {
    pub severity: Severity,
    pub action_zone: SafetyZone,
    pub action_status: ActionStatus,
    pub recommended_action: String,
}

impl EscalationDecision {
    fn new(severity: Severity, zone: SafetyZone, actions: &ActionSet) -> Self {
        Self {
            severity,
            action_zone: zone,
            action_status: zone.initial_status(),
            recommended_action: actions.for_zone(zone).to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EscalationPolicy {
    bands: EscalationConfig,
}

impl EscalationPolicy {
    pub fn new(bands: EscalationConfig) -> Self {
        Self { bands }
    }

    /// Escalate a reading against its hard ceiling. Readings at or below the
    /// green band, or a non-positive ceiling, do not escalate.
    pub fn decide_ceiling(
        &self,
        detected: f64,
        threshold: f64,
        actions: &ActionSet,
    ) -> Option<EscalationDecision> {
        if !(threshold > 0.0) || !detected.is_finite() {
            return None;
        }
        let ratio = detected / threshold;
        let (severity, zone) = if ratio > self.bands.red_ratio {
            (Severity::Critical, SafetyZone::Red)
        } else if ratio > self.bands.yellow_ratio {
            (Severity::High, SafetyZone::Yellow)
        } else if ratio > self.bands.green_ratio {
            (Severity::Medium, SafetyZone::Green)
        } else {
            return None;
        };
        Some(EscalationDecision::new(severity, zone, actions))
    }

    /// Escalate a control-rule violation. Critical rules (1, 2) need operator
    /// approval; warning rules (3, 4) auto-execute.
    pub fn decide_violation(&self, violation: &Violation, actions: &ActionSet) -> EscalationDecision {
        match violation.severity {
            ViolationSeverity::Critical => {
                EscalationDecision::new(Severity::High, SafetyZone::Yellow, actions)
            }
            ViolationSeverity::Warning => {
                EscalationDecision::new(Severity::Medium, SafetyZone::Green, actions)
            }
        }
    }
}
