//! Statistical process control: baselines, zones, Western Electric rules and
//! process capability.

pub mod capability;
pub mod rules;
pub mod stats;
pub mod zones;

use serde::Serialize;

use self::capability::{CapabilityResult, SpecLimits};
use self::rules::Violation;
use self::stats::BaselineStats;
use self::zones::ZoneLabel;

/// Full control chart analysis of one series against its own baseline.
#[derive(Debug, Clone, Serialize)]
pub struct SpcReport {
    pub baseline: BaselineStats,
    pub zones: Vec<ZoneLabel>,
    pub violations: Vec<Violation>,
    pub capability: Option<CapabilityResult>,
}

impl SpcReport {
    pub fn analyze(values: &[f64], limits: &SpecLimits) -> Self {
        let baseline = BaselineStats::from_sample(values);
        Self::against(values, baseline, limits)
    }

    /// Analyze `values` against an externally supplied baseline.
    pub fn against(values: &[f64], baseline: BaselineStats, limits: &SpecLimits) -> Self {
        let zones = zones::classify_series(values, &baseline);
        // Rules are meaningless on a degenerate baseline.
        let violations = if baseline.has_basis() {
            rules::evaluate(values, &baseline)
        } else {
            Vec::new()
        };
        let capability = limits.capability(baseline.mean, baseline.std);
        Self {
            baseline,
            zones,
            violations,
            capability,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_report_on_short_series() {
        let report = SpcReport::analyze(&[5.0], &SpecLimits::new(10.0, 0.0));
        assert_eq!(report.zones.len(), 1);
        assert!(report.violations.is_empty());
        assert!(report.capability.is_none());
    }

    #[test]
    fn test_report_with_capability() {
        let values = [49.0, 50.0, 51.0, 50.0, 49.5, 50.5];
        let report = SpcReport::analyze(&values, &SpecLimits::new(55.0, 45.0));
        assert_eq!(report.zones.len(), values.len());
        assert!(report.capability.is_some());
    }
}
