//! Process capability (Cpk) against specification limits.

use serde::{Deserialize, Serialize};

// Bands are the exact fractions behind the customary 1.67 / 1.33 cut-offs.
const EXCELLENT_CPK: f64 = 5.0 / 3.0;
const GOOD_CPK: f64 = 4.0 / 3.0;
const MARGINAL_CPK: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityRating {
    Excellent,
    Good,
    Marginal,
    Poor,
}

impl CapabilityRating {
    pub fn from_cpk(cpk: f64) -> Self {
        if cpk >= EXCELLENT_CPK {
            CapabilityRating::Excellent
        } else if cpk >= GOOD_CPK {
            CapabilityRating::Good
        } else if cpk >= MARGINAL_CPK {
            CapabilityRating::Marginal
        } else {
            CapabilityRating::Poor
        }
    }
}

impl std::fmt::Display for CapabilityRating {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CapabilityRating::Excellent => write!(f, "excellent"),
            CapabilityRating::Good => write!(f, "good"),
            CapabilityRating::Marginal => write!(f, "marginal"),
            CapabilityRating::Poor => write!(f, "poor"),
        }
    }
}

/// Upper/lower specification limits as configured for a parameter. Either
/// may be missing; capability needs both.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpecLimits {
    #[serde(default)]
    pub usl: Option<f64>,
    #[serde(default)]
    pub lsl: Option<f64>,
}

impl SpecLimits {
    pub fn new(usl: f64, lsl: f64) -> Self {
        Self {
            usl: Some(usl),
            lsl: Some(lsl),
        }
    }

    /// Capability for a process with the given mean and spread, if both
    /// limits are known.
    pub fn capability(&self, mean: f64, std: f64) -> Option<CapabilityResult> {
        match (self.usl, self.lsl) {
            (Some(usl), Some(lsl)) => capability(mean, std, usl, lsl),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapabilityResult {
    pub cpk: f64,
    pub cpu: f64,
    pub cpl: f64,
    pub rating: CapabilityRating,
}

/// cpu = (USL - mean) / 3σ, cpl = (mean - LSL) / 3σ, cpk = min(cpu, cpl).
///
/// Returns `None` for a zero (or invalid) spread, where the ratios are undefined.
pub fn capability(mean: f64, std: f64, usl: f64, lsl: f64) -> Option<CapabilityResult> {
    if std.is_nan() || std <= 0.0 {
        return None;
    }
    let cpu = (usl - mean) / (3.0 * std);
    let cpl = (mean - lsl) / (3.0 * std);
    let cpk = cpu.min(cpl);
    Some(CapabilityResult {
        cpk,
        cpu,
        cpl,
        rating: CapabilityRating::from_cpk(cpk),
    })
}
