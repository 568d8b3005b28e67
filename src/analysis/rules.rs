//! Western Electric out-of-control rules.
//!
//! Each rule is a pure function of the values and the baseline. Rules that
//! need a window of `k` points only start reporting at index `k - 1`, so
//! evaluating a prefix of a series always yields a prefix of the violations.

use crate::analysis::stats::BaselineStats;
use crate::analysis::zones::{classify, Side, ZoneLabel};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationSeverity {
    Warning,
    Critical,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Warning => write!(f, "warning"),
            ViolationSeverity::Critical => write!(f, "critical"),
        }
    }
}

/// The four rules, numbered as on the chart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum RuleId {
    /// One point beyond 3σ.
    BeyondThreeSigma = 1,
    /// Two of three consecutive points beyond 2σ, same side.
    TwoOfThreeBeyondTwoSigma = 2,
    /// Four of five consecutive points beyond 1σ, same side.
    FourOfFiveBeyondOneSigma = 3,
    /// Eight consecutive points on one side of the mean.
    EightOnOneSide = 4,
}

impl RuleId {
    pub const ALL: [RuleId; 4] = [
        RuleId::BeyondThreeSigma,
        RuleId::TwoOfThreeBeyondTwoSigma,
        RuleId::FourOfFiveBeyondOneSigma,
        RuleId::EightOnOneSide,
    ];

    pub fn number(&self) -> u8 {
        *self as u8
    }

    pub fn severity(&self) -> ViolationSeverity {
        match self {
            RuleId::BeyondThreeSigma | RuleId::TwoOfThreeBeyondTwoSigma => {
                ViolationSeverity::Critical
            }
            RuleId::FourOfFiveBeyondOneSigma | RuleId::EightOnOneSide => {
                ViolationSeverity::Warning
            }
        }
    }

    /// Number of consecutive points the rule looks at.
    pub fn window(&self) -> usize {
        match self {
            RuleId::BeyondThreeSigma => 1,
            RuleId::TwoOfThreeBeyondTwoSigma => 3,
            RuleId::FourOfFiveBeyondOneSigma => 5,
            RuleId::EightOnOneSide => 8,
        }
    }
}

impl From<RuleId> for u8 {
    fn from(rule: RuleId) -> Self {
        rule.number()
    }
}

impl TryFrom<u8> for RuleId {
    type Error = String;

    fn try_from(n: u8) -> Result<Self, Self::Error> {
        RuleId::ALL
            .into_iter()
            .find(|r| r.number() == n)
            .ok_or_else(|| format!("unknown rule id {}", n))
    }
}

impl std::fmt::Display for RuleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            RuleId::BeyondThreeSigma => "one point beyond 3 sigma",
            RuleId::TwoOfThreeBeyondTwoSigma => "2 of 3 beyond 2 sigma",
            RuleId::FourOfFiveBeyondOneSigma => "4 of 5 beyond 1 sigma",
            RuleId::EightOnOneSide => "8 in a row on one side",
        };
        write!(f, "rule {} ({})", self.number(), text)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Violation {
    pub rule: RuleId,
    pub index: usize,
    pub side: Side,
    pub severity: ViolationSeverity,
}

impl Violation {
    fn new(rule: RuleId, index: usize, side: Side) -> Self {
        Self {
            rule,
            index,
            side,
            severity: rule.severity(),
        }
    }
}

/// Run all four rules over the series. Violations come back ordered by index,
/// then rule number.
pub fn evaluate(values: &[f64], baseline: &BaselineStats) -> Vec<Violation> {
    let zones: Vec<ZoneLabel> = values.iter().map(|&v| classify(v, baseline)).collect();
    (0..values.len())
        .flat_map(|i| check_index(values, &zones, baseline.mean, i))
        .collect()
}

/// Violations whose window ends at `index`. Out-of-range indices yield none.
pub fn evaluate_at(values: &[f64], baseline: &BaselineStats, index: usize) -> Vec<Violation> {
    if index >= values.len() {
        return Vec::new();
    }
    let start = index.saturating_sub(RuleId::EightOnOneSide.window() - 1);
    let zones: Vec<ZoneLabel> = values[start..=index]
        .iter()
        .map(|&v| classify(v, baseline))
        .collect();
    check_index(&values[start..=index], &zones, baseline.mean, index - start)
        .into_iter()
        .map(|mut v| {
            v.index += start;
            v
        })
        .collect()
}

fn check_index(values: &[f64], zones: &[ZoneLabel], mean: f64, i: usize) -> Vec<Violation> {
    let mut found = Vec::new();

    if let Some(side) = beyond_three_sigma(zones[i]) {
        found.push(Violation::new(RuleId::BeyondThreeSigma, i, side));
    }
    if let Some(side) = count_beyond(zones, i, RuleId::TwoOfThreeBeyondTwoSigma, 2, 2) {
        found.push(Violation::new(RuleId::TwoOfThreeBeyondTwoSigma, i, side));
    }
    if let Some(side) = count_beyond(zones, i, RuleId::FourOfFiveBeyondOneSigma, 1, 4) {
        found.push(Violation::new(RuleId::FourOfFiveBeyondOneSigma, i, side));
    }
    if let Some(side) = run_on_one_side(values, mean, i) {
        found.push(Violation::new(RuleId::EightOnOneSide, i, side));
    }

    found
}

fn beyond_three_sigma(zone: ZoneLabel) -> Option<Side> {
    zone.exceeds(3).then(|| zone.side())
}

/// At least `needed` of the window's points past the `sigma`-limit, all
/// counted on the same side.
fn count_beyond(
    zones: &[ZoneLabel],
    i: usize,
    rule: RuleId,
    sigma: u8,
    needed: usize,
) -> Option<Side> {
    let window = rule.window();
    if i + 1 < window {
        return None;
    }
    let slice = &zones[i + 1 - window..=i];
    [Side::Upper, Side::Lower].into_iter().find(|side| {
        slice
            .iter()
            .filter(|z| z.side() == *side && z.exceeds(sigma))
            .count()
            >= needed
    })
}

/// Eight consecutive points strictly above, or strictly below, the mean.
fn run_on_one_side(values: &[f64], mean: f64, i: usize) -> Option<Side> {
    let window = RuleId::EightOnOneSide.window();
    if i + 1 < window {
        return None;
    }
    let slice = &values[i + 1 - window..=i];
    if slice.iter().all(|&v| v > mean) {
        Some(Side::Upper)
    } else if slice.iter().all(|&v| v < mean) {
        Some(Side::Lower)
    } else {
        None
    }
}
