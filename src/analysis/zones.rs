//! Zone classification of values against a baseline.

use crate::analysis::stats::BaselineStats;
use serde::{Deserialize, Serialize};

/// Which side of the mean a value or violation sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Upper,
    Lower,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Upper => write!(f, "upper"),
            Side::Lower => write!(f, "lower"),
        }
    }
}

/// Control chart zone. Zone C is nearest the mean, zone A farthest before
/// "beyond" the 3σ limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneLabel {
    BeyondUpper,
    AUpper,
    BUpper,
    CUpper,
    CLower,
    BLower,
    ALower,
    BeyondLower,
}

impl ZoneLabel {
    pub fn side(&self) -> Side {
        match self {
            ZoneLabel::BeyondUpper | ZoneLabel::AUpper | ZoneLabel::BUpper | ZoneLabel::CUpper => {
                Side::Upper
            }
            ZoneLabel::CLower | ZoneLabel::BLower | ZoneLabel::ALower | ZoneLabel::BeyondLower => {
                Side::Lower
            }
        }
    }

    /// Number of sigma bands the value has crossed: 0 for zone C, 3 for beyond.
    pub fn depth(&self) -> u8 {
        match self {
            ZoneLabel::CUpper | ZoneLabel::CLower => 0,
            ZoneLabel::BUpper | ZoneLabel::BLower => 1,
            ZoneLabel::AUpper | ZoneLabel::ALower => 2,
            ZoneLabel::BeyondUpper | ZoneLabel::BeyondLower => 3,
        }
    }

    /// True when the value lies past the `sigma`-limit on its side.
    pub fn exceeds(&self, sigma: u8) -> bool {
        self.depth() >= sigma
    }
}

impl std::fmt::Display for ZoneLabel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ZoneLabel::BeyondUpper => "beyond+",
            ZoneLabel::AUpper => "A+",
            ZoneLabel::BUpper => "B+",
            ZoneLabel::CUpper => "C+",
            ZoneLabel::CLower => "C-",
            ZoneLabel::BLower => "B-",
            ZoneLabel::ALower => "A-",
            ZoneLabel::BeyondLower => "beyond-",
        };
        f.write_str(label)
    }
}

/// Label a value against the baseline.
///
/// Limits are checked beyond -> A -> B, upper side before lower, with strict
/// comparisons; anything left falls into the C zone on its side of the mean
/// (a value equal to the mean is C+).
pub fn classify(value: f64, baseline: &BaselineStats) -> ZoneLabel {
    if value > baseline.ucl3 {
        ZoneLabel::BeyondUpper
    } else if value < baseline.lcl3 {
        ZoneLabel::BeyondLower
    } else if value > baseline.ucl2 {
        ZoneLabel::AUpper
    } else if value < baseline.lcl2 {
        ZoneLabel::ALower
    } else if value > baseline.ucl1 {
        ZoneLabel::BUpper
    } else if value < baseline.lcl1 {
        ZoneLabel::BLower
    } else if value >= baseline.mean {
        ZoneLabel::CUpper
    } else {
        ZoneLabel::CLower
    }
}

pub fn classify_series(values: &[f64], baseline: &BaselineStats) -> Vec<ZoneLabel> {
    values.iter().map(|&v| classify(v, baseline)).collect()
}
