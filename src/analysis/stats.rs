use serde::{Deserialize, Serialize};

/// Mean, standard deviation and the six control limits (±1σ/2σ/3σ) of a
/// baseline window.
///
/// With fewer than two samples, or a zero spread, every limit collapses to the
/// mean. Callers check [`BaselineStats::has_basis`] before trusting the limits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BaselineStats {
    pub mean: f64,
    pub std: f64,
    pub ucl1: f64,
    pub ucl2: f64,
    pub ucl3: f64,
    pub lcl1: f64,
    pub lcl2: f64,
    pub lcl3: f64,
    pub sample_count: usize,
}

impl Default for BaselineStats {
    fn default() -> Self {
        Self::from_parameters(0.0, 0.0, 0)
    }
}

impl BaselineStats {
    /// Calculate the baseline of a sample.
    /// Uses the sample standard deviation (divide by n - 1).
    pub fn from_sample(values: &[f64]) -> Self {
        let count = values.len();
        match count {
            0 => Self::default(),
            1 => Self::from_parameters(values[0], 0.0, 1),
            _ => {
                let mean = values.iter().sum::<f64>() / count as f64;
                let variance_sum: f64 = values
                    .iter()
                    .map(|v| {
                        let diff = mean - *v;
                        diff * diff
                    })
                    .sum();
                let std = (variance_sum / (count - 1) as f64).sqrt();
                Self::from_parameters(mean, std, count)
            }
        }
    }

    /// Build limits from a known mean and spread, e.g. a frozen baseline.
    pub fn from_parameters(mean: f64, std: f64, sample_count: usize) -> Self {
        // Negative or NaN spreads carry no statistical basis.
        let std = if std > 0.0 { std } else { 0.0 };
        Self {
            mean,
            std,
            ucl1: mean + std,
            ucl2: mean + 2.0 * std,
            ucl3: mean + 3.0 * std,
            lcl1: mean - std,
            lcl2: mean - 2.0 * std,
            lcl3: mean - 3.0 * std,
            sample_count,
        }
    }

    /// True when the limits are meaningful: at least two samples and a
    /// non-zero spread.
    pub fn has_basis(&self) -> bool {
        self.sample_count >= 2 && self.std > 0.0
    }

    /// Z = (value - mean) / std, or `None` on a zero-spread baseline.
    pub fn z_score(&self, value: f64) -> Option<f64> {
        if self.std > 0.0 {
            Some((value - self.mean) / self.std)
        } else {
            None
        }
    }
}
