//! Data-quality assessment beyond the hard validity rules.
//!
//! V3 plausibility bounds and the V4 rolling anomaly gate flag rows as
//! suspect; they never drop data.

use adbandit_models::{Metric, MetricQuality};

/// Assessment verdict with the reasons that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Assessment {
    pub quality: MetricQuality,
    pub flags: Vec<String>,
}

impl Assessment {
    pub fn ok() -> Self {
        Self {
            quality: MetricQuality::Ok,
            flags: Vec::new(),
        }
    }
}

/// Plausibility and anomaly checks over a rolling per-arm baseline.
#[derive(Debug, Clone, Copy)]
pub struct MetricValidator {
    /// Z-score beyond which a row is flagged (default 3.0).
    pub anomaly_z: f64,
    /// Upper plausible ROAS bound (default 100).
    pub roas_max: f64,
    /// Minimum history points before the anomaly gate engages.
    pub min_baseline: usize,
}

impl Default for MetricValidator {
    fn default() -> Self {
        Self {
            anomaly_z: 3.0,
            roas_max: 100.0,
            min_baseline: 3,
        }
    }
}

impl MetricValidator {
    /// Assess one candidate against its arm's recent history (typically the
    /// trailing seven days). The caller is responsible for passing history
    /// for the same arm only.
    pub fn assess(&self, metric: &Metric, history: &[Metric]) -> Assessment {
        let mut flags = metric.plausibility_flags(self.roas_max);

        if metric.cost > 0.0 {
            if let Some((mean, std)) = roas_baseline(history, self.min_baseline) {
                if std > 0.0 {
                    let z = (metric.roas() - mean) / std;
                    if z.abs() > self.anomaly_z {
                        flags.push(format!(
                            "roas z-score {:.1} beyond {:.1} (baseline mean {:.2}, std {:.2})",
                            z, self.anomaly_z, mean, std
                        ));
                    }
                }
            }
        }

        Assessment {
            quality: if flags.is_empty() {
                MetricQuality::Ok
            } else {
                MetricQuality::Suspect
            },
            flags,
        }
    }
}

/// Mean and standard deviation of the ROAS baseline, from clean rows with
/// real spend. `None` until enough points exist.
fn roas_baseline(history: &[Metric], min_points: usize) -> Option<(f64, f64)> {
    let points: Vec<f64> = history
        .iter()
        .filter(|m| m.cost > 0.0 && m.quality == MetricQuality::Ok)
        .map(|m| m.roas())
        .collect();
    if points.len() < min_points {
        return None;
    }
    let n = points.len() as f64;
    let mean = points.iter().sum::<f64>() / n;
    let var = points.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
    Some((mean, var.sqrt()))
}
