//! Series reliability classification
//!
//! A point counts as good when both vegetation indices are present for its
//! date; cloud fraction is the share of points that are not. The label
//! thresholds are evaluated in order, first match wins.

use crate::models::{QualityTag, SeriesPoint};
use serde::{Deserialize, Serialize};

/// Reliability label for a calculation's data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityLabel {
    Excellent,
    Good,
    Fair,
    Poor,
    NoData,
}

impl QualityLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityLabel::Excellent => "excellent",
            QualityLabel::Good => "good",
            QualityLabel::Fair => "fair",
            QualityLabel::Poor => "poor",
            QualityLabel::NoData => "no_data",
        }
    }
}

/// Threshold function over (observation count, cloud fraction in percent).
///
/// Cloud thresholds are strict: exactly 20% cloud cover is not excellent.
pub fn label_for(observation_count: usize, cloud_fraction_pct: f64) -> QualityLabel {
    if observation_count == 0 {
        QualityLabel::NoData
    } else if observation_count >= 10 && cloud_fraction_pct < 20.0 {
        QualityLabel::Excellent
    } else if observation_count >= 5 && cloud_fraction_pct < 40.0 {
        QualityLabel::Good
    } else if observation_count >= 3 {
        QualityLabel::Fair
    } else {
        QualityLabel::Poor
    }
}

/// Classify a canonical series, returning the label and the cloud fraction
/// as a percentage.
pub fn classify(series: &[SeriesPoint]) -> (QualityLabel, f64) {
    if series.is_empty() {
        return (QualityLabel::NoData, 100.0);
    }

    let good = series
        .iter()
        .filter(|p| p.quality == QualityTag::Good)
        .count();
    let cloud_fraction_pct = (1.0 - good as f64 / series.len() as f64) * 100.0;

    (label_for(series.len(), cloud_fraction_pct), cloud_fraction_pct)
}
