//! Aggregate statistics over a canonical series

use super::SeriesPoint;
use serde::{Deserialize, Serialize};

/// Vegetation-index aggregates for one calculation period
///
/// Every field is `None` when the series carries no value for that index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeriesStats {
    pub ndvi_mean: Option<f64>,
    pub ndvi_min: Option<f64>,
    pub ndvi_max: Option<f64>,
    pub ndvi_std: Option<f64>,
    pub evi_mean: Option<f64>,
    pub evi_min: Option<f64>,
    pub evi_max: Option<f64>,
}

impl SeriesStats {
    /// Compute aggregates from a canonical (date-sorted) series.
    pub fn compute(points: &[SeriesPoint]) -> Self {
        let ndvi: Vec<f64> = points.iter().filter_map(|p| p.ndvi).collect();
        let evi: Vec<f64> = points.iter().filter_map(|p| p.evi).collect();

        Self {
            ndvi_mean: mean(&ndvi),
            ndvi_min: min(&ndvi),
            ndvi_max: max(&ndvi),
            ndvi_std: std_dev(&ndvi),
            evi_mean: mean(&evi),
            evi_min: min(&evi),
            evi_max: max(&evi),
        }
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

fn min(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::min)
}

fn max(values: &[f64]) -> Option<f64> {
    values.iter().copied().reduce(f64::max)
}

/// Population standard deviation
fn std_dev(values: &[f64]) -> Option<f64> {
    let m = mean(values)?;
    let variance = values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / values.len() as f64;
    Some(variance.sqrt())
}
