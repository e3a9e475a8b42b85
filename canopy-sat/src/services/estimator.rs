//! NDVI-based biomass and carbon estimation
//!
//! Quadratic regression calibrated for tropical forest (Foody et al. 2003):
//! biomass (Mg/ha) = -156.03 + 625.41 * NDVI - 415.87 * NDVI^2
//! Negative regression output clamps to zero; with these coefficients the
//! curve stays below zero until NDVI ~ 0.28.

use canopy_common::{Error, Result};

const INTERCEPT: f64 = -156.03;
const LINEAR_COEF: f64 = 625.41;
const QUADRATIC_COEF: f64 = -415.87;

/// IPCC default biomass-to-carbon conversion factor
pub const DEFAULT_CARBON_FACTOR: f64 = 0.47;

/// Estimate above-ground biomass in tonnes (Mg) for a plot.
///
/// `mean_ndvi` must lie in [0, 1]; out-of-range input is rejected, not
/// clamped. The regression floor keeps the result non-negative.
pub fn estimate_biomass(mean_ndvi: f64, area_hectares: f64) -> Result<f64> {
    if !(0.0..=1.0).contains(&mean_ndvi) {
        return Err(Error::InvalidInput(format!(
            "NDVI must be between 0 and 1, got {mean_ndvi}"
        )));
    }
    if area_hectares <= 0.0 {
        return Err(Error::InvalidInput(format!(
            "plot area must be positive, got {area_hectares} ha"
        )));
    }

    let per_hectare = INTERCEPT + LINEAR_COEF * mean_ndvi + QUADRATIC_COEF * mean_ndvi * mean_ndvi;
    let per_hectare = per_hectare.max(0.0);

    Ok(per_hectare * area_hectares)
}

/// Convert biomass to stored carbon in tonnes.
pub fn estimate_carbon(biomass_tonnes: f64, carbon_factor: f64) -> f64 {
    biomass_tonnes * carbon_factor
}

/// Human-readable interpretation of a mean NDVI value.
pub fn interpret_ndvi(ndvi: f64) -> &'static str {
    if ndvi < 0.1 {
        "No vegetation / water / bare soil"
    } else if ndvi < 0.3 {
        "Sparse or degraded vegetation"
    } else if ndvi < 0.5 {
        "Moderate vegetation"
    } else if ndvi < 0.7 {
        "Dense vegetation"
    } else {
        "Very dense vegetation / mature forest"
    }
}
