//! Dose budget arithmetic.
//!
//! Pure functions relating target resolution, radiation sensitivity and
//! signal decay to a dose budget (MGy), and reconciling dose, exposure time
//! and transmission against instrument limits.
//!
//! The budget assumes an increase in B factor of 1 Å²/MGy: the dose at which
//! reflections at `resolution` have decayed to `decay_limit` percent is
//! `2·d²·ln(100/decay_limit)`.

use crate::error::{AppResult, WorkflowError};
use serde::{Deserialize, Serialize};

/// Session defaults used when a request leaves a limit unset.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DoseDefaults {
    /// Maximum dose budget in MGy
    pub maximum_dose_budget: f64,
    /// Minimum intensity at the resolution edge at experiment end (%)
    pub decay_limit: f64,
}

impl Default for DoseDefaults {
    fn default() -> Self {
        Self {
            maximum_dose_budget: 20.0,
            decay_limit: 25.0,
        }
    }
}

/// Exposure time limits of the detector, in seconds.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExposureLimits {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// Reconciled acquisition settings.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct DoseSettings {
    /// Exposure time per image (s)
    pub exposure_time: f64,
    /// Beam transmission (%)
    pub transmission: f64,
    /// Dose for one pass over the strategy (MGy)
    pub use_dose: f64,
    /// Total acquisition time for one pass (s)
    pub experiment_time: f64,
    /// True when the exposure limit forced a lower dose than requested
    pub dose_clamped: bool,
}

/// Resolution-dependent dose budget in MGy.
///
/// `decay_limit` and `maximum_dose_budget` fall back to `defaults` when unset.
pub fn budget(
    resolution: f64,
    decay_limit: Option<f64>,
    maximum_dose_budget: Option<f64>,
    relative_sensitivity: f64,
    defaults: &DoseDefaults,
) -> AppResult<f64> {
    let decay_limit = decay_limit.unwrap_or(defaults.decay_limit);
    let max_budget = maximum_dose_budget.unwrap_or(defaults.maximum_dose_budget);
    if decay_limit <= 0.0 {
        return Err(WorkflowError::Validation(format!(
            "decay limit must be positive, got {}",
            decay_limit
        )));
    }
    if resolution < 0.0 {
        return Err(WorkflowError::Validation(format!(
            "resolution must not be negative, got {}",
            resolution
        )));
    }
    if relative_sensitivity <= 0.0 {
        return Err(WorkflowError::Validation(format!(
            "relative radiation sensitivity must be positive, got {}",
            relative_sensitivity
        )));
    }

    let result = 2.0 * resolution * resolution * (100.0 / decay_limit).ln();
    Ok(result.min(max_budget) / relative_sensitivity)
}

/// Dose available to the current step of the workflow.
///
/// After characterisation the remainder of the budget is available; during
/// characterisation only `characterisation_fraction` of it.
pub fn split_budget(
    dose_budget: f64,
    characterisation_dose: Option<f64>,
    characterisation_fraction: f64,
) -> f64 {
    match characterisation_dose {
        Some(dose) if dose > 0.0 => dose_budget - dose,
        _ => dose_budget * characterisation_fraction,
    }
}

/// Time to acquire one pass over `strategy_length` degrees.
pub fn experiment_time(exposure_time: f64, image_width: f64, strategy_length: f64) -> f64 {
    exposure_time * strategy_length / image_width
}

/// Scan-axis rotation rate in degrees per second.
pub fn rotation_rate(exposure_time: f64, image_width: f64) -> f64 {
    image_width / exposure_time
}

/// Dose delivered during `experiment_time` at `transmission` percent.
pub fn accumulated_dose(std_dose_rate: f64, experiment_time: f64, transmission: f64) -> f64 {
    std_dose_rate * experiment_time * transmission / 100.0
}

/// Dose for one pass at the given transmission and exposure.
pub fn dose_for_transmission(
    transmission: f64,
    exposure_time: f64,
    image_width: f64,
    strategy_length: f64,
    std_dose_rate: f64,
) -> f64 {
    accumulated_dose(
        std_dose_rate,
        experiment_time(exposure_time, image_width, strategy_length),
        transmission,
    )
}

/// Transmission (%) needed to deliver `use_dose`; may exceed 100.
pub fn transmission_for_dose(
    use_dose: f64,
    std_dose_rate: f64,
    exposure_time: f64,
    image_width: f64,
    strategy_length: f64,
) -> f64 {
    100.0 * use_dose / (std_dose_rate * experiment_time(exposure_time, image_width, strategy_length))
}

/// Derives transmission and exposure for a requested dose.
///
/// The transmission is computed for the current exposure, shortened first to
/// the detector maximum if it is above it. If the transmission would exceed
/// 100 %, transmission is pinned at 100 % and the exposure is lengthened
/// instead. If that exposure is above the detector maximum, the exposure is
/// clamped to the maximum and the dose reduced to what is achievable.
pub fn derive_from_dose(
    use_dose: f64,
    std_dose_rate: f64,
    image_width: f64,
    strategy_length: f64,
    exposure_time: f64,
    limits: &ExposureLimits,
) -> AppResult<DoseSettings> {
    for (name, value) in [
        ("standard dose rate", std_dose_rate),
        ("image width", image_width),
        ("strategy length", strategy_length),
        ("exposure time", exposure_time),
    ] {
        if value <= 0.0 {
            return Err(WorkflowError::Validation(format!(
                "{} must be positive, got {}",
                name, value
            )));
        }
    }
    if use_dose < 0.0 {
        return Err(WorkflowError::Validation(format!(
            "dose must not be negative, got {}",
            use_dose
        )));
    }

    let max_exposure = limits.max.filter(|max| *max > 0.0);
    // Start from an exposure the detector can do
    let mut exposure_time = match max_exposure {
        Some(max) if exposure_time > max => max,
        _ => exposure_time,
    };
    let mut experiment_time = experiment_time(exposure_time, image_width, strategy_length);
    let transmission = 100.0 * use_dose / (std_dose_rate * experiment_time);
    if transmission <= 100.0 {
        return Ok(DoseSettings {
            exposure_time,
            transmission,
            use_dose,
            experiment_time,
            dose_clamped: false,
        });
    }

    experiment_time = use_dose / std_dose_rate;
    exposure_time = experiment_time * image_width / strategy_length;
    match max_exposure {
        Some(max) if exposure_time > max => {
            let experiment_time = max * strategy_length / image_width;
            Ok(DoseSettings {
                exposure_time: max,
                transmission: 100.0,
                use_dose: (std_dose_rate * experiment_time).min(use_dose),
                experiment_time,
                dose_clamped: true,
            })
        }
        _ => Ok(DoseSettings {
            exposure_time,
            transmission: 100.0,
            use_dose,
            experiment_time,
            dose_clamped: false,
        }),
    }
}
