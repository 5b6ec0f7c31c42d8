//! Protocol payload types exchanged with the strategy engine.
//!
//! These are the geometric building blocks of a plan: goniostat orientations
//! ([`SweepSetting`]), continuous scans over one orientation ([`Sweep`],
//! [`Scan`]), the translations that keep the sample centred at each
//! orientation ([`GoniostatTranslation`]) and the plans built from them
//! ([`GeometricStrategy`], [`CollectionProposal`]).
//!
//! All angles are in degrees, translations in millimetres, wavelengths in
//! Ångström.

use crate::lattice::IndexingSolution;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Identifier distinguishing distinct fixed orientations across a plan.
pub type RotationId = Uuid;

/// Motor name to position map. Ordered so that logs and replies are stable.
pub type AxisSettings = BTreeMap<String, f64>;

/// Planck constant times speed of light, in keV·Å.
pub const HC_KEV_ANGSTROM: f64 = 12.398_419_843_320_026;

/// Converts a wavelength (Å) to photon energy (keV).
pub fn energy_from_wavelength(wavelength: f64) -> f64 {
    HC_KEV_ANGSTROM / wavelength
}

/// A fixed goniostat orientation issued by the strategy engine.
///
/// `axis_settings` holds every rotation axis except the scanning one.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SweepSetting {
    pub id: RotationId,
    /// Name of the axis rotated during the scan (usually omega)
    pub scan_axis: String,
    pub axis_settings: AxisSettings,
}

impl SweepSetting {
    /// Angle of the named axis, 0.0 when the setting does not mention it.
    pub fn angle(&self, axis: &str) -> f64 {
        self.axis_settings.get(axis).copied().unwrap_or(0.0)
    }

    /// Orientation triple for the given rotation axis names.
    pub fn orientation(&self, rotation_axes: &[String; 3]) -> [f64; 3] {
        [
            self.angle(&rotation_axes[0]),
            self.angle(&rotation_axes[1]),
            self.angle(&rotation_axes[2]),
        ]
    }
}

/// Beam parameters for a sweep.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BeamSetting {
    pub wavelength: f64,
}

/// Detector parameters for a sweep.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectorSetting {
    pub distance: f64,
    #[serde(default)]
    pub resolution: Option<f64>,
}

/// A planned continuous rotation over one [`SweepSetting`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Sweep {
    pub id: Uuid,
    pub setting: SweepSetting,
    /// Scan-axis start angle
    pub start: f64,
    /// Total scan-axis range
    pub width: f64,
    pub beam_setting: BeamSetting,
    pub detector_setting: DetectorSetting,
    /// Position within the plan
    #[serde(default)]
    pub order: u32,
}

impl Sweep {
    /// Motor positions at the start of the sweep: the orientation, the scan
    /// axis at `start`, and the translation if one is known.
    pub fn initial_settings(&self, translation: Option<&GoniostatTranslation>) -> AxisSettings {
        let mut settings = self.setting.axis_settings.clone();
        settings.insert(self.setting.scan_axis.clone(), self.start);
        if let Some(translation) = translation {
            settings.extend(translation.axis_settings.clone());
        }
        settings
    }
}

/// Filename components supplied by the strategy engine.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FilenameParams {
    #[serde(default)]
    pub prefix: String,
    #[serde(default)]
    pub run: Option<u32>,
    #[serde(default)]
    pub subdir: Option<String>,
}

/// One acquisition over part (or all) of a sweep.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Scan {
    pub sweep: Sweep,
    pub start: f64,
    pub image_start_num: u32,
    pub num_images: u32,
    pub image_width: f64,
    pub exposure_time: f64,
    #[serde(default)]
    pub filename_params: FilenameParams,
}

/// Repetition metadata shared by a strategy and its proposals.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StrategyMetadata {
    /// Number of repeats of a multi-trigger sweep
    #[serde(default)]
    pub sweep_repeat: Option<u32>,
    /// Scan-axis offset between repeat starting points
    #[serde(default)]
    pub sweep_offset: Option<f64>,
    #[serde(default)]
    pub interleave_order: Option<String>,
}

impl StrategyMetadata {
    /// Repeat count and offset, if both are declared and meaningful.
    pub fn multi_trigger(&self) -> Option<(u32, f64)> {
        match (self.sweep_repeat, self.sweep_offset) {
            (Some(repeat), Some(offset)) if repeat > 0 && offset != 0.0 => Some((repeat, offset)),
            _ => None,
        }
    }
}

/// A sweep plan proposed by the strategy engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeometricStrategy {
    pub id: Uuid,
    #[serde(default)]
    pub is_user_modifiable: bool,
    #[serde(default)]
    pub default_image_width: Option<f64>,
    #[serde(default)]
    pub default_width: Option<f64>,
    pub sweeps: Vec<Sweep>,
    #[serde(flatten)]
    pub metadata: StrategyMetadata,
}

impl GeometricStrategy {
    /// Sweeps sorted by their plan order (stable for equal order values).
    pub fn ordered_sweeps(&self) -> Vec<&Sweep> {
        let mut sweeps: Vec<&Sweep> = self.sweeps.iter().collect();
        sweeps.sort_by_key(|sweep| sweep.order);
        sweeps
    }

    /// Distinct sweep settings in first-encountered plan order.
    pub fn distinct_settings(&self) -> Vec<&SweepSetting> {
        let mut seen = std::collections::HashSet::new();
        self.ordered_sweeps()
            .into_iter()
            .map(|sweep| &sweep.setting)
            .filter(|setting| seen.insert(setting.id))
            .collect()
    }

    /// Total scan-axis range covered by the plan.
    pub fn strategy_length(&self) -> f64 {
        self.sweeps.iter().map(|sweep| sweep.width).sum()
    }
}

/// Ordered scans to acquire, plus strategy metadata.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectionProposal {
    pub id: Uuid,
    #[serde(default)]
    pub relative_image_dir: Option<String>,
    #[serde(default)]
    pub strategy: StrategyMetadata,
    pub scans: Vec<Scan>,
}

/// Translation that centres the sample at one orientation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GoniostatTranslation {
    /// Orientation the translation was computed at
    pub rotation_id: RotationId,
    /// Planned orientation the translation stands in for, when different
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_rotation_id: Option<RotationId>,
    /// Angles of `rotation_id` when it is not a planned setting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rotation_settings: Option<AxisSettings>,
    /// Translation axis positions
    pub axis_settings: AxisSettings,
}

impl GoniostatTranslation {
    pub fn new(rotation_id: RotationId, axis_settings: AxisSettings) -> Self {
        Self {
            rotation_id,
            requested_rotation_id: None,
            rotation_settings: None,
            axis_settings,
        }
    }

    /// Planned setting this translation covers.
    pub fn setting_id(&self) -> RotationId {
        self.requested_rotation_id.unwrap_or(self.rotation_id)
    }
}

/// Target orientation of a centring request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GoniostatRotation {
    pub id: RotationId,
    pub axis_settings: AxisSettings,
    #[serde(default)]
    pub translation: Option<GoniostatTranslation>,
}

/// Unit cell lengths (Å) and angles (°).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnitCell {
    pub lengths: [f64; 3],
    pub angles: [f64; 3],
}

/// Lattice choice request from the strategy engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ChooseLattice {
    pub indexing_format: String,
    pub solutions: Vec<IndexingSolution>,
    #[serde(default)]
    pub lattices: Vec<String>,
    #[serde(default)]
    pub crystal_family_char: Option<char>,
}

/// Centring request issued during translational calibration.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RequestCentring {
    pub current_setting_no: u32,
    pub total_rotations: u32,
    pub rotation: GoniostatRotation,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setting(kappa: f64, phi: f64) -> SweepSetting {
        SweepSetting {
            id: Uuid::new_v4(),
            scan_axis: "omega".to_string(),
            axis_settings: AxisSettings::from([
                ("kappa".to_string(), kappa),
                ("kappa_phi".to_string(), phi),
            ]),
        }
    }

    fn sweep(setting: SweepSetting, order: u32) -> Sweep {
        Sweep {
            id: Uuid::new_v4(),
            setting,
            start: 0.0,
            width: 90.0,
            beam_setting: BeamSetting { wavelength: 1.0 },
            detector_setting: DetectorSetting {
                distance: 200.0,
                resolution: None,
            },
            order,
        }
    }

    #[test]
    fn test_energy_from_wavelength() {
        assert!((energy_from_wavelength(1.0) - 12.3984).abs() < 1e-3);
    }

    #[test]
    fn test_distinct_settings_keep_first_encountered_order() {
        let a = setting(0.0, 0.0);
        let b = setting(30.0, 90.0);
        let strategy = GeometricStrategy {
            id: Uuid::new_v4(),
            is_user_modifiable: false,
            default_image_width: None,
            default_width: None,
            sweeps: vec![sweep(b.clone(), 1), sweep(a.clone(), 0), sweep(a.clone(), 2)],
            metadata: StrategyMetadata::default(),
        };

        let ids: Vec<RotationId> = strategy.distinct_settings().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
        assert_eq!(strategy.strategy_length(), 270.0);
    }

    #[test]
    fn test_initial_settings_merge_translation() {
        let s = sweep(setting(10.0, 20.0), 0);
        let translation = GoniostatTranslation::new(
            s.setting.id,
            AxisSettings::from([("sampx".to_string(), 0.5)]),
        );
        let settings = s.initial_settings(Some(&translation));
        assert_eq!(settings["omega"], 0.0);
        assert_eq!(settings["kappa"], 10.0);
        assert_eq!(settings["sampx"], 0.5);
    }

    #[test]
    fn test_multi_trigger_requires_offset() {
        let metadata = StrategyMetadata {
            sweep_repeat: Some(3),
            sweep_offset: None,
            interleave_order: None,
        };
        assert!(metadata.multi_trigger().is_none());
    }
}
