//! Workflow configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/workflow.toml` (base configuration)
//! 2. Environment variables (prefixed with `BEAMLINE_WF_`)
//!
//! # Environment Variable Overrides
//!
//! Sections and keys are separated by a double underscore, so keys that
//! themselves contain underscores stay intact:
//!
//! ```text
//! BEAMLINE_WF_APPLICATION__LOG_LEVEL=debug
//! BEAMLINE_WF_DOSE__DECAY_LIMIT=50
//! BEAMLINE_WF_RECENTRING__ANGULAR_TOLERANCE=0.5
//! ```
//!
//! # Example
//!
//! ```no_run
//! use beamline_workflow::config::WorkflowConfig;
//!
//! fn main() -> anyhow::Result<()> {
//!     let config = WorkflowConfig::load()?;
//!     println!("Log level: {}", config.application.log_level);
//!     println!("Recentring mode: {:?}", config.recentring.default_mode);
//!     Ok(())
//! }
//! ```

use crate::dose::DoseDefaults;
use crate::session::RecentringMode;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration load error: {0}")]
    LoadError(#[from] Box<figment::Error>),
    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

/// Top-level workflow configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowConfig {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub dose: DoseConfig,
    #[serde(default)]
    pub recentring: RecentringConfig,
    #[serde(default)]
    pub acquisition: AcquisitionConfig,
    #[serde(default)]
    pub solver: SolverConfig,
    /// Translational calibration; without it no translations are predicted
    #[serde(default)]
    pub transcal: Option<TranslationalCalibration>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Emit logs as JSON lines
    #[serde(default)]
    pub json_logs: bool,
    /// Directory holding the beamline description read by the strategy engine
    #[serde(default = "default_beamline_config_dir")]
    pub beamline_config_dir: PathBuf,
    /// Capacity of the workflow event broadcast channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

/// Dose budget configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DoseConfig {
    /// Maximum dose budget (MGy)
    #[serde(default = "default_maximum_dose_budget")]
    pub maximum_dose_budget: f64,
    /// Minimum intensity at the resolution edge at experiment end (%)
    #[serde(default = "default_decay_limit")]
    pub decay_limit: f64,
    /// Fraction of the budget spent on characterisation
    #[serde(default = "default_characterisation_budget_fraction")]
    pub characterisation_budget_fraction: f64,
}

/// Recentring policy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecentringConfig {
    #[serde(default)]
    pub default_mode: RecentringMode,
    /// Maximum orientation deviation (degrees) that reuses a centring
    #[serde(default = "default_angular_tolerance")]
    pub angular_tolerance: f64,
    /// Centre the first orientation physically before characterisation
    #[serde(default)]
    pub recentre_before_start: bool,
    /// Snapshots taken after each centring in `start` mode
    #[serde(default = "default_snapshot_count")]
    pub snapshot_count: u32,
    /// Goniostat rotation axes, in omega/kappa/phi order
    #[serde(default = "default_rotation_axes")]
    pub rotation_axes: [String; 3],
    /// Sample translation axes, in solver x/y/z order
    #[serde(default = "default_translation_axes")]
    pub translation_axes: [String; 3],
}

/// Acquisition defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    /// Interleaving wedge width (degrees)
    #[serde(default = "default_wedge_width")]
    pub default_wedge_width: f64,
    /// Image width when the strategy gives none (degrees)
    #[serde(default = "default_image_width")]
    pub default_image_width: f64,
    /// Exposure time per image (s)
    #[serde(default = "default_exposure_time")]
    pub default_exposure_time: f64,
    /// Compress unrolled repeated sweeps into one multi-trigger acquisition
    #[serde(default)]
    pub use_multitrigger: bool,
}

/// External geometry solver
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SolverConfig {
    /// Solver executable; no predictions are made when unset
    #[serde(default)]
    pub executable: Option<PathBuf>,
    /// Directory for the solver input file
    #[serde(default = "default_solver_working_dir")]
    pub working_dir: PathBuf,
    /// Environment the solver runs with
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Omega, kappa and phi axis directions, three components each
    #[serde(default = "default_gonio_axis_dirs")]
    pub gonio_axis_dirs: Vec<f64>,
    /// Three translation axis directions, three components each
    #[serde(default = "default_centring_axis_dirs")]
    pub centring_axis_dirs: Vec<f64>,
    /// Abandon the solver after this many seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Translational calibration of the goniostat
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TranslationalCalibration {
    pub home_position: [f64; 3],
    pub cross_sec_of_soc: [f64; 3],
}

// ============================================================================
// Default Values
// ============================================================================

fn default_log_level() -> String {
    "info".to_string()
}

fn default_beamline_config_dir() -> PathBuf {
    PathBuf::from("config/beamline")
}

fn default_event_capacity() -> usize {
    64
}

fn default_maximum_dose_budget() -> f64 {
    20.0
}

fn default_decay_limit() -> f64 {
    25.0
}

fn default_characterisation_budget_fraction() -> f64 {
    0.05
}

fn default_angular_tolerance() -> f64 {
    1.0
}

fn default_snapshot_count() -> u32 {
    2
}

fn default_rotation_axes() -> [String; 3] {
    ["omega".to_string(), "kappa".to_string(), "kappa_phi".to_string()]
}

fn default_translation_axes() -> [String; 3] {
    ["sampx".to_string(), "sampy".to_string(), "phiy".to_string()]
}

fn default_wedge_width() -> f64 {
    30.0
}

fn default_image_width() -> f64 {
    0.1
}

fn default_exposure_time() -> f64 {
    0.04
}

fn default_solver_working_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_gonio_axis_dirs() -> Vec<f64> {
    vec![1.0, 0.0, 0.0, 0.914, 0.279, -0.297, 1.0, 0.0, 0.0]
}

fn default_centring_axis_dirs() -> Vec<f64> {
    vec![0.0, 0.0, -1.0, 0.0, 1.0, 0.0, -1.0, 0.0, 0.0]
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logs: false,
            beamline_config_dir: default_beamline_config_dir(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl Default for DoseConfig {
    fn default() -> Self {
        Self {
            maximum_dose_budget: default_maximum_dose_budget(),
            decay_limit: default_decay_limit(),
            characterisation_budget_fraction: default_characterisation_budget_fraction(),
        }
    }
}

impl Default for RecentringConfig {
    fn default() -> Self {
        Self {
            default_mode: RecentringMode::default(),
            angular_tolerance: default_angular_tolerance(),
            recentre_before_start: false,
            snapshot_count: default_snapshot_count(),
            rotation_axes: default_rotation_axes(),
            translation_axes: default_translation_axes(),
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            default_wedge_width: default_wedge_width(),
            default_image_width: default_image_width(),
            default_exposure_time: default_exposure_time(),
            use_multitrigger: false,
        }
    }
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            executable: None,
            working_dir: default_solver_working_dir(),
            environment: BTreeMap::new(),
            gonio_axis_dirs: default_gonio_axis_dirs(),
            centring_axis_dirs: default_centring_axis_dirs(),
            timeout_secs: None,
        }
    }
}

impl DoseConfig {
    pub fn defaults(&self) -> DoseDefaults {
        DoseDefaults {
            maximum_dose_budget: self.maximum_dose_budget,
            decay_limit: self.decay_limit,
        }
    }
}

// ============================================================================
// Configuration Loading and Validation
// ============================================================================

impl WorkflowConfig {
    /// Load configuration from `config/workflow.toml` and environment variables
    ///
    /// Environment variables (`BEAMLINE_WF_` prefix) take precedence over the
    /// file, which takes precedence over built-in defaults. The result is
    /// validated.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config/workflow.toml")
    }

    /// Load configuration from a specific file path
    ///
    /// # Errors
    ///
    /// Returns a ConfigError if the file cannot be parsed or is invalid. A
    /// missing file is not an error; defaults apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config: Self = Figment::from(Serialized::defaults(WorkflowConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("BEAMLINE_WF_").split("__"))
            .extract()
            .map_err(|err| ConfigError::LoadError(Box::new(err)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration after loading
    ///
    /// # Errors
    ///
    /// Returns a ConfigError with a descriptive message for any validation failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        if self.application.event_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "event_capacity must be at least 1".to_string(),
            ));
        }

        if !(self.dose.maximum_dose_budget > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid maximum_dose_budget {}. Must be positive",
                self.dose.maximum_dose_budget
            )));
        }

        if !(self.dose.decay_limit > 0.0 && self.dose.decay_limit <= 100.0) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid decay_limit {}. Must be in (0, 100]",
                self.dose.decay_limit
            )));
        }

        let fraction = self.dose.characterisation_budget_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid characterisation_budget_fraction {}. Must be in (0, 1]",
                fraction
            )));
        }

        if !(self.recentring.angular_tolerance >= 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid angular_tolerance {}. Must not be negative",
                self.recentring.angular_tolerance
            )));
        }

        for (what, axes) in [
            ("rotation_axes", &self.recentring.rotation_axes),
            ("translation_axes", &self.recentring.translation_axes),
        ] {
            let mut names = std::collections::HashSet::new();
            for axis in axes {
                if axis.is_empty() || !names.insert(axis) {
                    return Err(ConfigError::ValidationError(format!(
                        "{} must be three distinct, non-empty names: {:?}",
                        what, axes
                    )));
                }
            }
        }

        for (what, value) in [
            ("default_wedge_width", self.acquisition.default_wedge_width),
            ("default_image_width", self.acquisition.default_image_width),
            ("default_exposure_time", self.acquisition.default_exposure_time),
        ] {
            if !(value > 0.0) {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid {} {}. Must be positive",
                    what, value
                )));
            }
        }

        if self.solver.executable.is_some() {
            for (what, dirs) in [
                ("gonio_axis_dirs", &self.solver.gonio_axis_dirs),
                ("centring_axis_dirs", &self.solver.centring_axis_dirs),
            ] {
                if dirs.len() != 9 {
                    return Err(ConfigError::ValidationError(format!(
                        "{} needs 9 components (three axes), got {}",
                        what,
                        dirs.len()
                    )));
                }
            }
        }

        if self.solver.timeout_secs == Some(0) {
            return Err(ConfigError::ValidationError(
                "solver timeout_secs must be positive when set".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_config_validation_valid() {
        let config = WorkflowConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dose.defaults(), DoseDefaults::default());
    }

    #[test]
    fn test_invalid_log_level() {
        let config = WorkflowConfig {
            application: ApplicationConfig {
                log_level: "verbose".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };

        let result = config.validate();
        assert!(result.is_err());
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("Invalid log_level"));
    }

    #[test]
    fn test_invalid_decay_limit() {
        let config = WorkflowConfig {
            dose: DoseConfig {
                decay_limit: 0.0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("decay_limit"));
    }

    #[test]
    fn test_duplicate_translation_axes() {
        let config = WorkflowConfig {
            recentring: RecentringConfig {
                translation_axes: ["sampx".to_string(), "sampx".to_string(), "phiy".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_solver_axis_dirs_checked_when_enabled() {
        let config = WorkflowConfig {
            solver: SolverConfig {
                executable: Some(PathBuf::from("/opt/solver/bin/recen")),
                gonio_axis_dirs: vec![1.0, 0.0, 0.0],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config
            .validate()
            .unwrap_err()
            .to_string()
            .contains("gonio_axis_dirs"));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[dose]
decay_limit = 50.0

[recentring]
default_mode = "start"
angular_tolerance = 0.5

[acquisition]
use_multitrigger = true

[transcal]
home_position = [0.1, 0.2, 0.3]
cross_sec_of_soc = [0.0, 0.01, 0.0]
"#
        )
        .unwrap();

        let config = WorkflowConfig::load_from(file.path()).unwrap();
        assert_eq!(config.dose.decay_limit, 50.0);
        assert_eq!(config.dose.maximum_dose_budget, 20.0);
        assert_eq!(config.recentring.default_mode, RecentringMode::Start);
        assert_eq!(config.recentring.angular_tolerance, 0.5);
        assert!(config.acquisition.use_multitrigger);
        assert_eq!(
            config.transcal.map(|t| t.home_position),
            Some([0.1, 0.2, 0.3])
        );
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[dose]\ncharacterisation_budget_fraction = 2.0").unwrap();
        assert!(matches!(
            WorkflowConfig::load_from(file.path()),
            Err(ConfigError::ValidationError(_))
        ));
    }
}
