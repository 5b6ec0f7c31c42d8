//! Per-workflow session state.
//!
//! A [`WorkflowSession`] is created when a workflow starts and torn down when
//! it finishes. It is owned by the controller task and handed to components by
//! `&mut`, so none of it is shared or locked.

use crate::error::{AppResult, WorkflowError};
use crate::model::{GoniostatTranslation, RotationId, UnitCell};
use crate::parameter::ParameterValues;
use crate::tasks::{PathTemplate, TaskGroup};
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use uuid::Uuid;

/// Controller state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkflowState {
    Ready,
    Busy,
    Completed,
    Aborted,
    Fault,
    /// Inbound queue closed without a stop sentinel
    Unknown,
}

impl fmt::Display for WorkflowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowState::Ready => "READY",
            WorkflowState::Busy => "BUSY",
            WorkflowState::Completed => "COMPLETED",
            WorkflowState::Aborted => "ABORTED",
            WorkflowState::Fault => "FAULT",
            WorkflowState::Unknown => "UNKNOWN",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatingMode {
    /// Parameters are requested from an operator
    #[default]
    Interactive,
    /// Parameters come from pre-supplied automation parameter sets
    Automation,
}

/// When the sample is physically recentred.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecentringMode {
    /// When the orientation changes between sweeps
    #[default]
    Sweep,
    /// Before every scan
    Scan,
    /// All orientations up front, before acquisition
    Start,
    /// Never; rely on computed translations
    None,
}

impl RecentringMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RecentringMode::Sweep => "sweep",
            RecentringMode::Scan => "scan",
            RecentringMode::Start => "start",
            RecentringMode::None => "none",
        }
    }
}

impl FromStr for RecentringMode {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sweep" => Ok(RecentringMode::Sweep),
            "scan" => Ok(RecentringMode::Scan),
            "start" => Ok(RecentringMode::Start),
            "none" => Ok(RecentringMode::None),
            other => Err(WorkflowError::Validation(format!(
                "unknown recentring mode '{}'",
                other
            ))),
        }
    }
}

/// Which workflow is running.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkflowKind {
    /// Characterisation followed by acquisition
    #[default]
    Acquisition,
    /// Diffractometer calibration
    DiffractCal,
    /// Translational calibration
    TransCal,
}

/// Sample description supplied at workflow start.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleInfo {
    pub name: String,
    #[serde(default)]
    pub lattices: Vec<String>,
    #[serde(default)]
    pub crystal_family_char: Option<char>,
    #[serde(default)]
    pub cell: Option<UnitCell>,
    #[serde(default)]
    pub space_group: Option<String>,
    #[serde(default)]
    pub aimed_resolution: Option<f64>,
    #[serde(default = "default_sensitivity")]
    pub relative_rad_sensitivity: f64,
}

fn default_sensitivity() -> f64 {
    1.0
}

impl SampleInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            lattices: Vec::new(),
            crystal_family_char: None,
            cell: None,
            space_group: None,
            aimed_resolution: None,
            relative_rad_sensitivity: default_sensitivity(),
        }
    }
}

/// Mutable state of one running workflow.
#[derive(Debug)]
pub struct WorkflowSession {
    pub id: Uuid,
    pub kind: WorkflowKind,
    pub mode: OperatingMode,
    pub sample: SampleInfo,
    pub characterisation_done: bool,
    pub current_rotation_id: Option<RotationId>,
    pub recentring_mode: RecentringMode,
    pub snapshot_count: u32,
    /// Total scan range of the current plan, over all wavelengths
    pub strategy_length: f64,
    pub exposure_time: f64,
    pub image_width: f64,
    /// Beam transmission, percent
    pub transmission: f64,
    pub wavelengths: Vec<f64>,
    /// Operator or automation overrides of the configured dose limits
    pub decay_limit: Option<f64>,
    pub maximum_dose_budget: Option<f64>,
    pub path_template: PathTemplate,
    /// Characterisation images already collected and processed elsewhere
    pub init_spot_dir: Option<PathBuf>,
    pub use_cell_for_processing: bool,
    pub goniostat_translations: Vec<GoniostatTranslation>,
    /// Parameter sets used in automation mode: the first before
    /// characterisation, the last before acquisition
    pub automation_parameters: Vec<ParameterValues>,
    characterisation_dose: f64,
    acquisition_dose: f64,
    fine_zoom: bool,
    subprocess_names: HashMap<String, String>,
    open_group: Option<TaskGroup>,
    group_counters: HashMap<String, u32>,
}

impl WorkflowSession {
    pub fn new(kind: WorkflowKind, mode: OperatingMode, sample: SampleInfo) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            mode,
            sample,
            characterisation_done: false,
            current_rotation_id: None,
            recentring_mode: RecentringMode::default(),
            snapshot_count: 0,
            strategy_length: 0.0,
            exposure_time: 0.0,
            image_width: 0.0,
            transmission: 100.0,
            wavelengths: Vec::new(),
            decay_limit: None,
            maximum_dose_budget: None,
            path_template: PathTemplate::default(),
            init_spot_dir: None,
            use_cell_for_processing: false,
            goniostat_translations: Vec::new(),
            automation_parameters: Vec::new(),
            characterisation_dose: 0.0,
            acquisition_dose: 0.0,
            fine_zoom: false,
            subprocess_names: HashMap::new(),
            open_group: None,
            group_counters: HashMap::new(),
        }
    }

    /// True while collecting characterisation data.
    pub fn in_characterisation(&self) -> bool {
        !self.characterisation_done && self.kind != WorkflowKind::DiffractCal
    }

    pub fn characterisation_dose(&self) -> f64 {
        self.characterisation_dose
    }

    pub fn acquisition_dose(&self) -> f64 {
        self.acquisition_dose
    }

    pub fn total_dose(&self) -> f64 {
        self.characterisation_dose + self.acquisition_dose
    }

    /// Adds dose to the accumulator of the current phase.
    pub fn record_dose(&mut self, dose: f64) -> AppResult<()> {
        if !(dose >= 0.0) {
            return Err(WorkflowError::Validation(format!(
                "accumulated dose cannot decrease (got {})",
                dose
            )));
        }
        if self.in_characterisation() {
            self.characterisation_dose += dose;
        } else {
            self.acquisition_dose += dose;
        }
        Ok(())
    }

    /// Next number for a group of the given name, starting at 1.
    pub fn next_number_for_name(&mut self, name: &str) -> u32 {
        let counter = self.group_counters.entry(name.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    /// Opens a new group, replacing any group still open.
    pub fn open_group(&mut self, name: &str) -> &mut TaskGroup {
        let number = self.next_number_for_name(name);
        self.open_group.insert(TaskGroup::new(name, number))
    }

    pub fn current_group(&self) -> Option<&TaskGroup> {
        self.open_group.as_ref()
    }

    /// Removes and returns the open group.
    pub fn take_group(&mut self) -> Option<TaskGroup> {
        self.open_group.take()
    }

    /// Name of the group for a data collection in the current phase.
    pub fn collection_group_name(&self) -> &'static str {
        if self.characterisation_done {
            "Data collection"
        } else if self.kind == WorkflowKind::DiffractCal {
            "Diffraction calibration"
        } else {
            "Characterisation"
        }
    }

    /// Switches fine zoom on; returns true only on the first call.
    pub fn activate_fine_zoom(&mut self) -> bool {
        !std::mem::replace(&mut self.fine_zoom, true)
    }

    pub fn fine_zoom_active(&self) -> bool {
        self.fine_zoom
    }

    /// Tracks a subprocess under `correlation_id`. Returns false, keeping the
    /// first name, when the id is still open.
    pub fn subprocess_started(&mut self, correlation_id: &str, name: &str) -> bool {
        match self.subprocess_names.entry(correlation_id.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(name.to_string());
                true
            }
        }
    }

    /// Untracks a subprocess, returning its name if it was tracked.
    pub fn subprocess_stopped(&mut self, correlation_id: &str) -> Option<String> {
        self.subprocess_names.remove(correlation_id)
    }

    pub fn subprocess_name(&self, correlation_id: &str) -> Option<&str> {
        self.subprocess_names.get(correlation_id).map(String::as_str)
    }

    pub fn subprocess_count(&self) -> usize {
        self.subprocess_names.len()
    }

    /// Releases per-run resources at teardown.
    pub fn clear(&mut self) {
        self.open_group = None;
        self.subprocess_names.clear();
    }
}
