//! Instrument tasks produced by the workflow.
//!
//! The controller never drives motors or the detector itself. It builds
//! [`CentringTask`]s and [`AcquisitionTask`]s, collects them in the session's
//! single open [`TaskGroup`] and hands the group to a
//! [`TaskExecutor`](crate::beamline::TaskExecutor).

use crate::model::AxisSettings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Where and under what name the images of one acquisition are written.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PathTemplate {
    pub directory: PathBuf,
    pub process_directory: PathBuf,
    pub archive_directory: PathBuf,
    pub base_prefix: String,
    pub run_number: u32,
    pub start_num: u32,
    pub num_files: u32,
}

impl PathTemplate {
    /// File name prefix, `<base_prefix>_<run_number>`.
    pub fn prefix(&self) -> String {
        format!("{}_{}", self.base_prefix, self.run_number)
    }
}

/// Acquisition settings for one scan.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionParameters {
    pub first_image: u32,
    pub num_images: u32,
    pub osc_start: f64,
    pub osc_range: f64,
    pub exp_time: f64,
    pub num_passes: u32,
    /// Photon energy, keV
    pub energy: f64,
    pub detector_distance: f64,
    pub inverse_beam: bool,
    pub take_snapshots: u32,
    /// Precomputed centred position; `None` when an in-queue centring
    /// precedes the acquisition
    pub centred_position: Option<AxisSettings>,
    pub num_triggers: Option<u32>,
    pub num_images_per_trigger: Option<u32>,
    pub overlap: Option<f64>,
}

/// A data collection for one scan (or one compressed multi-trigger sweep).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionTask {
    pub name: String,
    pub parameters: AcquisitionParameters,
    pub path_template: PathTemplate,
    /// Executed as part of the group run rather than immediately
    pub in_queue: bool,
}

/// A sample centring at the given motor positions.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CentringTask {
    pub label: String,
    pub motor_settings: AxisSettings,
    pub in_queue: bool,
}

impl CentringTask {
    /// Labels the task with the positions of `label_axes`.
    pub fn new(motor_settings: AxisSettings, label_axes: &[String], in_queue: bool) -> Self {
        let angles: Vec<String> = label_axes
            .iter()
            .map(|axis| {
                let angle = motor_settings.get(axis).copied().unwrap_or(0.0);
                format!("{}={:.1}", axis, angle)
            })
            .collect();
        let label = format!("Centring ({})", angles.join(","));
        Self {
            label,
            motor_settings,
            in_queue,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueuedTask {
    Centring(CentringTask),
    Acquisition(AcquisitionTask),
}

impl QueuedTask {
    pub fn name(&self) -> &str {
        match self {
            QueuedTask::Centring(task) => &task.label,
            QueuedTask::Acquisition(task) => &task.name,
        }
    }
}

/// A task with its position in the group.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GroupEntry {
    pub sequence: u32,
    pub task: QueuedTask,
}

/// Named, numbered container of tasks executed as one unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub name: String,
    pub number: u32,
    entries: Vec<GroupEntry>,
    next_sequence: u32,
}

impl TaskGroup {
    pub fn new(name: impl Into<String>, number: u32) -> Self {
        Self {
            name: name.into(),
            number,
            entries: Vec::new(),
            next_sequence: 1,
        }
    }

    /// Appends a task and returns its sequence number.
    pub fn push(&mut self, task: QueuedTask) -> u32 {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.push(GroupEntry { sequence, task });
        sequence
    }

    pub fn entries(&self) -> &[GroupEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn acquisitions(&self) -> impl Iterator<Item = &AcquisitionTask> {
        self.entries.iter().filter_map(|entry| match &entry.task {
            QueuedTask::Acquisition(task) => Some(task),
            QueuedTask::Centring(_) => None,
        })
    }

    pub fn centrings(&self) -> impl Iterator<Item = &CentringTask> {
        self.entries.iter().filter_map(|entry| match &entry.task {
            QueuedTask::Centring(task) => Some(task),
            QueuedTask::Acquisition(_) => None,
        })
    }

    /// Summed exposure time of all acquisitions in the group (s).
    pub fn total_exposure_time(&self) -> f64 {
        self.acquisitions()
            .map(|task| task.parameters.exp_time * f64::from(task.parameters.num_images))
            .sum()
    }
}
