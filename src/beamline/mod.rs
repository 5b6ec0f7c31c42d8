//! Collaborator interfaces to the beamline control system.
//!
//! The workflow reaches hardware, the task queue and the operator only
//! through these traits. A mock implementation of each lives in [`mock`].

pub mod mock;

use crate::dose::ExposureLimits;
use crate::error::{AppResult, TaskError};
use crate::model::AxisSettings;
use crate::parameter::{ParameterRequest, ParameterValues, UserInput};
use crate::tasks::{CentringTask, TaskGroup};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::sync::oneshot;

/// Goniostat, beam and detector of the beamline.
#[async_trait]
pub trait Beamline: Send + Sync {
    /// Current position of every goniostat motor, rotations and translations.
    async fn goniostat_positions(&self) -> AppResult<AxisSettings>;

    /// Rotates omega by `delta` degrees.
    async fn move_omega_relative(&self, delta: f64) -> AppResult<()>;

    async fn resolution(&self) -> AppResult<f64>;

    async fn set_resolution(&self, resolution: f64) -> AppResult<()>;

    async fn wavelength(&self) -> AppResult<f64>;

    /// Sets beam transmission, percent.
    async fn set_transmission(&self, transmission: f64) -> AppResult<()>;

    /// Predefined zoom positions in increasing magnification, or `None`
    /// when the sample view has no motorised zoom.
    fn zoom_presets(&self) -> Option<Vec<String>>;

    async fn move_zoom(&self, preset: &str) -> AppResult<()>;

    /// Saves a sample view snapshot to `path`.
    async fn take_snapshot(&self, path: &Path) -> AppResult<()>;

    fn exposure_time_limits(&self) -> ExposureLimits;

    /// Dose rate at 100 % transmission, MGy/s.
    fn standard_dose_rate(&self) -> f64;

    fn base_image_directory(&self) -> PathBuf;

    fn base_process_directory(&self) -> PathBuf;

    fn archive_directory(&self) -> PathBuf;
}

/// The beamline task queue.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Runs a centring now. Returns the centred motor positions, or `None`
    /// when the centring finished without a result.
    async fn execute_centring(&self, task: &CentringTask) -> Result<Option<AxisSettings>, TaskError>;

    /// Runs every task of the group in order.
    async fn execute_group(&self, group: &TaskGroup) -> Result<(), TaskError>;
}

/// Source of operator parameters.
pub trait ParameterProvider: Send + Sync {
    /// Posts a request; the reply arrives on the returned receiver.
    fn request_parameters(
        &self,
        request: ParameterRequest,
    ) -> oneshot::Receiver<UserInput<ParameterValues>>;
}
