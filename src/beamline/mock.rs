//! Mock beamline, task queue and operator.
//!
//! Used by the emulation binary and the tests. Hardware calls update an
//! in-memory state and are recorded so callers can inspect what the workflow
//! asked for.
use super::{Beamline, ParameterProvider, TaskExecutor};
use crate::dose::ExposureLimits;
use crate::error::{AppResult, TaskError};
use crate::model::AxisSettings;
use crate::parameter::{ParameterRequest, ParameterValues, UserInput};
use crate::tasks::{CentringTask, TaskGroup};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::info;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct BeamlineState {
    positions: AxisSettings,
    resolution: f64,
    wavelength: f64,
    transmission: f64,
    zoom: Option<String>,
    omega_moves: Vec<f64>,
    snapshots: Vec<PathBuf>,
}

/// In-memory beamline.
#[derive(Debug)]
pub struct MockBeamline {
    state: Mutex<BeamlineState>,
    root: PathBuf,
    zoom_presets: Option<Vec<String>>,
    exposure_limits: ExposureLimits,
    dose_rate: f64,
}

impl MockBeamline {
    /// A beamline whose image, process and archive directories live under `root`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let positions = AxisSettings::from([
            ("omega".to_string(), 0.0),
            ("kappa".to_string(), 0.0),
            ("kappa_phi".to_string(), 0.0),
            ("sampx".to_string(), 0.0),
            ("sampy".to_string(), 0.0),
            ("phiy".to_string(), 0.0),
        ]);
        Self {
            state: Mutex::new(BeamlineState {
                positions,
                resolution: 2.0,
                wavelength: 0.9795,
                transmission: 100.0,
                zoom: None,
                omega_moves: Vec::new(),
                snapshots: Vec::new(),
            }),
            root: root.into(),
            zoom_presets: Some(vec!["Zoom 1".to_string(), "Zoom 4".to_string(), "Zoom 8".to_string()]),
            exposure_limits: ExposureLimits {
                min: Some(0.001),
                max: Some(10.0),
            },
            dose_rate: 0.1,
        }
    }

    pub fn with_positions(self, positions: AxisSettings) -> Self {
        lock(&self.state).positions.extend(positions);
        self
    }

    pub fn with_zoom_presets(mut self, presets: Option<Vec<String>>) -> Self {
        self.zoom_presets = presets;
        self
    }

    pub fn with_exposure_limits(mut self, limits: ExposureLimits) -> Self {
        self.exposure_limits = limits;
        self
    }

    pub fn with_dose_rate(mut self, dose_rate: f64) -> Self {
        self.dose_rate = dose_rate;
        self
    }

    pub fn with_resolution(self, resolution: f64) -> Self {
        lock(&self.state).resolution = resolution;
        self
    }

    /// Moves motors, as a completed centring would.
    pub fn set_positions(&self, positions: &AxisSettings) {
        lock(&self.state).positions.extend(positions.clone());
    }

    pub fn positions(&self) -> AxisSettings {
        lock(&self.state).positions.clone()
    }

    pub fn transmission(&self) -> f64 {
        lock(&self.state).transmission
    }

    pub fn current_zoom(&self) -> Option<String> {
        lock(&self.state).zoom.clone()
    }

    pub fn omega_moves(&self) -> Vec<f64> {
        lock(&self.state).omega_moves.clone()
    }

    pub fn snapshots(&self) -> Vec<PathBuf> {
        lock(&self.state).snapshots.clone()
    }
}

#[async_trait]
impl Beamline for MockBeamline {
    async fn goniostat_positions(&self) -> AppResult<AxisSettings> {
        Ok(self.positions())
    }

    async fn move_omega_relative(&self, delta: f64) -> AppResult<()> {
        let mut state = lock(&self.state);
        *state.positions.entry("omega".to_string()).or_insert(0.0) += delta;
        state.omega_moves.push(delta);
        Ok(())
    }

    async fn resolution(&self) -> AppResult<f64> {
        Ok(lock(&self.state).resolution)
    }

    async fn set_resolution(&self, resolution: f64) -> AppResult<()> {
        lock(&self.state).resolution = resolution;
        Ok(())
    }

    async fn wavelength(&self) -> AppResult<f64> {
        Ok(lock(&self.state).wavelength)
    }

    async fn set_transmission(&self, transmission: f64) -> AppResult<()> {
        lock(&self.state).transmission = transmission;
        Ok(())
    }

    fn zoom_presets(&self) -> Option<Vec<String>> {
        self.zoom_presets.clone()
    }

    async fn move_zoom(&self, preset: &str) -> AppResult<()> {
        lock(&self.state).zoom = Some(preset.to_string());
        Ok(())
    }

    async fn take_snapshot(&self, path: &Path) -> AppResult<()> {
        lock(&self.state).snapshots.push(path.to_path_buf());
        Ok(())
    }

    fn exposure_time_limits(&self) -> ExposureLimits {
        self.exposure_limits
    }

    fn standard_dose_rate(&self) -> f64 {
        self.dose_rate
    }

    fn base_image_directory(&self) -> PathBuf {
        self.root.join("RAW_DATA")
    }

    fn base_process_directory(&self) -> PathBuf {
        self.root.join("PROCESSED_DATA")
    }

    fn archive_directory(&self) -> PathBuf {
        self.root.join("ARCHIVE")
    }
}

#[derive(Debug, Default)]
struct ExecutorState {
    centring_results: VecDeque<Result<Option<AxisSettings>, TaskError>>,
    fail_groups: bool,
    centrings: Vec<CentringTask>,
    groups: Vec<TaskGroup>,
}

/// Task queue that completes every task at once.
///
/// Centrings succeed at the requested motor positions unless a result was
/// scripted with [`MockExecutor::push_centring_result`].
#[derive(Debug)]
pub struct MockExecutor {
    beamline: Arc<MockBeamline>,
    state: Mutex<ExecutorState>,
}

impl MockExecutor {
    pub fn new(beamline: Arc<MockBeamline>) -> Self {
        Self {
            beamline,
            state: Mutex::new(ExecutorState::default()),
        }
    }

    pub fn push_centring_result(&self, result: Result<Option<AxisSettings>, TaskError>) {
        lock(&self.state).centring_results.push_back(result);
    }

    pub fn fail_groups(&self, fail: bool) {
        lock(&self.state).fail_groups = fail;
    }

    pub fn centrings(&self) -> Vec<CentringTask> {
        lock(&self.state).centrings.clone()
    }

    pub fn groups(&self) -> Vec<TaskGroup> {
        lock(&self.state).groups.clone()
    }
}

#[async_trait]
impl TaskExecutor for MockExecutor {
    async fn execute_centring(&self, task: &CentringTask) -> Result<Option<AxisSettings>, TaskError> {
        let scripted = {
            let mut state = lock(&self.state);
            state.centrings.push(task.clone());
            state.centring_results.pop_front()
        };
        let result = match scripted {
            Some(result) => result?,
            None => {
                self.beamline.set_positions(&task.motor_settings);
                Some(self.beamline.positions())
            }
        };
        info!(task = %task.label, centred = result.is_some(), "Mock centring finished");
        Ok(result)
    }

    async fn execute_group(&self, group: &TaskGroup) -> Result<(), TaskError> {
        let fail = {
            let mut state = lock(&self.state);
            state.groups.push(group.clone());
            state.fail_groups
        };
        if fail {
            return Err(TaskError::Failed {
                name: group.name.clone(),
                reason: "mock failure".to_string(),
            });
        }
        info!(group = %group.name, number = group.number, tasks = group.len(), "Mock group executed");
        Ok(())
    }
}

/// Operator that replays scripted answers, then accepts defaults.
#[derive(Debug, Default)]
pub struct MockParameterProvider {
    responses: Mutex<VecDeque<UserInput<ParameterValues>>>,
    requests: Mutex<Vec<ParameterRequest>>,
}

impl MockParameterProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_response(&self, response: UserInput<ParameterValues>) {
        lock(&self.responses).push_back(response);
    }

    pub fn requests(&self) -> Vec<ParameterRequest> {
        lock(&self.requests).clone()
    }
}

impl ParameterProvider for MockParameterProvider {
    fn request_parameters(
        &self,
        request: ParameterRequest,
    ) -> oneshot::Receiver<UserInput<ParameterValues>> {
        let (tx, rx) = oneshot::channel();
        let response = lock(&self.responses)
            .pop_front()
            .unwrap_or_else(|| UserInput::Value(request.defaults.clone()));
        lock(&self.requests).push(request);
        let _ = tx.send(response);
        rx
    }
}
