//! Recentring policy.
//!
//! Before acquisition the strategy engine needs a goniostat translation for
//! every distinct orientation in its plan. [`RecentringPolicyEngine`] decides,
//! per orientation, whether to centre the sample physically, reuse the current
//! centring, or predict the translation with a [`GeometrySolver`], depending
//! on the session's [`RecentringMode`].

pub mod solver;

pub use solver::{
    parse_solver_output, GeometrySolver, RecenSolver, SolverError, TranslationRequest,
};

use crate::beamline::{Beamline, TaskExecutor};
use crate::config::{RecentringConfig, TranslationalCalibration};
use crate::error::{AppResult, WorkflowError};
use crate::messages::WorkflowEvent;
use crate::model::{AxisSettings, GeometricStrategy, GoniostatTranslation, RotationId, SweepSetting};
use crate::session::{RecentringMode, WorkflowKind, WorkflowSession};
use crate::tasks::CentringTask;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Tolerance (degrees) for reusing the current centring when no predicted
/// translation is available.
pub const UNCALIBRATED_TOLERANCE: f64 = 0.1;

/// Reference geometry handed to the solver.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RecentringParameters {
    pub home_position: [f64; 3],
    pub cross_sec_of_soc: [f64; 3],
    /// Orientation of the reference centring
    pub ref_okp: [f64; 3],
    /// Translation of the reference centring
    pub ref_xyz: [f64; 3],
}

impl RecentringParameters {
    pub fn new(calibration: &TranslationalCalibration, ref_okp: [f64; 3], ref_xyz: [f64; 3]) -> Self {
        Self {
            home_position: calibration.home_position,
            cross_sec_of_soc: calibration.cross_sec_of_soc,
            ref_okp,
            ref_xyz,
        }
    }

    pub fn request(&self, okp: [f64; 3]) -> TranslationRequest {
        TranslationRequest {
            okp,
            ref_okp: self.ref_okp,
            ref_xyz: self.ref_xyz,
            home_position: self.home_position,
            cross_sec_of_soc: self.cross_sec_of_soc,
        }
    }
}

/// Largest kappa or phi difference between two orientations. Omega is the
/// scan axis and does not count.
pub fn max_deviation(a: &[f64; 3], b: &[f64; 3]) -> f64 {
    (a[1] - b[1]).abs().max((a[2] - b[2]).abs())
}

pub struct RecentringPolicyEngine<'a> {
    config: &'a RecentringConfig,
    beamline: &'a dyn Beamline,
    executor: &'a dyn TaskExecutor,
    solver: Option<&'a dyn GeometrySolver>,
    events: &'a broadcast::Sender<WorkflowEvent>,
}

impl<'a> RecentringPolicyEngine<'a> {
    pub fn new(
        config: &'a RecentringConfig,
        beamline: &'a dyn Beamline,
        executor: &'a dyn TaskExecutor,
        solver: Option<&'a dyn GeometrySolver>,
        events: &'a broadcast::Sender<WorkflowEvent>,
    ) -> Self {
        Self {
            config,
            beamline,
            executor,
            solver,
            events,
        }
    }

    /// Omega/kappa/phi of a set of motor positions.
    pub fn orientation_of(&self, positions: &AxisSettings) -> [f64; 3] {
        let axes = &self.config.rotation_axes;
        [0, 1, 2].map(|i| positions.get(&axes[i]).copied().unwrap_or(0.0))
    }

    /// Translation axis positions of a set of motor positions.
    pub fn translation_of(&self, positions: &AxisSettings) -> AxisSettings {
        self.config
            .translation_axes
            .iter()
            .filter_map(|axis| positions.get(axis).map(|value| (axis.clone(), *value)))
            .collect()
    }

    fn xyz_of(&self, positions: &AxisSettings) -> [f64; 3] {
        let axes = &self.config.translation_axes;
        [0, 1, 2].map(|i| positions.get(&axes[i]).copied().unwrap_or(0.0))
    }

    /// Predicted translation at `okp`, `None` when the solver is missing or
    /// failed. Failures are logged, not raised.
    pub async fn predict(&self, okp: [f64; 3], params: &RecentringParameters) -> Option<AxisSettings> {
        let solver = self.solver?;
        match solver.predict_translation(&params.request(okp)).await {
            Ok(xyz) => {
                let translation: AxisSettings = self
                    .config
                    .translation_axes
                    .iter()
                    .cloned()
                    .zip(xyz)
                    .collect();
                debug!(?okp, ?translation, "Predicted translation");
                Some(translation)
            }
            Err(err) => {
                warn!(?okp, "Geometry solver failed: {}", err);
                None
            }
        }
    }

    /// Centres the sample now at `motor_settings`.
    ///
    /// Returns the translation for `rotation_id` and the full centred
    /// position. A failed or empty centring is
    /// [`WorkflowError::CentringFailed`].
    pub async fn centre(
        &self,
        motor_settings: AxisSettings,
        rotation_id: RotationId,
        requested_rotation_id: Option<RotationId>,
    ) -> AppResult<(GoniostatTranslation, AxisSettings)> {
        let task = CentringTask::new(motor_settings, &self.config.rotation_axes[1..], false);
        info!(task = %task.label, "Centring sample");
        let result = match self.executor.execute_centring(&task).await {
            Ok(result) => result,
            Err(err) => {
                warn!(task = %task.label, "Centring task failed: {}", err);
                let _ = self.events.send(WorkflowEvent::QueueExecutionFailed {
                    task: task.label.clone(),
                    reason: err.to_string(),
                });
                None
            }
        };
        let positions = result.ok_or(WorkflowError::CentringFailed)?;
        let axis_settings = self.translation_of(&positions);
        if axis_settings.len() != self.config.translation_axes.len() {
            return Err(WorkflowError::CentringFailed);
        }
        let mut translation = GoniostatTranslation::new(rotation_id, axis_settings);
        translation.requested_rotation_id = requested_rotation_id;
        Ok((translation, positions))
    }

    /// Takes the session's quota of centring snapshots, rotating omega by 90
    /// degrees between shots and back again afterwards.
    pub async fn collect_snapshots(
        &self,
        session: &WorkflowSession,
        prefix: &str,
    ) -> AppResult<Vec<PathBuf>> {
        let count = session.snapshot_count;
        if count == 0 {
            return Ok(Vec::new());
        }
        info!("Post-centring: taking {} sample snapshot(s)", count);
        let directory = session
            .path_template
            .archive_directory
            .join("centring_snapshots");
        let timestamp = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S");

        let mut paths = Vec::new();
        let mut summed_angle = 0.0;
        let mut failure = None;
        for index in 0..count {
            if index > 0 {
                if let Err(err) = self.beamline.move_omega_relative(90.0).await {
                    failure = Some(err);
                    break;
                }
                summed_angle += 90.0;
            }
            let path = directory.join(format!("{}_{}_{}.jpeg", prefix, timestamp, index + 1));
            debug!(path = %path.display(), "Centring snapshot");
            if let Err(err) = self.beamline.take_snapshot(&path).await {
                failure = Some(err);
                break;
            }
            paths.push(path);
        }
        if summed_angle != 0.0 {
            self.beamline.move_omega_relative(-summed_angle).await?;
        }
        match failure {
            Some(err) => Err(err),
            None => Ok(paths),
        }
    }

    async fn snapshots_at(&self, session: &WorkflowSession, motor_settings: &AxisSettings) -> AppResult<()> {
        let okp = self.orientation_of(motor_settings);
        // Whole degrees keep the file names short
        let prefix = format!("{}_{}_{}", okp[0] as i64, okp[1] as i64, okp[2] as i64);
        self.collect_snapshots(session, &prefix).await?;
        Ok(())
    }

    /// Translations for every distinct orientation of `strategy`, in plan
    /// order (reversed for mode `start`), applying the session's recentring
    /// mode. Updates the session's current rotation as the sample moves.
    pub async fn plan_translations(
        &self,
        session: &mut WorkflowSession,
        strategy: &GeometricStrategy,
        calibration: Option<&TranslationalCalibration>,
    ) -> AppResult<Vec<GoniostatTranslation>> {
        let mode = session.recentring_mode;
        let mut settings: Vec<&SweepSetting> = strategy.distinct_settings();
        if mode == RecentringMode::Start {
            settings.reverse();
        }
        let Some((&first, rest)) = settings.split_first() else {
            return Err(WorkflowError::Validation(
                "geometric strategy has no sweeps".to_string(),
            ));
        };

        let initial_positions = self.beamline.goniostat_positions().await?;
        let mut translations = Vec::new();

        let current_positions = if self.config.recentre_before_start && !session.characterisation_done {
            // Never reliably centred: centre at the first orientation
            let (translation, positions) =
                self.centre(first.axis_settings.clone(), first.id, None).await?;
            translations.push(translation);
            session.current_rotation_id = Some(first.id);
            positions
        } else {
            initial_positions.clone()
        };
        let current_okp = self.orientation_of(&current_positions);
        let current_translation = self.translation_of(&current_positions);

        let params = match (calibration, self.solver) {
            (Some(calibration), Some(_)) => {
                let params = RecentringParameters::new(
                    calibration,
                    current_okp,
                    self.xyz_of(&current_positions),
                );
                debug!(?params, "Recentring reference set from current position");
                Some(params)
            }
            _ => None,
        };

        if !translations.is_empty() {
            // Centred above
        } else if session.characterisation_done || session.kind == WorkflowKind::DiffractCal {
            // Already centred; reuse, predict or recentre at the first orientation
            let okp = first.orientation(&self.config.rotation_axes);
            let maxdev = max_deviation(&okp, &current_okp);
            let predicted = match &params {
                Some(params) => self.predict(okp, params).await,
                None => None,
            };
            let (tolerance, translation_settings) = match &predicted {
                Some(predicted) => (self.config.angular_tolerance, predicted.clone()),
                None => (UNCALIBRATED_TOLERANCE, current_translation.clone()),
            };

            if maxdev <= tolerance {
                translations.push(GoniostatTranslation::new(first.id, translation_settings));
                session.current_rotation_id = Some(first.id);
            } else if mode == RecentringMode::None {
                match predicted {
                    Some(predicted) => {
                        translations.push(GoniostatTranslation::new(first.id, predicted))
                    }
                    None => return Err(self.no_translation_error(params.is_some())),
                }
            } else {
                let mut motor_settings = first.axis_settings.clone();
                motor_settings.extend(translation_settings);
                let (translation, _) = self.centre(motor_settings.clone(), first.id, None).await?;
                translations.push(translation);
                session.current_rotation_id = Some(first.id);
                if mode == RecentringMode::Start {
                    self.snapshots_at(session, &motor_settings).await?;
                }
            }
        } else {
            // Characterisation of a pre-centred sample: use the current
            // orientation rather than the planned one
            let rotation_settings: AxisSettings = first
                .axis_settings
                .keys()
                .map(|axis| (axis.clone(), current_positions.get(axis).copied().unwrap_or(0.0)))
                .collect();
            let rotation_id = Uuid::new_v4();
            translations.push(GoniostatTranslation {
                rotation_id,
                requested_rotation_id: Some(first.id),
                rotation_settings: Some(rotation_settings),
                axis_settings: current_translation.clone(),
            });
            session.current_rotation_id = Some(rotation_id);
        }

        for setting in rest {
            let mut motor_settings = setting.axis_settings.clone();
            let predicted = match &params {
                Some(params) => {
                    self.predict(setting.orientation(&self.config.rotation_axes), params)
                        .await
                }
                None => None,
            };
            if let Some(predicted) = &predicted {
                motor_settings.extend(predicted.clone());
            }

            match (mode, predicted) {
                (RecentringMode::Start, _) => {
                    let (translation, _) =
                        self.centre(motor_settings.clone(), setting.id, None).await?;
                    translations.push(translation);
                    session.current_rotation_id = Some(setting.id);
                    self.snapshots_at(session, &motor_settings).await?;
                }
                (_, Some(predicted)) => {
                    translations.push(GoniostatTranslation::new(setting.id, predicted));
                }
                (RecentringMode::None, None) => {
                    return Err(self.no_translation_error(params.is_some()));
                }
                (_, None) if params.is_some() => {
                    // Solver failed; the mode allows moving, so centre now
                    let (translation, _) = self.centre(motor_settings, setting.id, None).await?;
                    translations.push(translation);
                    session.current_rotation_id = Some(setting.id);
                }
                (_, None) => {
                    // Nothing better known: the position before this plan
                    translations.push(GoniostatTranslation::new(
                        setting.id,
                        self.translation_of(&initial_positions),
                    ));
                }
            }
        }

        Ok(translations)
    }

    fn no_translation_error(&self, solver_available: bool) -> WorkflowError {
        if solver_available {
            WorkflowError::CentringFailed
        } else {
            WorkflowError::Configuration(
                "recentring mode 'none' needs a translational calibration and a geometry solver"
                    .to_string(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beamline::mock::{MockBeamline, MockExecutor};
    use crate::error::TaskError;
    use crate::model::{BeamSetting, DetectorSetting, StrategyMetadata, Sweep};
    use crate::session::{OperatingMode, SampleInfo};
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Translation depends linearly on kappa and phi.
    struct FakeSolver {
        fail: bool,
    }

    #[async_trait]
    impl GeometrySolver for FakeSolver {
        async fn predict_translation(
            &self,
            request: &TranslationRequest,
        ) -> Result<[f64; 3], SolverError> {
            if self.fail {
                return Err(SolverError::NoNormalTermination);
            }
            Ok([
                request.ref_xyz[0] + 0.01 * request.okp[1],
                request.ref_xyz[1] + 0.01 * request.okp[2],
                request.ref_xyz[2],
            ])
        }
    }

    struct Fixture {
        config: RecentringConfig,
        beamline: Arc<MockBeamline>,
        executor: MockExecutor,
        events: broadcast::Sender<WorkflowEvent>,
    }

    impl Fixture {
        fn new() -> Self {
            let beamline = Arc::new(MockBeamline::new("/data").with_positions(AxisSettings::from([
                ("sampx".to_string(), 0.1),
                ("sampy".to_string(), 0.2),
                ("phiy".to_string(), 0.3),
            ])));
            let executor = MockExecutor::new(beamline.clone());
            let (events, _) = broadcast::channel(16);
            Self {
                config: RecentringConfig::default(),
                beamline,
                executor,
                events,
            }
        }

        fn engine<'a>(&'a self, solver: Option<&'a dyn GeometrySolver>) -> RecentringPolicyEngine<'a> {
            RecentringPolicyEngine::new(
                &self.config,
                self.beamline.as_ref(),
                &self.executor,
                solver,
                &self.events,
            )
        }
    }

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

    fn strategy(settings: &[SweepSetting]) -> GeometricStrategy {
        GeometricStrategy {
            id: Uuid::new_v4(),
            is_user_modifiable: false,
            default_image_width: None,
            default_width: None,
            sweeps: settings
                .iter()
                .enumerate()
                .map(|(order, setting)| Sweep {
                    id: Uuid::new_v4(),
                    setting: setting.clone(),
                    start: 0.0,
                    width: 180.0,
                    beam_setting: BeamSetting { wavelength: 1.0 },
                    detector_setting: DetectorSetting {
                        distance: 200.0,
                        resolution: None,
                    },
                    order: order as u32,
                })
                .collect(),
            metadata: StrategyMetadata::default(),
        }
    }

    fn session(mode: RecentringMode, characterisation_done: bool) -> WorkflowSession {
        let mut session = WorkflowSession::new(
            WorkflowKind::Acquisition,
            OperatingMode::Automation,
            SampleInfo::new("thaumatin"),
        );
        session.recentring_mode = mode;
        session.characterisation_done = characterisation_done;
        session.snapshot_count = 2;
        session.path_template.archive_directory = PathBuf::from("/data/ARCHIVE");
        session
    }

    const CALIBRATION: TranslationalCalibration = TranslationalCalibration {
        home_position: [0.0, 0.0, 0.0],
        cross_sec_of_soc: [0.0, 0.0, 0.0],
    };

    #[test]
    fn test_max_deviation_ignores_omega() {
        assert_eq!(max_deviation(&[90.0, 10.0, 20.0], &[0.0, 10.5, 19.0]), 1.0);
    }

    #[tokio::test]
    async fn test_characterisation_uses_current_orientation() {
        let fixture = Fixture::new();
        let engine = fixture.engine(None);
        let a = setting(0.0, 0.0);
        let mut session = session(RecentringMode::Sweep, false);

        let translations = engine
            .plan_translations(&mut session, &strategy(&[a.clone()]), None)
            .await
            .unwrap();

        assert_eq!(translations.len(), 1);
        let translation = &translations[0];
        assert_eq!(translation.requested_rotation_id, Some(a.id));
        assert_ne!(translation.rotation_id, a.id);
        assert_eq!(translation.setting_id(), a.id);
        assert_eq!(translation.axis_settings["sampx"], 0.1);
        assert_eq!(session.current_rotation_id, Some(translation.rotation_id));
        assert!(fixture.executor.centrings().is_empty());
    }

    #[tokio::test]
    async fn test_start_mode_centres_in_reverse_with_snapshots() {
        let fixture = Fixture::new();
        let engine = fixture.engine(None);
        let a = setting(0.0, 0.0);
        let b = setting(30.0, 90.0);
        let mut session = session(RecentringMode::Start, true);

        let translations = engine
            .plan_translations(&mut session, &strategy(&[a.clone(), b.clone()]), None)
            .await
            .unwrap();

        let ids: Vec<RotationId> = translations.iter().map(|t| t.rotation_id).collect();
        assert_eq!(ids, vec![b.id, a.id]);
        assert_eq!(fixture.executor.centrings().len(), 2);
        assert_eq!(session.current_rotation_id, Some(a.id));

        let snapshots = fixture.beamline.snapshots();
        assert_eq!(snapshots.len(), 4);
        let first = snapshots[0].file_name().unwrap().to_string_lossy().into_owned();
        assert!(first.starts_with("0_30_90_"));
        assert!(first.ends_with("_1.jpeg"));
        assert!(snapshots[0].starts_with("/data/ARCHIVE/centring_snapshots"));
        assert_eq!(fixture.beamline.omega_moves(), vec![90.0, -90.0, 90.0, -90.0]);
    }

    #[tokio::test]
    async fn test_sweep_mode_reuses_centring_within_tolerance() {
        let fixture = Fixture::new();
        let engine = fixture.engine(None);
        let a = setting(0.05, 0.0);
        let b = setting(30.0, 90.0);
        let mut session = session(RecentringMode::Sweep, true);

        let translations = engine
            .plan_translations(&mut session, &strategy(&[a.clone(), b.clone()]), None)
            .await
            .unwrap();

        assert_eq!(translations.len(), 2);
        assert_eq!(translations[0].rotation_id, a.id);
        assert_eq!(translations[1].rotation_id, b.id);
        assert_eq!(translations[1].axis_settings["phiy"], 0.3);
        assert!(fixture.executor.centrings().is_empty());
        assert_eq!(session.current_rotation_id, Some(a.id));
    }

    #[tokio::test]
    async fn test_mode_none_requires_calibration() {
        let fixture = Fixture::new();
        let engine = fixture.engine(None);
        let mut session = session(RecentringMode::None, true);

        let err = engine
            .plan_translations(&mut session, &strategy(&[setting(30.0, 0.0)]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_mode_none_predicts_every_orientation() {
        let fixture = Fixture::new();
        let solver = FakeSolver { fail: false };
        let engine = fixture.engine(Some(&solver));
        let a = setting(10.0, 0.0);
        let b = setting(30.0, 90.0);
        let mut session = session(RecentringMode::None, true);

        let translations = engine
            .plan_translations(&mut session, &strategy(&[a, b]), Some(&CALIBRATION))
            .await
            .unwrap();

        assert_eq!(translations.len(), 2);
        assert!((translations[0].axis_settings["sampx"] - 0.2).abs() < 1e-9);
        assert!((translations[1].axis_settings["sampy"] - 1.1).abs() < 1e-9);
        assert!(fixture.executor.centrings().is_empty());
    }

    #[tokio::test]
    async fn test_solver_failure_in_mode_none_fails_centring() {
        let fixture = Fixture::new();
        let solver = FakeSolver { fail: true };
        let engine = fixture.engine(Some(&solver));
        let mut session = session(RecentringMode::None, true);

        let err = engine
            .plan_translations(&mut session, &strategy(&[setting(30.0, 0.0)]), Some(&CALIBRATION))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Centring gave no result");
    }

    #[tokio::test]
    async fn test_solver_failure_falls_back_to_physical_centring() {
        let fixture = Fixture::new();
        let solver = FakeSolver { fail: true };
        let engine = fixture.engine(Some(&solver));
        let a = setting(0.0, 0.0);
        let b = setting(30.0, 90.0);
        let mut session = session(RecentringMode::Sweep, true);

        let translations = engine
            .plan_translations(&mut session, &strategy(&[a, b.clone()]), Some(&CALIBRATION))
            .await
            .unwrap();

        assert_eq!(translations.len(), 2);
        assert_eq!(fixture.executor.centrings().len(), 1);
        assert_eq!(session.current_rotation_id, Some(b.id));
    }

    #[tokio::test]
    async fn test_failed_centring_task_reports_and_fails() {
        let fixture = Fixture::new();
        let mut events = fixture.events.subscribe();
        fixture
            .executor
            .push_centring_result(Err(TaskError::Aborted("Centring".to_string())));
        let engine = fixture.engine(None);

        let err = engine
            .centre(AxisSettings::new(), Uuid::new_v4(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::CentringFailed));
        assert!(matches!(
            events.try_recv(),
            Ok(WorkflowEvent::QueueExecutionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_recentre_before_start() {
        let mut fixture = Fixture::new();
        fixture.config.recentre_before_start = true;
        let engine = fixture.engine(None);
        let a = setting(30.0, 0.0);
        let mut session = session(RecentringMode::Sweep, false);

        let translations = engine
            .plan_translations(&mut session, &strategy(&[a.clone()]), None)
            .await
            .unwrap();

        assert_eq!(translations.len(), 1);
        assert_eq!(translations[0].rotation_id, a.id);
        assert_eq!(translations[0].requested_rotation_id, None);
        assert_eq!(fixture.executor.centrings().len(), 1);
    }
}
