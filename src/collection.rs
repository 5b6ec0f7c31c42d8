//! Collection proposal to acquisition tasks.
//!
//! [`CollectionPlanTranslator`] turns the scans of a [`CollectionProposal`]
//! into acquisition tasks in the session's open task group, inserting
//! in-queue centrings where the recentring mode asks for them, and runs the
//! group. Queue failures become a non-zero status in the reply rather than an
//! error.

use crate::beamline::{Beamline, TaskExecutor};
use crate::config::WorkflowConfig;
use crate::dose;
use crate::error::{AppResult, WorkflowError};
use crate::messages::{CollectionDone, WorkflowEvent};
use crate::model::{energy_from_wavelength, CollectionProposal, RotationId, Scan};
use crate::session::{RecentringMode, WorkflowSession};
use crate::tasks::{AcquisitionParameters, AcquisitionTask, CentringTask, QueuedTask, TaskGroup};
use std::collections::HashSet;
use std::path::PathBuf;
use tokio::sync::broadcast;
use tracing::{error, info};

/// Base directories that relative image directories are resolved against.
#[derive(Clone, Debug, PartialEq)]
pub struct ImageRoots {
    pub image: PathBuf,
    pub process: PathBuf,
}

pub struct CollectionPlanTranslator<'a> {
    config: &'a WorkflowConfig,
    beamline: &'a dyn Beamline,
    executor: &'a dyn TaskExecutor,
    events: &'a broadcast::Sender<WorkflowEvent>,
}

impl<'a> CollectionPlanTranslator<'a> {
    pub fn new(
        config: &'a WorkflowConfig,
        beamline: &'a dyn Beamline,
        executor: &'a dyn TaskExecutor,
        events: &'a broadcast::Sender<WorkflowEvent>,
    ) -> Self {
        Self {
            config,
            beamline,
            executor,
            events,
        }
    }

    /// Scans to acquire and, for a compressed multi-trigger sweep, the
    /// trigger count and sweep offset.
    fn effective_scans<'p>(
        &self,
        proposal: &'p CollectionProposal,
    ) -> AppResult<(&'p [Scan], Option<(u32, f64)>)> {
        let multi_trigger = if self.config.acquisition.use_multitrigger {
            proposal.strategy.multi_trigger()
        } else {
            None
        };
        match multi_trigger {
            Some((repeat, offset)) => {
                let scan_count = proposal.scans.len();
                if repeat as usize != scan_count {
                    return Err(WorkflowError::Validation(format!(
                        "scan count {} does not match repeat count {}",
                        scan_count, repeat
                    )));
                }
                Ok((&proposal.scans[..1], Some((repeat, offset))))
            }
            None => Ok((&proposal.scans, None)),
        }
    }

    /// Builds the tasks for `proposal` in execution order.
    ///
    /// Advances the session's current rotation as each scan is planned.
    pub fn build_tasks(
        &self,
        session: &mut WorkflowSession,
        proposal: &CollectionProposal,
        roots: &ImageRoots,
    ) -> AppResult<Vec<QueuedTask>> {
        let tolerance = self.config.recentring.angular_tolerance;
        let axes = &self.config.recentring.rotation_axes;
        let mode = session.recentring_mode;
        let (scans, multi_trigger) = self.effective_scans(proposal)?;

        let mut tasks = Vec::new();
        let mut sweeps_seen = HashSet::new();
        let mut last_orientation: Option<[f64; 2]> = None;
        let mut maxdev = -1.0_f64;
        let mut snapshotted: HashSet<RotationId> = HashSet::new();

        for (index, scan) in scans.iter().enumerate() {
            let sweep = &scan.sweep;
            let rotation_id = sweep.setting.id;
            let translation = session
                .goniostat_translations
                .iter()
                .find(|translation| translation.setting_id() == rotation_id);
            let initial_settings = sweep.initial_settings(translation);
            let orientation = [
                initial_settings.get(&axes[1]).copied().unwrap_or(0.0),
                initial_settings.get(&axes[2]).copied().unwrap_or(0.0),
            ];

            let mut parameters = AcquisitionParameters {
                first_image: scan.image_start_num,
                num_images: scan.num_images,
                osc_start: scan.start,
                osc_range: scan.image_width,
                exp_time: scan.exposure_time,
                num_passes: 1,
                energy: energy_from_wavelength(sweep.beam_setting.wavelength),
                detector_distance: sweep.detector_setting.distance,
                ..Default::default()
            };
            info!(
                "Scan: {} images of {} deg. starting at {} ({} deg)",
                parameters.num_images, parameters.osc_range, parameters.first_image, parameters.osc_start
            );

            let mut path_template = session.path_template.clone();
            if let Some(relative) = proposal.relative_image_dir.as_deref().filter(|d| !d.is_empty()) {
                path_template.directory = roots.image.join(relative);
                path_template.process_directory = roots.process.join(relative);
            }
            if let Some(subdir) = scan.filename_params.subdir.as_deref().filter(|d| !d.is_empty()) {
                path_template.directory = path_template.directory.join(subdir);
                path_template.process_directory = path_template.process_directory.join(subdir);
            }
            path_template.run_number = scan.filename_params.run.filter(|run| *run > 0).unwrap_or(1);
            path_template.base_prefix = scan.filename_params.prefix.clone();
            path_template.start_num = parameters.first_image;
            path_template.num_files = parameters.num_images;

            if let Some(last) = last_orientation {
                maxdev = (orientation[0] - last[0])
                    .abs()
                    .max((orientation[1] - last[1]).abs());
            }
            let same_rotation = session.current_rotation_id == Some(rotation_id);
            let recentre = !sweeps_seen.is_empty()
                && (mode == RecentringMode::Scan
                    || (mode == RecentringMode::Sweep
                        && !(same_rotation || (0.0..tolerance).contains(&maxdev))));
            if recentre {
                // Centred in the queue; the resulting translation is not
                // reported back to the strategy engine
                tasks.push(QueuedTask::Centring(CentringTask::new(
                    initial_settings,
                    &axes[1..],
                    true,
                )));
            } else {
                let mut centred_position = initial_settings;
                centred_position.insert(sweep.setting.scan_axis.clone(), scan.start);
                parameters.centred_position = Some(centred_position);
            }

            parameters.take_snapshots = if snapshotted.contains(&rotation_id) && same_rotation {
                0
            } else {
                snapshotted.insert(rotation_id);
                session.snapshot_count
            };
            session.current_rotation_id = Some(rotation_id);
            sweeps_seen.insert(sweep.id);
            last_orientation = Some(orientation);

            if let Some((repeat, offset)) = multi_trigger {
                parameters.num_triggers = Some(repeat);
                parameters.num_images_per_trigger = Some(parameters.num_images);
                parameters.num_images *= repeat;
                // Offset is between trigger starting points
                parameters.overlap =
                    Some(f64::from(scan.num_images) * parameters.osc_range - offset);
            }

            tasks.push(QueuedTask::Acquisition(AcquisitionTask {
                name: path_template.prefix(),
                parameters,
                path_template,
                in_queue: index + 1 < scans.len(),
            }));
        }
        info!(sweep_count = sweeps_seen.len(), task_count = tasks.len(), "Collection planned");
        Ok(tasks)
    }

    /// Enqueues and runs the proposal.
    pub async fn collect(
        &self,
        session: &mut WorkflowSession,
        proposal: &CollectionProposal,
    ) -> AppResult<CollectionDone> {
        if let Some(spot_dir) = &session.init_spot_dir {
            info!(
                spot_dir = %spot_dir.display(),
                "Characterisation data already collected, skipping acquisition"
            );
            return Ok(CollectionDone {
                status: 0,
                proposal_id: proposal.id,
                proc_with_lattice_params: session.use_cell_for_processing,
            });
        }

        let roots = ImageRoots {
            image: self.beamline.base_image_directory(),
            process: self.beamline.base_process_directory(),
        };
        let tasks = self.build_tasks(session, proposal, &roots)?;

        let name = session.collection_group_name();
        let mut group = session.take_group().unwrap_or_else(|| {
            let number = session.next_number_for_name(name);
            TaskGroup::new(name, number)
        });
        for task in tasks {
            group.push(task);
        }

        let status = match self.executor.execute_group(&group).await {
            Ok(()) => 0,
            Err(err) => {
                error!(group = %group.name, "Queue execution failed: {}", err);
                let _ = self.events.send(WorkflowEvent::QueueExecutionFailed {
                    task: group.name.clone(),
                    reason: err.to_string(),
                });
                1
            }
        };

        if status == 0 {
            let exposed = dose::accumulated_dose(
                self.beamline.standard_dose_rate(),
                group.total_exposure_time(),
                session.transmission,
            );
            session.record_dose(exposed)?;
            info!(
                dose = exposed,
                total = session.total_dose(),
                "Collection finished"
            );
        }

        Ok(CollectionDone {
            status,
            proposal_id: proposal.id,
            proc_with_lattice_params: session.use_cell_for_processing,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beamline::mock::{MockBeamline, MockExecutor};
    use crate::model::{
        AxisSettings, BeamSetting, DetectorSetting, FilenameParams, GoniostatTranslation,
        StrategyMetadata, Sweep, SweepSetting,
    };
    use crate::session::{OperatingMode, SampleInfo, WorkflowKind};
    use std::sync::Arc;
    use uuid::Uuid;

    fn sweep(kappa: f64, phi: f64) -> Sweep {
        Sweep {
            id: Uuid::new_v4(),
            setting: SweepSetting {
                id: Uuid::new_v4(),
                scan_axis: "omega".to_string(),
                axis_settings: AxisSettings::from([
                    ("kappa".to_string(), kappa),
                    ("kappa_phi".to_string(), phi),
                ]),
            },
            start: 0.0,
            width: 90.0,
            beam_setting: BeamSetting { wavelength: 1.0 },
            detector_setting: DetectorSetting {
                distance: 180.0,
                resolution: None,
            },
            order: 0,
        }
    }

    fn scan(sweep: &Sweep, start: f64, first_image: u32) -> Scan {
        Scan {
            sweep: sweep.clone(),
            start,
            image_start_num: first_image,
            num_images: 450,
            image_width: 0.1,
            exposure_time: 0.02,
            filename_params: FilenameParams {
                prefix: "thau".to_string(),
                run: Some(2),
                subdir: Some("main".to_string()),
            },
        }
    }

    fn proposal(scans: Vec<Scan>, strategy: StrategyMetadata) -> CollectionProposal {
        CollectionProposal {
            id: Uuid::new_v4(),
            relative_image_dir: Some("thau/run".to_string()),
            strategy,
            scans,
        }
    }

    fn session(mode: RecentringMode) -> WorkflowSession {
        let mut session = WorkflowSession::new(
            WorkflowKind::Acquisition,
            OperatingMode::Automation,
            SampleInfo::new("thaumatin"),
        );
        session.recentring_mode = mode;
        session.characterisation_done = true;
        session.snapshot_count = 2;
        session.transmission = 50.0;
        session
    }

    fn roots() -> ImageRoots {
        ImageRoots {
            image: PathBuf::from("/data/RAW_DATA"),
            process: PathBuf::from("/data/PROCESSED_DATA"),
        }
    }

    struct Fixture {
        config: WorkflowConfig,
        beamline: Arc<MockBeamline>,
        executor: MockExecutor,
        events: broadcast::Sender<WorkflowEvent>,
    }

    impl Fixture {
        fn new() -> Self {
            let beamline = Arc::new(MockBeamline::new("/data").with_dose_rate(0.2));
            let executor = MockExecutor::new(beamline.clone());
            let (events, _) = broadcast::channel(16);
            Self {
                config: WorkflowConfig::default(),
                beamline,
                executor,
                events,
            }
        }

        fn translator(&self) -> CollectionPlanTranslator<'_> {
            CollectionPlanTranslator::new(
                &self.config,
                self.beamline.as_ref(),
                &self.executor,
                &self.events,
            )
        }
    }

    fn acquisitions(tasks: &[QueuedTask]) -> Vec<&AcquisitionTask> {
        tasks
            .iter()
            .filter_map(|task| match task {
                QueuedTask::Acquisition(task) => Some(task),
                QueuedTask::Centring(_) => None,
            })
            .collect()
    }

    fn centring_count(tasks: &[QueuedTask]) -> usize {
        tasks
            .iter()
            .filter(|task| matches!(task, QueuedTask::Centring(_)))
            .count()
    }

    #[test]
    fn test_sweep_mode_recentres_only_at_sweep_boundaries() {
        let fixture = Fixture::new();
        let a = sweep(0.0, 0.0);
        let b = sweep(40.0, 90.0);
        let mut session = session(RecentringMode::Sweep);
        session.current_rotation_id = Some(a.setting.id);
        let proposal = proposal(
            vec![scan(&a, 0.0, 1), scan(&a, 45.0, 451), scan(&b, 0.0, 1), scan(&b, 45.0, 451)],
            StrategyMetadata::default(),
        );

        let tasks = fixture
            .translator()
            .build_tasks(&mut session, &proposal, &roots())
            .unwrap();

        assert_eq!(tasks.len(), 5);
        assert!(matches!(tasks[2], QueuedTask::Centring(_)));
        assert_eq!(centring_count(&tasks), 1);
        let acquisitions = acquisitions(&tasks);
        assert!(acquisitions[2].parameters.centred_position.is_none());
        assert_eq!(
            acquisitions[1].parameters.centred_position.as_ref().unwrap()["omega"],
            45.0
        );
        assert_eq!(session.current_rotation_id, Some(b.setting.id));
    }

    #[test]
    fn test_small_deviation_reuses_centring() {
        let fixture = Fixture::new();
        let a = sweep(30.0, 90.0);
        let b = sweep(30.1, 90.0);
        let mut session = session(RecentringMode::Sweep);
        let proposal = proposal(
            vec![scan(&a, 0.0, 1), scan(&a, 45.0, 451), scan(&b, 0.0, 1), scan(&b, 45.0, 451)],
            StrategyMetadata::default(),
        );

        let tasks = fixture
            .translator()
            .build_tasks(&mut session, &proposal, &roots())
            .unwrap();
        assert_eq!(centring_count(&tasks), 0);
    }

    #[test]
    fn test_scan_mode_recentres_every_scan_after_the_first() {
        let fixture = Fixture::new();
        let a = sweep(0.0, 0.0);
        let mut session = session(RecentringMode::Scan);
        let proposal = proposal(
            vec![scan(&a, 0.0, 1), scan(&a, 45.0, 451), scan(&a, 90.0, 901)],
            StrategyMetadata::default(),
        );

        let tasks = fixture
            .translator()
            .build_tasks(&mut session, &proposal, &roots())
            .unwrap();
        assert_eq!(centring_count(&tasks), 2);
        assert!(matches!(tasks[0], QueuedTask::Acquisition(_)));
    }

    #[test]
    fn test_centred_position_includes_plan_translation() {
        let fixture = Fixture::new();
        let a = sweep(10.0, 20.0);
        let mut session = session(RecentringMode::Sweep);
        session.goniostat_translations = vec![GoniostatTranslation::new(
            a.setting.id,
            AxisSettings::from([("sampx".to_string(), 0.25)]),
        )];
        let proposal = proposal(vec![scan(&a, 12.0, 1)], StrategyMetadata::default());

        let tasks = fixture
            .translator()
            .build_tasks(&mut session, &proposal, &roots())
            .unwrap();
        let position = acquisitions(&tasks)[0]
            .parameters
            .centred_position
            .clone()
            .unwrap();
        assert_eq!(position["sampx"], 0.25);
        assert_eq!(position["omega"], 12.0);
        assert_eq!(position["kappa"], 10.0);
    }

    #[test]
    fn test_snapshots_once_per_still_current_rotation() {
        let fixture = Fixture::new();
        let a = sweep(0.0, 0.0);
        let b = sweep(40.0, 90.0);
        let mut session = session(RecentringMode::Sweep);
        let proposal = proposal(
            vec![
                scan(&a, 0.0, 1),
                scan(&a, 45.0, 451),
                scan(&b, 0.0, 1),
                scan(&a, 90.0, 901),
            ],
            StrategyMetadata::default(),
        );

        let tasks = fixture
            .translator()
            .build_tasks(&mut session, &proposal, &roots())
            .unwrap();
        let snapshots: Vec<u32> = acquisitions(&tasks)
            .iter()
            .map(|task| task.parameters.take_snapshots)
            .collect();
        assert_eq!(snapshots, vec![2, 0, 2, 2]);
    }

    #[test]
    fn test_path_template() {
        let fixture = Fixture::new();
        let a = sweep(0.0, 0.0);
        let mut session = session(RecentringMode::Sweep);
        let proposal = proposal(vec![scan(&a, 0.0, 451)], StrategyMetadata::default());

        let tasks = fixture
            .translator()
            .build_tasks(&mut session, &proposal, &roots())
            .unwrap();
        let task = acquisitions(&tasks)[0];
        assert_eq!(task.name, "thau_2");
        assert_eq!(
            task.path_template.directory,
            PathBuf::from("/data/RAW_DATA/thau/run/main")
        );
        assert_eq!(
            task.path_template.process_directory,
            PathBuf::from("/data/PROCESSED_DATA/thau/run/main")
        );
        assert_eq!(task.path_template.start_num, 451);
        assert!(!task.in_queue);
        assert!((task.parameters.energy - 12.398).abs() < 1e-3);
    }

    #[test]
    fn test_multi_trigger_compresses_repeats() {
        let mut fixture = Fixture::new();
        fixture.config.acquisition.use_multitrigger = true;
        let a = sweep(0.0, 0.0);
        let metadata = StrategyMetadata {
            sweep_repeat: Some(3),
            sweep_offset: Some(15.0),
            interleave_order: None,
        };
        let mut session = session(RecentringMode::Sweep);
        let proposal = proposal(
            vec![scan(&a, 0.0, 1), scan(&a, 15.0, 451), scan(&a, 30.0, 901)],
            metadata,
        );

        let tasks = fixture
            .translator()
            .build_tasks(&mut session, &proposal, &roots())
            .unwrap();
        assert_eq!(tasks.len(), 1);
        let parameters = &acquisitions(&tasks)[0].parameters;
        assert_eq!(parameters.num_images, 1350);
        assert_eq!(parameters.num_images_per_trigger, Some(450));
        assert_eq!(parameters.num_triggers, Some(3));
        assert!((parameters.overlap.unwrap() - 30.0).abs() < 1e-9);
    }

    #[test]
    fn test_multi_trigger_count_mismatch() {
        let mut fixture = Fixture::new();
        fixture.config.acquisition.use_multitrigger = true;
        let a = sweep(0.0, 0.0);
        let metadata = StrategyMetadata {
            sweep_repeat: Some(2),
            sweep_offset: Some(15.0),
            interleave_order: None,
        };
        let mut session = session(RecentringMode::Sweep);
        let proposal = proposal(
            vec![scan(&a, 0.0, 1), scan(&a, 15.0, 451), scan(&a, 30.0, 901)],
            metadata,
        );

        let err = fixture
            .translator()
            .build_tasks(&mut session, &proposal, &roots())
            .unwrap_err();
        assert!(err.to_string().contains("scan count 3 does not match repeat count 2"));
    }

    #[test]
    fn test_multi_trigger_disabled_keeps_scans() {
        let fixture = Fixture::new();
        let a = sweep(0.0, 0.0);
        let metadata = StrategyMetadata {
            sweep_repeat: Some(2),
            sweep_offset: Some(15.0),
            interleave_order: None,
        };
        let mut session = session(RecentringMode::Sweep);
        let proposal = proposal(vec![scan(&a, 0.0, 1), scan(&a, 15.0, 451), scan(&a, 30.0, 901)], metadata);

        let tasks = fixture
            .translator()
            .build_tasks(&mut session, &proposal, &roots())
            .unwrap();
        assert_eq!(acquisitions(&tasks).len(), 3);
        assert!(acquisitions(&tasks)[0].in_queue);
    }

    #[tokio::test]
    async fn test_collect_runs_group_and_records_dose() {
        let fixture = Fixture::new();
        let a = sweep(0.0, 0.0);
        let mut session = session(RecentringMode::Sweep);
        session.open_group("Data collection");
        let proposal = proposal(vec![scan(&a, 0.0, 1)], StrategyMetadata::default());

        let done = fixture.translator().collect(&mut session, &proposal).await.unwrap();

        assert_eq!(done.status, 0);
        assert_eq!(done.proposal_id, proposal.id);
        assert!(session.current_group().is_none());
        let groups = fixture.executor.groups();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].entries()[0].sequence, 1);
        // 450 images * 0.02 s at 0.2 MGy/s and 50 %
        assert!((session.acquisition_dose() - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_collect_failure_is_status_one() {
        let fixture = Fixture::new();
        fixture.executor.fail_groups(true);
        let mut events = fixture.events.subscribe();
        let a = sweep(0.0, 0.0);
        let mut session = session(RecentringMode::Sweep);
        let proposal = proposal(vec![scan(&a, 0.0, 1)], StrategyMetadata::default());

        let done = fixture.translator().collect(&mut session, &proposal).await.unwrap();

        assert_eq!(done.status, 1);
        assert!(session.current_group().is_none());
        assert_eq!(session.total_dose(), 0.0);
        assert!(matches!(
            events.try_recv(),
            Ok(WorkflowEvent::QueueExecutionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn test_existing_spot_dir_skips_acquisition() {
        let fixture = Fixture::new();
        let a = sweep(0.0, 0.0);
        let mut session = session(RecentringMode::Sweep);
        session.init_spot_dir = Some(PathBuf::from("/data/spots"));
        let proposal = proposal(vec![scan(&a, 0.0, 1)], StrategyMetadata::default());

        let done = fixture.translator().collect(&mut session, &proposal).await.unwrap();
        assert_eq!(done.status, 0);
        assert!(fixture.executor.groups().is_empty());
    }
}
