//! Workflow controller actor.
//!
//! [`WorkflowController`] owns the workflow state machine and the session of
//! the running workflow. All session mutations happen in the single task that
//! runs [`WorkflowController::run`]: it drains the inbound queue one message
//! at a time, decodes the message, runs its handler to completion and
//! delivers the response to the message's reply slot before taking the next.
//!
//! ## Lifecycle
//!
//! ```text
//! READY --start--> BUSY --WorkflowCompleted--> COMPLETED --finish--> READY
//!                       --WorkflowAborted----> ABORTED
//!                       --WorkflowFailed-----> FAULT
//!                       --queue closed-------> UNKNOWN
//! ```
//!
//! Every transition is broadcast as a [`WorkflowEvent::StateChanged`].

use crate::beamline::{Beamline, ParameterProvider, TaskExecutor};
use crate::collection::CollectionPlanTranslator;
use crate::config::WorkflowConfig;
use crate::dose;
use crate::error::{AppResult, WorkflowError};
use crate::lattice::{self, format_solution_table, IDXREF_FORMAT};
use crate::messages::{
    self, CentringDone, CentringStatus, CollectionDone, Envelope, Inbound, MessageSender,
    PriorInformation, Reply, SampleCentred, SelectedLattice, SubprocessInfo, WorkflowEvent,
    WorkflowMessage, WorkflowResponse,
};
use crate::model::{ChooseLattice, CollectionProposal, GeometricStrategy, RequestCentring};
use crate::parameter::{await_input, ParameterRequest, ParameterValues, RequestPurpose, UserInput};
use crate::recentring::{GeometrySolver, RecentringPolicyEngine};
use crate::session::{
    OperatingMode, RecentringMode, SampleInfo, WorkflowKind, WorkflowSession, WorkflowState,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// How a dispatch loop ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    /// Stop sentinel received; carries the state at that point
    Finished(WorkflowState),
    /// A message could not be decoded; nothing after it was processed
    ProtocolError { kind: String },
    /// Inbound queue closed without a stop sentinel
    Disconnected,
}

/// What to run, for whom.
#[derive(Clone, Debug)]
pub struct StartRequest {
    pub kind: WorkflowKind,
    pub mode: OperatingMode,
    pub sample: SampleInfo,
    /// Automation parameter sets; the first applies before characterisation,
    /// the last before acquisition
    pub automation_parameters: Vec<ParameterValues>,
    /// Characterisation data already collected elsewhere
    pub init_spot_dir: Option<PathBuf>,
}

impl StartRequest {
    pub fn new(kind: WorkflowKind, mode: OperatingMode, sample: SampleInfo) -> Self {
        Self {
            kind,
            mode,
            sample,
            automation_parameters: Vec::new(),
            init_spot_dir: None,
        }
    }

    pub fn with_automation_parameters(mut self, parameters: Vec<ParameterValues>) -> Self {
        self.automation_parameters = parameters;
        self
    }

    pub fn with_init_spot_dir(mut self, spot_dir: impl Into<PathBuf>) -> Self {
        self.init_spot_dir = Some(spot_dir.into());
        self
    }
}

/// Actor that owns the workflow state and session.
pub struct WorkflowController {
    config: Arc<WorkflowConfig>,
    beamline: Arc<dyn Beamline>,
    executor: Arc<dyn TaskExecutor>,
    operator: Arc<dyn ParameterProvider>,
    solver: Option<Arc<dyn GeometrySolver>>,
    state: WorkflowState,
    session: Option<WorkflowSession>,
    events: broadcast::Sender<WorkflowEvent>,
    inbound: Option<mpsc::UnboundedReceiver<Inbound>>,
    /// Lets terminal handlers queue the stop sentinel without keeping the
    /// queue open
    loopback: Option<mpsc::WeakUnboundedSender<Inbound>>,
    stop_requested: bool,
}

impl WorkflowController {
    /// Creates a controller in state READY.
    pub fn new(
        config: Arc<WorkflowConfig>,
        beamline: Arc<dyn Beamline>,
        executor: Arc<dyn TaskExecutor>,
        operator: Arc<dyn ParameterProvider>,
    ) -> Self {
        let (events, _) = broadcast::channel(config.application.event_capacity);
        Self {
            config,
            beamline,
            executor,
            operator,
            solver: None,
            state: WorkflowState::Ready,
            session: None,
            events,
            inbound: None,
            loopback: None,
            stop_requested: false,
        }
    }

    /// Adds a geometry solver for predicted translations.
    pub fn with_solver(mut self, solver: Arc<dyn GeometrySolver>) -> Self {
        self.solver = Some(solver);
        self
    }

    pub fn state(&self) -> WorkflowState {
        self.state
    }

    pub fn session(&self) -> Option<&WorkflowSession> {
        self.session.as_ref()
    }

    /// Subscribes to state changes and queue failures.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkflowEvent> {
        self.events.subscribe()
    }

    fn set_state(&mut self, state: WorkflowState) {
        let from = std::mem::replace(&mut self.state, state);
        if from != state {
            info!(%from, to = %state, "Workflow state changed");
            let _ = self.events.send(WorkflowEvent::StateChanged { from, to: state });
        }
    }

    fn session_mut(&mut self) -> AppResult<&mut WorkflowSession> {
        self.session.as_mut().ok_or(WorkflowError::NoSession)
    }

    /// Starts a workflow and returns the sender for its inbound queue.
    ///
    /// Only legal in state READY. Pre-strategy parameters come from the first
    /// automation parameter set or from the operator; an operator
    /// cancellation fails the workflow, so the following [`run`] ends in
    /// FAULT.
    ///
    /// [`run`]: WorkflowController::run
    pub async fn start(&mut self, request: StartRequest) -> AppResult<MessageSender> {
        if self.state != WorkflowState::Ready {
            return Err(WorkflowError::InvalidState {
                action: "start",
                state: self.state,
            });
        }

        let mut session = WorkflowSession::new(request.kind, request.mode, request.sample);
        session.automation_parameters = request.automation_parameters;
        session.init_spot_dir = request.init_spot_dir;
        session.recentring_mode = self.config.recentring.default_mode;
        session.snapshot_count = self.config.recentring.snapshot_count;
        session.exposure_time = self.config.acquisition.default_exposure_time;
        session.image_width = self.config.acquisition.default_image_width;
        session.path_template.directory = self.beamline.base_image_directory();
        session.path_template.process_directory = self.beamline.base_process_directory();
        session.path_template.archive_directory = self.beamline.archive_directory();
        session.path_template.base_prefix = session.sample.name.clone();
        session.path_template.run_number = 1;

        let parameters = match session.mode {
            OperatingMode::Automation => {
                let parameters = session.automation_parameters.first().cloned().ok_or_else(|| {
                    WorkflowError::Configuration(
                        "automation mode needs at least one parameter set".to_string(),
                    )
                })?;
                UserInput::Value(parameters)
            }
            OperatingMode::Interactive => {
                let resolution = match session.sample.aimed_resolution {
                    Some(resolution) => resolution,
                    None => self.beamline.resolution().await?,
                };
                let defaults = ParameterValues::new()
                    .with("resolution", resolution)
                    .with("decay_limit", self.config.dose.decay_limit)
                    .with("maximum_dose_budget", self.config.dose.maximum_dose_budget)
                    .with("relative_rad_sensitivity", session.sample.relative_rad_sensitivity)
                    .with("recentring_mode", session.recentring_mode.as_str())
                    .with("snapshot_count", session.snapshot_count);
                let request = ParameterRequest::new(
                    format!("Pre-strategy parameters for {}", session.sample.name),
                    RequestPurpose::PreStrategy,
                    defaults,
                );
                await_input(self.operator.request_parameters(request)).await
            }
        };

        let (sender, inbound) = messages::channel();
        self.inbound = Some(inbound);
        self.loopback = Some(sender.downgrade());
        self.stop_requested = false;
        self.set_state(WorkflowState::Busy);

        match parameters {
            UserInput::Value(values) => apply_pre_strategy(&mut session, &values)?,
            UserInput::Cancelled => {
                warn!("Pre-strategy parameters cancelled by operator");
                self.session = Some(session);
                self.terminate(WorkflowState::Fault);
                return Ok(sender);
            }
        }
        info!(
            session = %session.id,
            sample = %session.sample.name,
            kind = ?session.kind,
            mode = ?session.mode,
            recentring_mode = session.recentring_mode.as_str(),
            "Workflow started"
        );
        self.session = Some(session);
        Ok(sender)
    }

    /// Runs the dispatch loop until the stop sentinel.
    ///
    /// An undecodable message ends the loop without a state change. A handler
    /// error puts the workflow in FAULT and is returned.
    pub async fn run(&mut self) -> AppResult<RunOutcome> {
        let mut inbound = self.inbound.take().ok_or(WorkflowError::NoSession)?;
        info!("Workflow controller started");

        let outcome = loop {
            let Some(item) = inbound.recv().await else {
                if self.stop_requested {
                    break RunOutcome::Finished(self.state);
                }
                error!("Inbound queue closed without a stop request");
                self.set_state(WorkflowState::Unknown);
                break RunOutcome::Disconnected;
            };
            let Envelope {
                kind,
                payload,
                correlation_id,
                reply,
            } = match item {
                Inbound::Stop => break RunOutcome::Finished(self.state),
                Inbound::Message(envelope) => envelope,
            };

            let message = match WorkflowMessage::decode(&kind, payload) {
                Ok(message) => message,
                Err(err) => {
                    error!(%kind, "Stopping dispatch: {}", err);
                    break RunOutcome::ProtocolError { kind };
                }
            };
            debug!(kind = message.kind(), correlation_id = ?correlation_id, "Dispatching message");

            match self.dispatch(message, correlation_id.as_deref()).await {
                Ok(response) => {
                    if let Some(reply) = reply {
                        let _ = reply.send(Reply {
                            response,
                            correlation_id,
                        });
                    }
                }
                Err(err) => {
                    error!(%kind, "Workflow handler failed: {}", err);
                    self.set_state(WorkflowState::Fault);
                    return Err(err);
                }
            }
        };

        info!(?outcome, "Workflow controller stopped");
        Ok(outcome)
    }

    /// Tears the workflow down: reports the final state and returns to READY.
    pub fn finish(&mut self) {
        let state = self.state;
        let _ = self.events.send(WorkflowEvent::WorkflowFinished { state });
        if let Some(mut session) = self.session.take() {
            session.clear();
            info!(
                session = %session.id,
                characterisation_dose = session.characterisation_dose(),
                acquisition_dose = session.acquisition_dose(),
                "Workflow finished in state {}",
                state
            );
        }
        self.inbound = None;
        self.loopback = None;
        self.stop_requested = false;
        self.set_state(WorkflowState::Ready);
    }

    /// [`run`](WorkflowController::run) followed by
    /// [`finish`](WorkflowController::finish), whatever the outcome.
    pub async fn run_to_completion(&mut self) -> AppResult<RunOutcome> {
        let result = self.run().await;
        self.finish();
        result
    }

    async fn dispatch(
        &mut self,
        message: WorkflowMessage,
        correlation_id: Option<&str>,
    ) -> AppResult<Option<WorkflowResponse>> {
        let response = match message {
            WorkflowMessage::ObtainPriorInformation => Some(self.obtain_prior_information().await?),
            WorkflowMessage::RequestConfiguration => Some(WorkflowResponse::ConfigurationData {
                location: self.config.application.beamline_config_dir.clone(),
            }),
            WorkflowMessage::GeometricStrategy(strategy) => {
                Some(self.setup_data_collection(&strategy).await?)
            }
            WorkflowMessage::CollectionProposal(proposal) => Some(self.collect_data(&proposal).await?),
            WorkflowMessage::ChooseLattice(request) => Some(self.select_lattice(&request).await?),
            WorkflowMessage::RequestCentring(request) => {
                Some(self.process_centring_request(&request).await?)
            }
            WorkflowMessage::PrepareForCentring => Some(WorkflowResponse::ReadyForCentring),
            WorkflowMessage::SubprocessStarted(info) => {
                self.subprocess_started(&info, correlation_id)?;
                None
            }
            WorkflowMessage::SubprocessStopped => {
                self.subprocess_stopped(correlation_id)?;
                None
            }
            WorkflowMessage::String(text) => {
                self.echo_info(&text, correlation_id)?;
                None
            }
            WorkflowMessage::WorkflowAborted => self.terminate(WorkflowState::Aborted),
            WorkflowMessage::WorkflowCompleted => self.terminate(WorkflowState::Completed),
            WorkflowMessage::WorkflowFailed => self.terminate(WorkflowState::Fault),
        };
        Ok(response)
    }

    /// Sets a terminal state and queues the stop sentinel behind any
    /// messages already waiting.
    fn terminate(&mut self, state: WorkflowState) -> Option<WorkflowResponse> {
        self.set_state(state);
        self.stop_requested = true;
        if let Some(sender) = self.loopback.as_ref().and_then(|weak| weak.upgrade()) {
            let _ = sender.send(Inbound::Stop);
        }
        None
    }

    fn subprocess_started(&mut self, info: &SubprocessInfo, correlation_id: Option<&str>) -> AppResult<()> {
        let session = self.session_mut()?;
        if let Some(correlation_id) = correlation_id {
            if !session.subprocess_started(correlation_id, &info.name) {
                warn!(
                    correlation_id,
                    ignored = %info.name,
                    "Correlation id is still open for another subprocess"
                );
                return Ok(());
            }
        }
        info!("{} : STARTING", info.name);
        Ok(())
    }

    fn subprocess_stopped(&mut self, correlation_id: Option<&str>) -> AppResult<()> {
        let session = self.session_mut()?;
        let name = correlation_id
            .and_then(|correlation_id| session.subprocess_stopped(correlation_id))
            .unwrap_or_else(|| "Unknown process".to_string());
        info!("{} : FINISHED", name);
        Ok(())
    }

    fn echo_info(&mut self, text: &str, correlation_id: Option<&str>) -> AppResult<()> {
        let session = self.session_mut()?;
        match correlation_id.and_then(|correlation_id| session.subprocess_name(correlation_id)) {
            Some(name) => info!("{}: {}", name, text),
            None => info!("{}", text),
        }
        Ok(())
    }

    async fn obtain_prior_information(&mut self) -> AppResult<WorkflowResponse> {
        let image_root = self.beamline.base_image_directory();
        if !image_root.is_dir() {
            // Must exist by the time the strategy engine looks for it
            if let Err(err) = tokio::fs::create_dir_all(&image_root).await {
                error!(
                    path = %image_root.display(),
                    "Could not create image root directory: {}",
                    err
                );
            }
        }
        let wavelength = self.beamline.wavelength().await?;
        let session = self.session_mut()?;
        let sample = &session.sample;
        Ok(WorkflowResponse::PriorInformation(PriorInformation {
            sample_name: sample.name.clone(),
            image_root,
            wavelength,
            lattices: sample.lattices.clone(),
            crystal_family_char: sample.crystal_family_char,
            cell: sample.cell.clone(),
            space_group: sample.space_group.clone(),
            expected_resolution: sample.aimed_resolution,
        }))
    }

    /// Settles acquisition parameters and dose for a geometric strategy, then
    /// produces a translation for every orientation in it.
    async fn setup_data_collection(
        &mut self,
        strategy: &GeometricStrategy,
    ) -> AppResult<WorkflowResponse> {
        let config = Arc::clone(&self.config);
        let session = self.session.as_mut().ok_or(WorkflowError::NoSession)?;

        let mut wavelengths: Vec<f64> = Vec::new();
        for sweep in strategy.ordered_sweeps() {
            if !wavelengths.contains(&sweep.beam_setting.wavelength) {
                wavelengths.push(sweep.beam_setting.wavelength);
            }
        }
        if wavelengths.is_empty() {
            return Err(WorkflowError::Validation(
                "geometric strategy has no sweeps".to_string(),
            ));
        }
        session.wavelengths = wavelengths;
        session.strategy_length = strategy.strategy_length();
        if let Some(image_width) = strategy.default_image_width {
            session.image_width = image_width;
        }

        // Automation: last parameter set once characterised, first before
        let parameters = match session.mode {
            OperatingMode::Automation => {
                let parameters = if session.characterisation_done {
                    session.automation_parameters.last()
                } else {
                    session.automation_parameters.first()
                };
                let parameters = parameters.cloned().ok_or_else(|| {
                    WorkflowError::Configuration(
                        "automation mode needs at least one parameter set".to_string(),
                    )
                })?;
                if parameters.contains("dose_budget") {
                    return Err(WorkflowError::Validation(
                        "'dose_budget' parameter no longer supported, use 'use_dose' or 'transmission'"
                            .to_string(),
                    ));
                }
                apply_acquisition_parameters(session, &parameters)?;
                Some(parameters)
            }
            OperatingMode::Interactive => None,
        };
        let requested_transmission = match &parameters {
            Some(parameters) => parameters.get_f64("transmission")?,
            None => None,
        };
        let requested_dose = match &parameters {
            Some(parameters) => parameters.get_f64("use_dose")?,
            None => None,
        };

        let resolution = match session.sample.aimed_resolution {
            Some(resolution) => resolution,
            None => self.beamline.resolution().await?,
        };
        let budget = dose::budget(
            resolution,
            session.decay_limit,
            session.maximum_dose_budget,
            session.sample.relative_rad_sensitivity,
            &config.dose.defaults(),
        )?;
        let std_dose_rate = self.beamline.standard_dose_rate();

        let mut use_dose = requested_dose;
        match requested_transmission {
            Some(transmission) => session.transmission = transmission,
            None if std_dose_rate <= 0.0 => {
                warn!("No standard dose rate available; transmission left unchanged");
            }
            None => {
                let target = match requested_dose {
                    Some(dose) => dose,
                    None if session.characterisation_done => budget - session.characterisation_dose(),
                    None if session.kind == WorkflowKind::DiffractCal => budget,
                    None => dose::split_budget(
                        budget,
                        None,
                        config.dose.characterisation_budget_fraction,
                    ),
                }
                .max(0.0);
                if session.in_characterisation() {
                    session.transmission = dose::transmission_for_dose(
                        target,
                        std_dose_rate,
                        session.exposure_time,
                        session.image_width,
                        session.strategy_length,
                    )
                    .min(100.0);
                } else {
                    let settings = dose::derive_from_dose(
                        target,
                        std_dose_rate,
                        session.image_width,
                        session.strategy_length,
                        session.exposure_time,
                        &self.beamline.exposure_time_limits(),
                    )?;
                    if settings.dose_clamped {
                        warn!(
                            requested = target,
                            achievable = settings.use_dose,
                            "Dose reduced to stay within the maximum exposure time"
                        );
                    }
                    session.exposure_time = settings.exposure_time;
                    session.transmission = settings.transmission;
                }
                use_dose = Some(target);
            }
        }
        info!(
            budget,
            use_dose = ?use_dose,
            transmission = session.transmission,
            exposure_time = session.exposure_time,
            "Dose settings"
        );

        if session.mode == OperatingMode::Interactive {
            if strategy.is_user_modifiable {
                warn!("User modification of sweep settings is not supported, ignored");
            }
            let defaults = ParameterValues::new()
                .with("exposure_time", session.exposure_time)
                .with("image_width", session.image_width)
                .with("transmission", session.transmission)
                .with("resolution", resolution)
                .with("snapshot_count", session.snapshot_count)
                .with("recentring_mode", session.recentring_mode.as_str())
                .with("use_dose", use_dose.unwrap_or(0.0));
            let summary = format!(
                "{} sweep(s) at {} wavelength(s), {:.1} deg in total; dose budget {:.3} MGy",
                strategy.sweeps.len(),
                session.wavelengths.len(),
                session.strategy_length,
                budget
            );
            let request = ParameterRequest::new(
                "Collection strategy",
                RequestPurpose::CollectionStrategy { summary },
                defaults,
            );
            let values = match await_input(self.operator.request_parameters(request)).await {
                UserInput::Value(values) => values,
                UserInput::Cancelled => {
                    info!("Collection strategy cancelled by operator");
                    return Ok(WorkflowResponse::Cancelled);
                }
            };
            apply_acquisition_parameters(session, &values)?;
            if let Some(transmission) = values.get_f64("transmission")? {
                session.transmission = transmission;
            }
            if let Some(new_resolution) = values.get_f64("resolution")? {
                if new_resolution != resolution && !session.characterisation_done {
                    info!("Setting detector distance for resolution {:.3} A", new_resolution);
                    self.beamline.set_resolution(new_resolution).await?;
                }
            }
        }

        if !(session.transmission > 0.0 && session.transmission <= 100.0) {
            return Err(WorkflowError::Validation(format!(
                "transmission must be in (0, 100] percent, got {}",
                session.transmission
            )));
        }
        self.beamline.set_transmission(session.transmission).await?;

        let group_name = session.collection_group_name();
        let group_number = session.open_group(group_name).number;
        debug!(group = group_name, number = group_number, "Opened task group");

        let engine = RecentringPolicyEngine::new(
            &config.recentring,
            self.beamline.as_ref(),
            self.executor.as_ref(),
            self.solver.as_deref(),
            &self.events,
        );
        let translations = engine
            .plan_translations(session, strategy, config.transcal.as_ref())
            .await?;
        session.goniostat_translations = translations.clone();

        let wedge_width = match &parameters {
            Some(parameters) => parameters.get_f64("wedge_width")?,
            None => None,
        };
        Ok(WorkflowResponse::SampleCentred(SampleCentred {
            exposure_time: session.exposure_time,
            image_width: session.image_width,
            transmission: session.transmission,
            wavelengths: session.wavelengths.clone(),
            wedge_width: wedge_width.unwrap_or(config.acquisition.default_wedge_width),
            sweep_repeat: strategy.metadata.sweep_repeat,
            sweep_offset: strategy.metadata.sweep_offset,
            interleave_order: strategy.metadata.interleave_order.clone(),
            goniostat_translations: translations,
        }))
    }

    async fn collect_data(&mut self, proposal: &CollectionProposal) -> AppResult<WorkflowResponse> {
        let session = self.session.as_mut().ok_or(WorkflowError::NoSession)?;
        let translator = CollectionPlanTranslator::new(
            &self.config,
            self.beamline.as_ref(),
            self.executor.as_ref(),
            &self.events,
        );
        let done: CollectionDone = translator.collect(session, proposal).await?;
        Ok(WorkflowResponse::CollectionDone(done))
    }

    /// Chooses an indexing solution. Marks characterisation as done.
    async fn select_lattice(&mut self, request: &ChooseLattice) -> AppResult<WorkflowResponse> {
        let session = self.session.as_mut().ok_or(WorkflowError::NoSession)?;
        session.characterisation_done = true;

        let (index, resolution) = match session.mode {
            OperatingMode::Automation => {
                let index = lattice::select_for_request(request)?;
                let aimed_resolution = session.sample.aimed_resolution.ok_or_else(|| {
                    WorkflowError::Validation(
                        "aimed_resolution must be set in automation mode".to_string(),
                    )
                })?;
                let resolution = match session.automation_parameters.last_mut() {
                    Some(parameters) => {
                        if !parameters.contains("resolution") {
                            parameters.insert("resolution", aimed_resolution);
                        }
                        parameters.get_f64("resolution")?.unwrap_or(aimed_resolution)
                    }
                    None => aimed_resolution,
                };
                (index, resolution)
            }
            OperatingMode::Interactive => {
                if request.indexing_format != IDXREF_FORMAT {
                    return Err(lattice::SelectionError::UnsupportedFormat(
                        request.indexing_format.clone(),
                    )
                    .into());
                }
                let proposed = lattice::select_for_request(request).ok();
                let resolution = match session.sample.aimed_resolution {
                    Some(resolution) => resolution,
                    None => self.beamline.resolution().await?,
                };
                let mut defaults = ParameterValues::new().with("resolution", resolution);
                if let Some(row) = proposed {
                    defaults.insert("selected_row", row as u64);
                }
                let prompt = ParameterRequest::new(
                    "Choose lattice",
                    RequestPurpose::ChooseLattice {
                        table: format_solution_table(&request.solutions),
                        selected_row: proposed,
                    },
                    defaults,
                );
                let values = match await_input(self.operator.request_parameters(prompt)).await {
                    UserInput::Value(values) => values,
                    UserInput::Cancelled => {
                        info!("Lattice selection cancelled by operator");
                        return Ok(WorkflowResponse::Cancelled);
                    }
                };
                let index = match values.get_u32("selected_row")? {
                    Some(row) => row as usize,
                    None => proposed.ok_or(lattice::SelectionError::NoCandidates)?,
                };
                if index >= request.solutions.len() {
                    return Err(WorkflowError::Validation(format!(
                        "selected row {} out of range ({} solutions)",
                        index,
                        request.solutions.len()
                    )));
                }
                let resolution = values.get_f64("resolution")?.unwrap_or(resolution);
                (index, resolution)
            }
        };

        session.sample.aimed_resolution = Some(resolution);
        self.beamline.set_resolution(resolution).await?;
        let solution = request.solutions[index].clone();
        info!(
            lattice = %solution.bravais_lattice,
            resolution,
            "Lattice selected"
        );
        Ok(WorkflowResponse::SelectedLattice(SelectedLattice {
            lattice_format: request.indexing_format.clone(),
            solution,
            resolution: Some(resolution),
        }))
    }

    /// Centres at a calibration orientation, switching to fine zoom once
    /// recentred positions start arriving.
    async fn process_centring_request(
        &mut self,
        request: &RequestCentring,
    ) -> AppResult<WorkflowResponse> {
        let config = Arc::clone(&self.config);
        let session = self.session.as_mut().ok_or(WorkflowError::NoSession)?;
        info!(
            "Start centring no. {} of {}",
            request.current_setting_no, request.total_rotations
        );

        let rotation = &request.rotation;
        if request.current_setting_no >= 2
            && rotation.translation.is_some()
            && session.activate_fine_zoom()
        {
            match self.beamline.zoom_presets() {
                Some(presets) => match presets.last() {
                    Some(preset) => {
                        info!(%preset, "Sample re-centring now active, zooming in");
                        self.beamline.move_zoom(preset).await?;
                    }
                    None => warn!("No predefined positions for zoom motor"),
                },
                None => {
                    let prompt = ParameterRequest::new(
                        "Data collection plan",
                        RequestPurpose::Acknowledge {
                            message: "Automatic sample re-centring is now active.\n\
                                      Switch to maximum zoom before continuing"
                                .to_string(),
                        },
                        ParameterValues::new(),
                    );
                    if let UserInput::Cancelled =
                        await_input(self.operator.request_parameters(prompt)).await
                    {
                        info!("Centring cancelled by operator");
                        return Ok(WorkflowResponse::Cancelled);
                    }
                }
            }
        }

        let mut motor_settings = rotation.axis_settings.clone();
        if let Some(translation) = &rotation.translation {
            motor_settings.extend(translation.axis_settings.clone());
        }
        let engine = RecentringPolicyEngine::new(
            &config.recentring,
            self.beamline.as_ref(),
            self.executor.as_ref(),
            self.solver.as_deref(),
            &self.events,
        );
        let (translation, _) = engine.centre(motor_settings, rotation.id, None).await?;
        session.current_rotation_id = Some(rotation.id);

        let status = if request.current_setting_no >= request.total_rotations {
            CentringStatus::Done
        } else {
            CentringStatus::Next
        };
        Ok(WorkflowResponse::CentringDone(CentringDone {
            status,
            timestamp: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
            goniostat_translation: translation,
        }))
    }
}

/// Applies pre-strategy parameters to a new session.
fn apply_pre_strategy(session: &mut WorkflowSession, values: &ParameterValues) -> AppResult<()> {
    if let Some(resolution) = values.get_f64("resolution")? {
        session.sample.aimed_resolution = Some(resolution);
    }
    if let Some(sensitivity) = values.get_f64("relative_rad_sensitivity")? {
        session.sample.relative_rad_sensitivity = sensitivity;
    }
    session.decay_limit = values.get_f64("decay_limit")?.or(session.decay_limit);
    session.maximum_dose_budget = values
        .get_f64("maximum_dose_budget")?
        .or(session.maximum_dose_budget);
    if let Some(use_cell) = values.get("use_cell_for_processing").and_then(|v| v.as_bool()) {
        session.use_cell_for_processing = use_cell;
    }
    apply_acquisition_parameters(session, values)
}

/// Applies the acquisition settings present in `values`.
fn apply_acquisition_parameters(
    session: &mut WorkflowSession,
    values: &ParameterValues,
) -> AppResult<()> {
    if let Some(exposure_time) = values.get_f64("exposure_time")? {
        session.exposure_time = exposure_time;
    }
    if let Some(image_width) = values.get_f64("image_width")? {
        session.image_width = image_width;
    }
    if let Some(snapshot_count) = values.get_u32("snapshot_count")? {
        session.snapshot_count = snapshot_count;
    }
    if let Some(mode) = values
        .get_str("recentring_mode")
        .map(str::parse::<RecentringMode>)
        .transpose()?
    {
        session.recentring_mode = mode;
    }
    Ok(())
}
