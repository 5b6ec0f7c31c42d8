//! Emulation runner.
//!
//! Drives one workflow against the mock beamline. Messages are read as JSON
//! lines, `{"kind": ..., "payload": ..., "correlation_id": ...}`, from a file
//! or stdin. Each reply and every workflow event is printed to stdout as a
//! JSON line; logs go to stderr.

use anyhow::{Context, Result};
use beamline_workflow::beamline::mock::{MockBeamline, MockExecutor, MockParameterProvider};
use beamline_workflow::config::WorkflowConfig;
use beamline_workflow::controller::{RunOutcome, StartRequest, WorkflowController};
use beamline_workflow::logging;
use beamline_workflow::messages::{Envelope, MessageSender};
use beamline_workflow::parameter::ParameterValues;
use beamline_workflow::recentring::RecenSolver;
use beamline_workflow::session::{OperatingMode, SampleInfo, WorkflowKind, WorkflowState};
use clap::{Parser, ValueEnum};
use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "beamline_workflow")]
#[command(about = "Run a strategy workflow against an emulated beamline", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(short, long, default_value = "config/workflow.toml")]
    config: PathBuf,

    /// JSON-lines message file (stdin when omitted)
    #[arg(short, long)]
    input: Option<PathBuf>,

    /// Sample name, also the image file prefix
    #[arg(short, long, default_value = "emulated_sample")]
    sample: String,

    /// Aimed resolution in Ångström
    #[arg(long)]
    resolution: Option<f64>,

    /// JSON file holding a list of automation parameter sets; switches to
    /// automation mode
    #[arg(long)]
    automation: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = KindArg::Acquisition)]
    kind: KindArg,

    /// Root of the emulated image, process and archive directories
    #[arg(long, default_value = "emulation")]
    data_root: PathBuf,

    /// Overrides the configured log level
    #[arg(long)]
    log_level: Option<String>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KindArg {
    Acquisition,
    Diffractcal,
    Transcal,
}

impl From<KindArg> for WorkflowKind {
    fn from(kind: KindArg) -> Self {
        match kind {
            KindArg::Acquisition => WorkflowKind::Acquisition,
            KindArg::Diffractcal => WorkflowKind::DiffractCal,
            KindArg::Transcal => WorkflowKind::TransCal,
        }
    }
}

#[derive(Debug, Deserialize)]
struct InboundLine {
    kind: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    correlation_id: Option<String>,
}

/// Sends each input line and prints its reply. Stops at the first message
/// that gets no reply, which means the dispatch loop has ended.
async fn feed(input: Box<dyn AsyncRead + Unpin + Send>, sender: MessageSender) -> Result<usize> {
    let mut lines = BufReader::new(input).lines();
    let mut sent = 0;
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let inbound: InboundLine =
            serde_json::from_str(&line).with_context(|| format!("Invalid message line: {}", line))?;
        let (envelope, reply) =
            Envelope::with_reply(inbound.kind, inbound.payload, inbound.correlation_id);
        if !sender.send(envelope) {
            break;
        }
        sent += 1;
        match reply.await {
            Ok(reply) => {
                if reply.response.is_some() {
                    println!("{}", serde_json::to_string(&reply)?);
                }
            }
            Err(_) => break,
        }
    }
    Ok(sent)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = WorkflowConfig::load_from(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.application.log_level = level;
        config.validate()?;
    }
    logging::init(&config.application);
    let config = Arc::new(config);

    let beamline = Arc::new(MockBeamline::new(&cli.data_root));
    let executor = Arc::new(MockExecutor::new(beamline.clone()));
    let operator = Arc::new(MockParameterProvider::new());
    let mut controller = WorkflowController::new(config.clone(), beamline, executor, operator);
    if config.solver.executable.is_some() {
        info!("Geometry solver enabled");
        controller = controller.with_solver(Arc::new(RecenSolver::new(config.solver.clone())));
    }

    let (mode, parameters) = match &cli.automation {
        Some(path) => {
            let text = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let sets: Vec<ParameterValues> = serde_json::from_str(&text)
                .with_context(|| format!("Invalid automation parameters in {}", path.display()))?;
            (OperatingMode::Automation, sets)
        }
        None => (OperatingMode::Interactive, Vec::new()),
    };
    let mut sample = SampleInfo::new(cli.sample);
    sample.aimed_resolution = cli.resolution;
    let request =
        StartRequest::new(cli.kind.into(), mode, sample).with_automation_parameters(parameters);

    let mut events = controller.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let Ok(line) = serde_json::to_string(&event) {
                println!("{}", line);
            }
        }
    });

    let sender = controller.start(request).await?;
    let input: Box<dyn AsyncRead + Unpin + Send> = match &cli.input {
        Some(path) => Box::new(
            tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Failed to open {}", path.display()))?,
        ),
        None => Box::new(tokio::io::stdin()),
    };
    let feeder = tokio::spawn(feed(input, sender));

    let outcome = controller.run_to_completion().await;
    match feeder.await? {
        Ok(sent) => info!(messages = sent, "Input finished"),
        Err(err) => error!("Input failed: {:#}", err),
    }

    match outcome.context("Workflow failed")? {
        RunOutcome::Finished(WorkflowState::Completed) => {
            info!("Workflow completed");
            Ok(())
        }
        other => {
            warn!(outcome = ?other, "Workflow did not complete");
            std::process::exit(1);
        }
    }
}
