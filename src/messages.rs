//! Message types for the workflow protocol
//!
//! Inbound messages from the strategy engine arrive as `(kind, payload)`
//! pairs with an optional correlation id and an optional reply slot. They
//! are decoded into the closed [`WorkflowMessage`] enum before dispatch;
//! handlers answer with a [`WorkflowResponse`].

use crate::error::{AppResult, WorkflowError};
use crate::lattice::IndexingSolution;
use crate::model::{
    ChooseLattice, CollectionProposal, GeometricStrategy, GoniostatTranslation, RequestCentring,
    UnitCell,
};
use crate::session::WorkflowState;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Payload of subprocess notifications.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubprocessInfo {
    pub name: String,
}

/// Decoded inbound message.
#[derive(Clone, Debug, PartialEq)]
pub enum WorkflowMessage {
    ObtainPriorInformation,
    RequestConfiguration,
    GeometricStrategy(GeometricStrategy),
    CollectionProposal(CollectionProposal),
    ChooseLattice(ChooseLattice),
    RequestCentring(RequestCentring),
    PrepareForCentring,
    SubprocessStarted(SubprocessInfo),
    SubprocessStopped,
    String(String),
    WorkflowAborted,
    WorkflowCompleted,
    WorkflowFailed,
}

impl WorkflowMessage {
    /// Decodes a message by kind. An unrecognised kind or a payload that does
    /// not match its kind is a protocol error.
    pub fn decode(kind: &str, payload: Value) -> AppResult<Self> {
        let message = match kind {
            "ObtainPriorInformation" => Self::ObtainPriorInformation,
            "RequestConfiguration" => Self::RequestConfiguration,
            "GeometricStrategy" => Self::GeometricStrategy(from_payload(kind, payload)?),
            "CollectionProposal" => Self::CollectionProposal(from_payload(kind, payload)?),
            "ChooseLattice" => Self::ChooseLattice(from_payload(kind, payload)?),
            "RequestCentring" => Self::RequestCentring(from_payload(kind, payload)?),
            "PrepareForCentring" => Self::PrepareForCentring,
            "SubprocessStarted" => Self::SubprocessStarted(from_payload(kind, payload)?),
            "SubprocessStopped" => Self::SubprocessStopped,
            "String" => Self::String(match payload {
                Value::String(text) => text,
                Value::Null => String::new(),
                other => other.to_string(),
            }),
            "WorkflowAborted" => Self::WorkflowAborted,
            "WorkflowCompleted" => Self::WorkflowCompleted,
            "WorkflowFailed" => Self::WorkflowFailed,
            other => {
                return Err(WorkflowError::Protocol(format!(
                    "message kind '{}' not recognised",
                    other
                )))
            }
        };
        Ok(message)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ObtainPriorInformation => "ObtainPriorInformation",
            Self::RequestConfiguration => "RequestConfiguration",
            Self::GeometricStrategy(_) => "GeometricStrategy",
            Self::CollectionProposal(_) => "CollectionProposal",
            Self::ChooseLattice(_) => "ChooseLattice",
            Self::RequestCentring(_) => "RequestCentring",
            Self::PrepareForCentring => "PrepareForCentring",
            Self::SubprocessStarted(_) => "SubprocessStarted",
            Self::SubprocessStopped => "SubprocessStopped",
            Self::String(_) => "String",
            Self::WorkflowAborted => "WorkflowAborted",
            Self::WorkflowCompleted => "WorkflowCompleted",
            Self::WorkflowFailed => "WorkflowFailed",
        }
    }
}

fn from_payload<T: DeserializeOwned>(kind: &str, payload: Value) -> AppResult<T> {
    serde_json::from_value(payload)
        .map_err(|err| WorkflowError::Protocol(format!("invalid {} payload: {}", kind, err)))
}

/// Prior information about the sample and where images go.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PriorInformation {
    pub sample_name: String,
    pub image_root: PathBuf,
    pub wavelength: f64,
    pub lattices: Vec<String>,
    pub crystal_family_char: Option<char>,
    pub cell: Option<UnitCell>,
    pub space_group: Option<String>,
    pub expected_resolution: Option<f64>,
}

/// Plan accepted and the sample centred for it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SampleCentred {
    pub exposure_time: f64,
    pub image_width: f64,
    /// Percent
    pub transmission: f64,
    pub wavelengths: Vec<f64>,
    pub wedge_width: f64,
    pub sweep_repeat: Option<u32>,
    pub sweep_offset: Option<f64>,
    pub interleave_order: Option<String>,
    pub goniostat_translations: Vec<GoniostatTranslation>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CollectionDone {
    /// 0 on success, 1 when the task queue failed
    pub status: i32,
    pub proposal_id: Uuid,
    pub proc_with_lattice_params: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SelectedLattice {
    pub lattice_format: String,
    pub solution: IndexingSolution,
    pub resolution: Option<f64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CentringStatus {
    /// More centrings follow
    Next,
    /// Last centring of the series
    Done,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CentringDone {
    pub status: CentringStatus,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    pub goniostat_translation: GoniostatTranslation,
}

/// Answer to an inbound message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload")]
pub enum WorkflowResponse {
    PriorInformation(PriorInformation),
    ConfigurationData { location: PathBuf },
    SampleCentred(SampleCentred),
    CollectionDone(CollectionDone),
    SelectedLattice(SelectedLattice),
    CentringDone(CentringDone),
    ReadyForCentring,
    /// The operator declined; the engine should stop the workflow
    Cancelled,
}

/// Response delivered to a reply slot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub response: Option<WorkflowResponse>,
    pub correlation_id: Option<String>,
}

/// One undecoded inbound message.
#[derive(Debug)]
pub struct Envelope {
    pub kind: String,
    pub payload: Value,
    pub correlation_id: Option<String>,
    pub reply: Option<oneshot::Sender<Reply>>,
}

impl Envelope {
    /// A message nobody waits on.
    pub fn new(kind: impl Into<String>, payload: Value, correlation_id: Option<String>) -> Self {
        Self {
            kind: kind.into(),
            payload,
            correlation_id,
            reply: None,
        }
    }

    /// A message with a reply slot.
    pub fn with_reply(
        kind: impl Into<String>,
        payload: Value,
        correlation_id: Option<String>,
    ) -> (Self, oneshot::Receiver<Reply>) {
        let (tx, rx) = oneshot::channel();
        let mut envelope = Self::new(kind, payload, correlation_id);
        envelope.reply = Some(tx);
        (envelope, rx)
    }
}

/// Item on the inbound queue.
#[derive(Debug)]
pub enum Inbound {
    Message(Envelope),
    /// Ends the dispatch loop
    Stop,
}

/// Events broadcast by the controller.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum WorkflowEvent {
    StateChanged {
        from: WorkflowState,
        to: WorkflowState,
    },
    QueueExecutionFailed {
        task: String,
        reason: String,
    },
    WorkflowFinished {
        state: WorkflowState,
    },
}

/// Sending half of the inbound queue.
#[derive(Clone, Debug)]
pub struct MessageSender {
    tx: mpsc::UnboundedSender<Inbound>,
}

impl MessageSender {
    pub fn new(tx: mpsc::UnboundedSender<Inbound>) -> Self {
        Self { tx }
    }

    /// Queues a message; false when the controller has gone away.
    pub fn send(&self, envelope: Envelope) -> bool {
        self.tx.send(Inbound::Message(envelope)).is_ok()
    }

    /// Helper to queue a message and get its reply slot
    pub fn request(
        &self,
        kind: impl Into<String>,
        payload: Value,
        correlation_id: Option<String>,
    ) -> AppResult<oneshot::Receiver<Reply>> {
        let (envelope, rx) = Envelope::with_reply(kind, payload, correlation_id);
        if self.send(envelope) {
            Ok(rx)
        } else {
            Err(WorkflowError::NoSession)
        }
    }

    /// Helper to queue a message without a reply slot
    pub fn notify(&self, kind: impl Into<String>, payload: Value, correlation_id: Option<String>) -> bool {
        self.send(Envelope::new(kind, payload, correlation_id))
    }

    /// Queues the stop sentinel.
    pub fn stop(&self) -> bool {
        self.tx.send(Inbound::Stop).is_ok()
    }

    pub(crate) fn downgrade(&self) -> mpsc::WeakUnboundedSender<Inbound> {
        self.tx.downgrade()
    }
}

/// Creates the inbound queue.
pub fn channel() -> (MessageSender, mpsc::UnboundedReceiver<Inbound>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (MessageSender::new(tx), rx)
}
