//! Core library for the beamline strategy workflow.
//!
//! The workflow controller sits between a beamline control system and an
//! external crystallographic strategy engine. The engine sends strategy
//! decisions (sweep plans, lattice candidates, centring requests) over a
//! correlation-tagged message protocol; the controller turns them into
//! sample centrings and acquisition tasks, tracks the radiation dose the
//! sample has received, and answers each message.
//!
//! Hardware, the task queue and the operator are reached only through the
//! traits in [`beamline`]; mock implementations drive the tests and the
//! emulation binary.

pub mod beamline;
pub mod collection;
pub mod config;
pub mod controller;
pub mod dose;
pub mod error;
pub mod lattice;
pub mod logging;
pub mod messages;
pub mod model;
pub mod parameter;
pub mod recentring;
pub mod session;
pub mod tasks;
