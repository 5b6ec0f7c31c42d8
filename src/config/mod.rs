//! Workflow Configuration System
//!
//! This module provides configuration management for the workflow controller
//! using Figment.
//!
//! # Configuration Sources
//!
//! Configuration is loaded from (in order of precedence):
//! 1. Environment variables prefixed with `BEAMLINE_WF_`
//! 2. TOML configuration file (default: `config/workflow.toml`)
//! 3. Built-in defaults
//!
//! # Example
//!
//! ```no_run
//! use beamline_workflow::config::WorkflowConfig;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Load from default location
//!     let config = WorkflowConfig::load()?;
//!
//!     // Or load from custom location
//!     let config = WorkflowConfig::load_from("custom/workflow.toml")?;
//!
//!     println!("Decay limit: {}%", config.dose.decay_limit);
//!     println!("Multi-trigger: {}", config.acquisition.use_multitrigger);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Environment Variables
//!
//! Any configuration value can be overridden via environment variables with the
//! `BEAMLINE_WF_` prefix and key path separated by double underscores:
//!
//! ```text
//! # Set log level
//! BEAMLINE_WF_APPLICATION__LOG_LEVEL=debug
//!
//! # Enable multi-trigger compression
//! BEAMLINE_WF_ACQUISITION__USE_MULTITRIGGER=true
//! ```

pub mod workflow_config;

pub use workflow_config::{
    AcquisitionConfig, ApplicationConfig, ConfigError, DoseConfig, RecentringConfig,
    SolverConfig, TranslationalCalibration, WorkflowConfig,
};
