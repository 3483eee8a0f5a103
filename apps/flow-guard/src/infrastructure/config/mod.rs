//! Configuration Module
//!
//! Configuration loading for the flow guard service.

mod settings;

pub use settings::{ConfigError, Environment, FlowGuardConfig, PaperSettings, ServerSettings};
