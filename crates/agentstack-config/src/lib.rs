//! KDL configuration parsing for AgentStack.
//!
//! This crate handles parsing of:
//! - App definitions (agentstack.kdl)
//! - Account/region environment resolution
//! - Variable interpolation

pub mod app;
pub mod error;
pub mod variables;

pub use app::{
    AppConfig, ArtifactLocation, FoundationConfig, RuntimeConfig, parse_app_config,
    parse_app_config_with,
};
pub use error::{ConfigError, ConfigResult};
pub use variables::{VariableContext, VariableContextBuilder};
