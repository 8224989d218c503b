//! Errors from turning configuration into stacks.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StackError {
    #[error(transparent)]
    Config(#[from] agentstack_config::ConfigError),

    #[error(transparent)]
    Core(#[from] agentstack_core::Error),
}

pub type StackResult<T> = std::result::Result<T, StackError>;
