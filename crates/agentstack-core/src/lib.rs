//! Core domain types and traits for AgentStack.
//!
//! This crate contains:
//! - ARN and deployment environment types
//! - Resource definitions (repository, identity, runtime)
//! - Permission statements and the policy assembler
//! - Artifact references
//! - Stack, output and value reference types
//! - The cross-stack export channel
//! - The provider trait used to materialize resources

pub mod arn;
pub mod artifact;
pub mod error;
pub mod exports;
pub mod id;
pub mod policy;
pub mod provider;
pub mod resource;
pub mod stack;

pub use arn::{Arn, Environment};
pub use error::{Error, Result};
pub use exports::CrossStackChannel;
pub use id::DeploymentId;
pub use policy::PolicyAssembler;
pub use stack::{Output, Stack, ValueRef};
