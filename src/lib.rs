#![forbid(unsafe_code)]

//! `agent-relay`: execution and session orchestration for a remotely
//! driven AI coding backend.

pub mod backend;
pub mod config;
pub mod errors;
pub mod models;
pub mod orchestrator;
pub mod persistence;
pub mod policy;
pub mod stream;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};
pub use orchestrator::gateway::ExecutionGateway;
