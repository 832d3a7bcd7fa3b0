//! Worker-side library: correlates the function calls a worker issues and
//! serves with their completions.
use thiserror::Error;

pub mod manager;

pub use manager::{Channel, Handle, Manager, ManagerConfig};

#[derive(Debug, Error)]
pub enum Error {
    #[error("Unknown function: {0}")]
    UnknownFunction(String),
    #[error("Shared memory: {0}.")]
    Shm(#[from] ipc::shm::Error),
    #[error("Manager is closed")]
    Closed,
    #[error("Function config: {0}.")]
    FuncConfig(#[from] faas_common::func_config::Error),
    #[error("Environment variable {0}: {1}")]
    Env(&'static str, String),
}
