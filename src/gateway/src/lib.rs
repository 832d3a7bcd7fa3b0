use std::io;

use thiserror::Error;

pub mod buffer_pool;
pub mod config;
pub mod connection;
pub mod io_worker;
pub mod server;
pub mod transport;

pub use config::Config;
pub use connection::{Connection, ConnectionKind, MessageConnection, State};
pub use io_worker::{ConnectionId, ConnectionRef, IoWorker, IoWorkerHandle};
pub use server::{Gateway, HandshakeReply, MessageHandler, Server};

#[derive(Debug, Error)]
pub enum Error {
    #[error("IO: {0}.")]
    Io(#[from] io::Error),
    #[error("Function config: {0}.")]
    FuncConfig(#[from] faas_common::func_config::Error),
    #[error("Shared memory: {0}.")]
    Shm(#[from] ipc::shm::Error),
    #[error("IoWorker {0} exited during startup")]
    WorkerExited(usize),
    #[error("No listen address configured")]
    NoListenAddress,
}
