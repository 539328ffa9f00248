use std::{io, result};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("configuration: {0}")]
    Configuration(String),
    #[error("failed to load credentials: {0}")]
    Credential(#[source] io::Error),
    #[error("connection to {addr} failed: {source}")]
    Connection {
        addr: String,
        source: tonic::transport::Error,
    },
    #[error("transport failure: {0}")]
    Transport(#[from] tonic::Status),
    #[error("container runtime: {0}")]
    Runtime(#[from] bollard::errors::Error),
    #[error("i/o failure: {0}")]
    Io(#[from] io::Error),
    #[error("coordinator rejected the transfer")]
    RemoteRejected,
}

pub type Result<T> = result::Result<T, WorkerError>;
