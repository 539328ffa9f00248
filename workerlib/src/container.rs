mod docker;

pub use docker::DockerEngine;

use crate::errors::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;

/// Live output of a command running inside a container.
pub type ExecOutput = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// The container runtime operations the job engine needs. Kept narrow so
/// tests can stand in a recording fake for the real daemon.
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Create a container from `image`, named after the job. Returns the
    /// runtime's container id.
    async fn create(&self, name: &str, image: &str) -> Result<String>;

    async fn is_running(&self, id: &str) -> Result<bool>;

    async fn start(&self, id: &str) -> Result<()>;

    /// Run `argv` inside the container under a pseudo-terminal. Returns
    /// the output feed and the exec id to inspect once it drains.
    async fn exec(&self, id: &str, argv: &[String]) -> Result<(ExecOutput, String)>;

    async fn exit_code(&self, exec_id: &str) -> Result<i64>;

    /// Force-remove the container, running or not.
    async fn remove(&self, id: &str) -> Result<()>;
}

// compile-time check that the trait stays object safe
const _: () = {
    fn _assert_object_safe(_: &dyn ContainerEngine) {}
};
