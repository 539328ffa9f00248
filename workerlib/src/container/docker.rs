use super::{ContainerEngine, ExecOutput};
use crate::errors::Result;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures::{stream, StreamExt};

/// Container engine backed by the local Docker daemon.
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// Connect over the default unix socket.
    pub fn new() -> Result<Self> {
        let docker = Docker::connect_with_unix_defaults()?;
        Ok(Self { docker })
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = pull.next().await {
            progress?;
        }
        Ok(())
    }
}

fn image_missing(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn create(&self, name: &str, image: &str) -> Result<String> {
        let options = CreateContainerOptions {
            name: name.to_string(),
            ..Default::default()
        };
        // tty + open stdin keep the container's shell idle between execs
        let config = Config {
            image: Some(image.to_string()),
            tty: Some(true),
            open_stdin: Some(true),
            ..Default::default()
        };
        let created = match self
            .docker
            .create_container(Some(options.clone()), config.clone())
            .await
        {
            Ok(created) => created,
            Err(err) if image_missing(&err) => {
                tracing::info!(%image, "image not present locally, pulling");
                self.pull_image(image).await?;
                self.docker.create_container(Some(options), config).await?
            }
            Err(err) => return Err(err.into()),
        };
        Ok(created.id)
    }

    async fn is_running(&self, id: &str) -> Result<bool> {
        let inspect = self.docker.inspect_container(id, None).await?;
        Ok(inspect
            .state
            .and_then(|state| state.running)
            .unwrap_or(false))
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn exec(&self, id: &str, argv: &[String]) -> Result<(ExecOutput, String)> {
        let options = CreateExecOptions {
            cmd: Some(argv.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(true),
            ..Default::default()
        };
        let created = self.docker.create_exec(id, options).await?;
        let output: ExecOutput = match self.docker.start_exec(&created.id, None).await? {
            StartExecResults::Attached { output, .. } => {
                Box::pin(output.map(|item| match item {
                    Ok(log) => Ok(log.into_bytes()),
                    Err(err) => Err(err.into()),
                }))
            }
            StartExecResults::Detached => Box::pin(stream::empty()),
        };
        Ok((output, created.id))
    }

    async fn exit_code(&self, exec_id: &str) -> Result<i64> {
        let inspect = self.docker.inspect_exec(exec_id).await?;
        Ok(inspect.exit_code.unwrap_or(0))
    }

    async fn remove(&self, id: &str) -> Result<()> {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }
}
