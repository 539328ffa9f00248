mod arg_parser;

use arg_parser::{ArgParser, SubCommand};
use clap::Parser;
use std::error;
use std::process;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use workerlib::container::DockerEngine;
use workerlib::job::JobRunner;
use workerlib::transport::{ClientConfig, CoordinatorClient};
use workerlib::{JobStatus, JobTask};

#[tokio::main]
async fn main() -> Result<(), Box<dyn error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = ArgParser::parse();
    let config = ClientConfig {
        address: args.server,
        root_certificate: args.root_cert,
        compress: args.compress,
    };
    let client = CoordinatorClient::connect(&config).await?;
    let shutdown = install_shutdown_handler();

    match args.sub_command {
        SubCommand::Serve => {
            tracing::info!(address = %config.address, "worker online");
            client.stream_online_status(shutdown).await?;
        }
        SubCommand::Run {
            name,
            image,
            commands,
            upload,
        } => {
            let heartbeat = {
                let client = client.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move { client.stream_online_status(shutdown).await })
            };
            let engine = DockerEngine::new()?;
            let runner = JobRunner::new(engine, client.clone());
            let task = JobTask {
                name,
                image,
                commands,
            };
            tracing::info!(job = %task.name, image = %task.image, "job accepted");
            let status = runner.run(&task, &shutdown).await?;
            tracing::info!(job = %task.name, ?status, "job finished");
            if status == JobStatus::Passing {
                if let Some(file) = upload {
                    let stats = client.upload_file(&file).await?;
                    tracing::info!(bytes = stats.bytes_sent, "artifact uploaded");
                }
            }
            shutdown.cancel();
            let _ = heartbeat.await;
            if status != JobStatus::Passing {
                process::exit(1);
            }
        }
        SubCommand::Upload { file } => {
            let stats = client.upload_file(&file).await?;
            let took = stats.finished_at - stats.started_at;
            println!(
                "Uploaded {} bytes in {} ms",
                stats.bytes_sent,
                took.num_milliseconds()
            );
        }
        SubCommand::Stop { container_id } => {
            let engine = DockerEngine::new()?;
            let runner = JobRunner::new(engine, client.clone());
            runner.stop(&container_id).await?;
            println!("Stopped container {}", container_id);
        }
    }

    client.disconnect();
    Ok(())
}

// flip a token when the process is told to go away
fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let handle = token.clone();
    tokio::spawn(async move {
        let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => tracing::info!("received SIGTERM, shutting down"),
            _ = sigint.recv() => tracing::info!("received SIGINT, shutting down"),
        }
        handle.cancel();
    });
    token
}
