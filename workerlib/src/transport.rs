use crate::container::ExecOutput;
use crate::errors::{Result, WorkerError};
use crate::events::JobStatus;
use crate::job::Coordinator;
use crate::types::UploadStats;

use async_trait::async_trait;
use chrono::Utc;
use protobuf::api_service_client::ApiServiceClient;
use protobuf::{
    job_status_update, online_status, transfer_status, Chunk, JobStatusUpdate, OnlineStatus,
    OutputChunk,
};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Channel, ClientTlsConfig};
use tonic::Request;

/// Cadence of the online check stream.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

/// Size of one upload chunk on the wire.
pub const UPLOAD_CHUNK_SIZE: usize = 1024;

// the coordinator's server certificate is always issued for this name
const TLS_DOMAIN: &str = "localhost";

/// Connection settings for the coordinator.
#[derive(Clone, Debug, Default)]
pub struct ClientConfig {
    /// Address of the coordinator, e.g. `http://ci.internal:50051`.
    pub address: String,
    /// Root CA certificate to verify the coordinator with. Plaintext when
    /// unset.
    pub root_certificate: Option<PathBuf>,
    /// Compress outbound messages with gzip.
    pub compress: bool,
}

/// Handle on the worker's one connection to the coordinator. Cloning is
/// cheap: every clone multiplexes its calls over the same channel.
#[derive(Clone, Debug)]
pub struct CoordinatorClient {
    inner: ApiServiceClient<Channel>,
}

impl CoordinatorClient {
    /// Validate `config` and set up the channel. The dial itself is lazy,
    /// so a handle coming back only means the local setup succeeded.
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        if config.address.is_empty() {
            return Err(WorkerError::Configuration(
                "coordinator address is empty".to_string(),
            ));
        }
        let mut endpoint = Channel::from_shared(config.address.clone()).map_err(|err| {
            WorkerError::Configuration(format!(
                "bad coordinator address {:?}: {}",
                config.address, err
            ))
        })?;
        if let Some(path) = &config.root_certificate {
            let pem = tokio::fs::read(path).await.map_err(WorkerError::Credential)?;
            let tls = ClientTlsConfig::new()
                .domain_name(TLS_DOMAIN)
                .ca_certificate(Certificate::from_pem(pem));
            endpoint = endpoint
                .tls_config(tls)
                .map_err(|source| WorkerError::Connection {
                    addr: config.address.clone(),
                    source,
                })?;
        }
        let channel = endpoint.connect_lazy();
        let mut inner = ApiServiceClient::new(channel);
        if config.compress {
            inner = inner.send_gzip();
        }
        Ok(Self { inner })
    }

    /// Tell the coordinator this worker is up, once per interval, until
    /// `shutdown` fires or the call ends. A server-side or transport end
    /// of the stream is an error worth restarting over; cancellation is a
    /// clean return.
    pub async fn stream_online_status(&self, shutdown: CancellationToken) -> Result<()> {
        let (beat_tx, beat_rx) = mpsc::channel(1);
        let pump = tokio::spawn(pump_online_status(beat_tx, HEARTBEAT_INTERVAL));
        let mut inner = self.inner.clone();
        let call = inner.online_check(Request::new(ReceiverStream::new(beat_rx)));
        tokio::pin!(call);
        let result = tokio::select! {
            response = &mut call => match response {
                // the pump never closes the stream itself, so a finished
                // call means the coordinator hung up on us
                Ok(_) => Err(WorkerError::Transport(tonic::Status::aborted(
                    "online stream closed by the coordinator",
                ))),
                Err(status) => Err(WorkerError::from(status)),
            },
            _ = shutdown.cancelled() => Ok(()),
        };
        pump.abort();
        result
    }

    /// Stream the file at `path` to the coordinator in fixed-size chunks.
    /// Stats come back only when the whole transfer succeeded and the
    /// coordinator acknowledged it.
    pub async fn upload_file(&self, path: &Path) -> Result<UploadStats> {
        let mut file = File::open(path).await?;
        let started_at = Utc::now();
        let (chunk_tx, chunk_rx) = mpsc::channel::<Chunk>(1);
        let (done_tx, done_rx) = oneshot::channel::<io::Result<u64>>();
        tokio::spawn(async move {
            let mut sent: u64 = 0;
            let mut buf = vec![0u8; UPLOAD_CHUNK_SIZE];
            let outcome = loop {
                match file.read(&mut buf).await {
                    Ok(0) => break Ok(sent),
                    Ok(n) => {
                        let chunk = Chunk {
                            content: buf[..n].to_vec(),
                        };
                        if chunk_tx.send(chunk).await.is_err() {
                            // the call went away, nothing left to feed
                            break Ok(sent);
                        }
                        sent += n as u64;
                    }
                    Err(err) => break Err(err),
                }
            };
            let _ = done_tx.send(outcome);
        });
        let mut inner = self.inner.clone();
        let response = inner
            .upload(Request::new(ReceiverStream::new(chunk_rx)))
            .await;
        // a local read failure outranks whatever the wire did
        let bytes_sent = done_rx.await.expect("upload reader exited")?;
        let status = response?.into_inner();
        if status.code() != transfer_status::Code::Ok {
            return Err(WorkerError::RemoteRejected);
        }
        Ok(UploadStats {
            started_at,
            finished_at: Utc::now(),
            bytes_sent,
        })
    }

    /// Relay one formatted line of output for a container.
    pub async fn write_container_output(&self, container_id: &str, text: &str) -> Result<()> {
        let chunk = OutputChunk {
            container_id: container_id.to_string(),
            content: text.as_bytes().to_vec(),
        };
        let mut inner = self.inner.clone();
        inner
            .container_output(Request::new(futures::stream::iter(vec![chunk])))
            .await?;
        Ok(())
    }

    /// Relay a live output feed for a container, chunk by chunk as it
    /// arrives.
    pub async fn stream_container_output(
        &self,
        container_id: &str,
        mut output: ExecOutput,
    ) -> Result<()> {
        use futures::StreamExt;

        let (chunk_tx, chunk_rx) = mpsc::channel::<OutputChunk>(16);
        let (done_tx, done_rx) = oneshot::channel::<Result<()>>();
        let container_id_owned = container_id.to_string();
        tokio::spawn(async move {
            let outcome = loop {
                match output.next().await {
                    Some(Ok(bytes)) => {
                        let chunk = OutputChunk {
                            container_id: container_id_owned.clone(),
                            content: bytes.to_vec(),
                        };
                        if chunk_tx.send(chunk).await.is_err() {
                            break Ok(());
                        }
                    }
                    Some(Err(err)) => break Err(err),
                    None => break Ok(()),
                }
            };
            let _ = done_tx.send(outcome);
        });
        let mut inner = self.inner.clone();
        let response = inner
            .container_output(Request::new(ReceiverStream::new(chunk_rx)))
            .await;
        // surface a dying source before any transport complaint
        done_rx.await.expect("output forwarder exited")?;
        response?;
        Ok(())
    }

    /// Report a job lifecycle transition.
    pub async fn report_job_status(&self, name: &str, status: JobStatus) -> Result<()> {
        let update = JobStatusUpdate {
            name: name.to_string(),
            status: wire_status(status) as i32,
        };
        let mut inner = self.inner.clone();
        inner.report_job_status(Request::new(update)).await?;
        Ok(())
    }

    /// Consume the handle. The underlying channel shuts down once the
    /// last clone is gone.
    pub fn disconnect(self) {}
}

#[async_trait]
impl Coordinator for CoordinatorClient {
    async fn write_output(&self, container_id: &str, text: &str) -> Result<()> {
        self.write_container_output(container_id, text).await
    }

    async fn stream_output(&self, container_id: &str, output: ExecOutput) -> Result<()> {
        self.stream_container_output(container_id, output).await
    }

    async fn report_status(&self, name: &str, status: JobStatus) -> Result<()> {
        self.report_job_status(name, status).await
    }
}

/// Send one up beat immediately, then one per `period`, until every
/// receiver is gone.
async fn pump_online_status(tx: mpsc::Sender<OnlineStatus>, period: Duration) {
    let mut interval = tokio::time::interval(period);
    loop {
        interval.tick().await;
        let beat = OnlineStatus {
            code: online_status::Code::Up as i32,
        };
        if tx.send(beat).await.is_err() {
            break;
        }
    }
}

fn wire_status(status: JobStatus) -> job_status_update::Status {
    match status {
        JobStatus::Running => job_status_update::Status::Running,
        JobStatus::Passing => job_status_update::Status::Passing,
        JobStatus::Stopped => job_status_update::Status::Stopped,
        JobStatus::Failing => job_status_update::Status::Failing,
    }
}
