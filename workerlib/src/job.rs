use crate::container::{ContainerEngine, ExecOutput};
use crate::errors::Result;
use crate::events::{ExecOutcome, JobStatus};
use crate::types::{tokenize, JobTask};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// The coordinator-side sinks a running job reports into. The transport
/// client implements this; tests swap in a recorder.
#[async_trait]
pub trait Coordinator: Send + Sync {
    async fn write_output(&self, container_id: &str, text: &str) -> Result<()>;
    async fn stream_output(&self, container_id: &str, output: ExecOutput) -> Result<()>;
    async fn report_status(&self, name: &str, status: JobStatus) -> Result<()>;
}

/// Runs one job at a time: a container per job, the job's commands in
/// order inside it, output and lifecycle relayed as they happen.
pub struct JobRunner<E, C> {
    engine: E,
    coordinator: C,
}

impl<E: ContainerEngine, C: Coordinator> JobRunner<E, C> {
    pub fn new(engine: E, coordinator: C) -> Self {
        Self {
            engine,
            coordinator,
        }
    }

    /// Execute `task` to completion and report the terminal status. The
    /// container is removed on every path once it exists, whatever the
    /// commands or the relay did.
    pub async fn run(&self, task: &JobTask, shutdown: &CancellationToken) -> Result<JobStatus> {
        let commands: Vec<Vec<String>> = task.commands.iter().map(|line| tokenize(line)).collect();
        let container_id = self.engine.create(&task.name, &task.image).await?;
        let result = self
            .execute(&task.name, &container_id, &commands, shutdown)
            .await;
        let cleanup = self.engine.remove(&container_id).await;
        match (result, cleanup) {
            (Ok(status), Ok(())) => Ok(status),
            (Ok(_), Err(err)) => Err(err),
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(cleanup_err)) => {
                tracing::warn!(error = %cleanup_err, "container removal failed during error cleanup");
                Err(err)
            }
        }
    }

    async fn execute(
        &self,
        name: &str,
        container_id: &str,
        commands: &[Vec<String>],
        shutdown: &CancellationToken,
    ) -> Result<JobStatus> {
        self.coordinator
            .report_status(name, JobStatus::Running)
            .await?;

        let mut outcome = ExecOutcome::Success;
        let mut last_command = String::new();
        for argv in commands {
            // cancellation is observed between commands, never inside one
            if shutdown.is_cancelled() {
                outcome = ExecOutcome::Killed;
                break;
            }
            // a previous command may have stopped the container
            if !self.engine.is_running(container_id).await? {
                self.engine.start(container_id).await?;
            }
            last_command = argv.join(" ");
            let banner = format!("\x1b[33;1m==> {}\x1b[0m", last_command);
            self.coordinator.write_output(container_id, &banner).await?;
            let (output, exec_id) = self.engine.exec(container_id, argv).await?;
            self.coordinator.stream_output(container_id, output).await?;
            let code = self.engine.exit_code(&exec_id).await?;
            outcome = ExecOutcome::from_exit_code(code);
            if outcome != ExecOutcome::Success {
                break;
            }
        }

        let closing = match outcome {
            ExecOutcome::Success => format!(
                "\n\x1b[32;1mThe command \"{}\" exited with 0.\x1b[0m",
                last_command
            ),
            ExecOutcome::Killed => {
                "\n\x1b[31;1mJob stopped with exit code 137.\x1b[0m".to_string()
            }
            ExecOutcome::Failed(code) => format!(
                "\n\x1b[31;1mThe command \"{}\" exited with {}.\x1b[0m",
                last_command, code
            ),
        };
        self.coordinator
            .write_output(container_id, &closing)
            .await?;

        let status = outcome.job_status();
        self.coordinator.report_status(name, status).await?;
        Ok(status)
    }

    /// Out-of-band job cancellation: tear the container down and let the
    /// in-flight exec die with it. No status, no output.
    pub async fn stop(&self, container_id: &str) -> Result<()> {
        self.engine.remove(container_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::WorkerError;

    use bytes::Bytes;
    use futures::{stream, StreamExt};
    use std::collections::VecDeque;
    use std::io;
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct FakeEngine {
        calls: Arc<Mutex<Vec<String>>>,
        exit_codes: Arc<Mutex<VecDeque<i64>>>,
        running: Arc<Mutex<bool>>,
        stays_up: bool,
        fail_create: bool,
        fail_remove: bool,
        cancel_on_exec: Option<CancellationToken>,
    }

    impl FakeEngine {
        fn with_exit_codes(codes: &[i64]) -> Self {
            Self {
                exit_codes: Arc::new(Mutex::new(codes.iter().copied().collect())),
                stays_up: true,
                ..Default::default()
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn exec_count(&self) -> usize {
            self.calls()
                .iter()
                .filter(|call| call.starts_with("exec"))
                .count()
        }
    }

    #[async_trait]
    impl ContainerEngine for FakeEngine {
        async fn create(&self, name: &str, image: &str) -> Result<String> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("create {} {}", name, image));
            if self.fail_create {
                return Err(io::Error::new(io::ErrorKind::Other, "daemon unreachable").into());
            }
            Ok(format!("ctr-{}", name))
        }

        async fn is_running(&self, id: &str) -> Result<bool> {
            self.calls.lock().unwrap().push(format!("inspect {}", id));
            Ok(*self.running.lock().unwrap())
        }

        async fn start(&self, id: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("start {}", id));
            *self.running.lock().unwrap() = self.stays_up;
            Ok(())
        }

        async fn exec(&self, id: &str, argv: &[String]) -> Result<(ExecOutput, String)> {
            let exec_id = {
                let mut calls = self.calls.lock().unwrap();
                calls.push(format!("exec {} {}", id, argv.join(" ")));
                format!("x{}", calls.len())
            };
            if let Some(token) = &self.cancel_on_exec {
                token.cancel();
            }
            let output: ExecOutput =
                Box::pin(stream::iter(vec![Ok(Bytes::from_static(b"ok\r\n"))]));
            Ok((output, exec_id))
        }

        async fn exit_code(&self, _exec_id: &str) -> Result<i64> {
            Ok(self.exit_codes.lock().unwrap().pop_front().unwrap_or(0))
        }

        async fn remove(&self, id: &str) -> Result<()> {
            self.calls.lock().unwrap().push(format!("remove {}", id));
            if self.fail_remove {
                return Err(io::Error::new(io::ErrorKind::Other, "remove refused").into());
            }
            Ok(())
        }
    }

    #[derive(Clone, Default)]
    struct FakeSink {
        events: Arc<Mutex<Vec<String>>>,
        fail_status: bool,
    }

    impl FakeSink {
        fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }

        fn statuses(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter(|event| event.starts_with("status"))
                .collect()
        }
    }

    #[async_trait]
    impl Coordinator for FakeSink {
        async fn write_output(&self, _container_id: &str, text: &str) -> Result<()> {
            self.events.lock().unwrap().push(format!("line {}", text));
            Ok(())
        }

        async fn stream_output(&self, _container_id: &str, mut output: ExecOutput) -> Result<()> {
            let mut collected = Vec::new();
            while let Some(blob) = output.next().await {
                collected.extend_from_slice(&blob?);
            }
            self.events
                .lock()
                .unwrap()
                .push(format!("stream {}", String::from_utf8_lossy(&collected)));
            Ok(())
        }

        async fn report_status(&self, _name: &str, status: JobStatus) -> Result<()> {
            if self.fail_status {
                return Err(io::Error::new(io::ErrorKind::Other, "coordinator gone").into());
            }
            self.events
                .lock()
                .unwrap()
                .push(format!("status {:?}", status));
            Ok(())
        }
    }

    fn task(commands: &[&str]) -> JobTask {
        JobTask {
            name: "build-42".to_string(),
            image: "alpine:3".to_string(),
            commands: commands.iter().map(|c| c.to_string()).collect(),
        }
    }

    #[tokio::test]
    async fn passing_run_relays_everything_in_order() {
        let engine = FakeEngine::with_exit_codes(&[0, 0]);
        let sink = FakeSink::default();
        let runner = JobRunner::new(engine.clone(), sink.clone());

        let status = runner
            .run(&task(&["echo one", "echo two"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(status, JobStatus::Passing);
        assert_eq!(
            sink.events(),
            vec![
                "status Running".to_string(),
                "line \x1b[33;1m==> echo one\x1b[0m".to_string(),
                "stream ok\r\n".to_string(),
                "line \x1b[33;1m==> echo two\x1b[0m".to_string(),
                "stream ok\r\n".to_string(),
                "line \n\x1b[32;1mThe command \"echo two\" exited with 0.\x1b[0m".to_string(),
                "status Passing".to_string(),
            ]
        );
        // container came up once and went away at the end
        let calls = engine.calls();
        assert_eq!(calls.first().unwrap(), "create build-42 alpine:3");
        assert_eq!(calls.last().unwrap(), "remove ctr-build-42");
        assert_eq!(calls.iter().filter(|c| c.starts_with("start")).count(), 1);
    }

    #[tokio::test]
    async fn first_failure_skips_the_remaining_commands() {
        let engine = FakeEngine::with_exit_codes(&[0, 2, 0]);
        let sink = FakeSink::default();
        let runner = JobRunner::new(engine.clone(), sink.clone());

        let status = runner
            .run(
                &task(&["make all", "make test", "make package"]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(status, JobStatus::Failing);
        assert_eq!(engine.exec_count(), 2);
        assert_eq!(
            sink.statuses(),
            vec!["status Running".to_string(), "status Failing".to_string()]
        );
        assert!(sink
            .events()
            .iter()
            .any(|e| e.contains("The command \"make test\" exited with 2.")));
        assert_eq!(engine.calls().last().unwrap(), "remove ctr-build-42");
    }

    #[tokio::test]
    async fn kill_exit_code_reports_stopped() {
        let engine = FakeEngine::with_exit_codes(&[137]);
        let sink = FakeSink::default();
        let runner = JobRunner::new(engine.clone(), sink.clone());

        let status = runner
            .run(&task(&["sleep 600"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(status, JobStatus::Stopped);
        assert!(sink
            .events()
            .iter()
            .any(|e| e.contains("Job stopped with exit code 137.")));
        assert_eq!(
            sink.statuses(),
            vec!["status Running".to_string(), "status Stopped".to_string()]
        );
    }

    #[tokio::test]
    async fn create_failure_aborts_before_any_status() {
        let engine = FakeEngine {
            fail_create: true,
            ..Default::default()
        };
        let sink = FakeSink::default();
        let runner = JobRunner::new(engine.clone(), sink.clone());

        let err = runner
            .run(&task(&["echo hi"]), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, WorkerError::Io(_)));
        assert!(sink.events().is_empty());
        // nothing to clean up, the container never existed
        assert!(!engine.calls().iter().any(|c| c.starts_with("remove")));
    }

    #[tokio::test]
    async fn restarts_the_container_when_a_command_left_it_stopped() {
        let engine = FakeEngine {
            exit_codes: Arc::new(Mutex::new([0, 0].into_iter().collect())),
            stays_up: false,
            ..Default::default()
        };
        let sink = FakeSink::default();
        let runner = JobRunner::new(engine.clone(), sink.clone());

        runner
            .run(&task(&["true", "true"]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            engine.calls().iter().filter(|c| c.starts_with("start")).count(),
            2
        );
    }

    #[tokio::test]
    async fn cancelled_before_the_first_command_reports_stopped() {
        let engine = FakeEngine::with_exit_codes(&[]);
        let sink = FakeSink::default();
        let runner = JobRunner::new(engine.clone(), sink.clone());
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let status = runner
            .run(&task(&["echo never"]), &shutdown)
            .await
            .unwrap();

        assert_eq!(status, JobStatus::Stopped);
        assert_eq!(engine.exec_count(), 0);
        assert_eq!(engine.calls().last().unwrap(), "remove ctr-build-42");
    }

    #[tokio::test]
    async fn cancellation_is_observed_between_commands() {
        let shutdown = CancellationToken::new();
        let engine = FakeEngine {
            exit_codes: Arc::new(Mutex::new([0, 0].into_iter().collect())),
            stays_up: true,
            cancel_on_exec: Some(shutdown.clone()),
            ..Default::default()
        };
        let sink = FakeSink::default();
        let runner = JobRunner::new(engine.clone(), sink.clone());

        let status = runner
            .run(&task(&["echo one", "echo two"]), &shutdown)
            .await
            .unwrap();

        // the first command finishes, the second never starts
        assert_eq!(status, JobStatus::Stopped);
        assert_eq!(engine.exec_count(), 1);
    }

    #[tokio::test]
    async fn empty_command_list_still_passes() {
        let engine = FakeEngine::with_exit_codes(&[]);
        let sink = FakeSink::default();
        let runner = JobRunner::new(engine.clone(), sink.clone());

        let status = runner
            .run(&task(&[]), &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(status, JobStatus::Passing);
        assert!(sink
            .events()
            .iter()
            .any(|e| e.contains("The command \"\" exited with 0.")));
    }

    #[tokio::test]
    async fn removal_failure_surfaces_after_a_clean_run() {
        let engine = FakeEngine {
            exit_codes: Arc::new(Mutex::new([0].into_iter().collect())),
            stays_up: true,
            fail_remove: true,
            ..Default::default()
        };
        let sink = FakeSink::default();
        let runner = JobRunner::new(engine.clone(), sink.clone());

        let err = runner
            .run(&task(&["echo hi"]), &CancellationToken::new())
            .await
            .unwrap_err();

        // the job itself finished and said so before cleanup went wrong
        assert!(matches!(err, WorkerError::Io(_)));
        assert_eq!(
            sink.statuses(),
            vec!["status Running".to_string(), "status Passing".to_string()]
        );
    }

    #[tokio::test]
    async fn a_failed_run_outranks_a_failed_removal() {
        let engine = FakeEngine {
            exit_codes: Arc::new(Mutex::new([0].into_iter().collect())),
            stays_up: true,
            fail_remove: true,
            ..Default::default()
        };
        let sink = FakeSink {
            fail_status: true,
            ..Default::default()
        };
        let runner = JobRunner::new(engine.clone(), sink.clone());

        let err = runner
            .run(&task(&["echo hi"]), &CancellationToken::new())
            .await
            .unwrap_err();

        // the run's own failure comes back; the removal failure is only logged
        assert!(err.to_string().contains("coordinator gone"));
        assert_eq!(engine.calls().last().unwrap(), "remove ctr-build-42");
    }

    #[tokio::test]
    async fn status_failure_still_removes_the_container() {
        let engine = FakeEngine::with_exit_codes(&[0]);
        let sink = FakeSink {
            fail_status: true,
            ..Default::default()
        };
        let runner = JobRunner::new(engine.clone(), sink.clone());

        let err = runner
            .run(&task(&["echo hi"]), &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, WorkerError::Io(_)));
        assert_eq!(engine.calls().last().unwrap(), "remove ctr-build-42");
    }

    #[tokio::test]
    async fn stop_only_removes_the_container() {
        let engine = FakeEngine::default();
        let sink = FakeSink::default();
        let runner = JobRunner::new(engine.clone(), sink.clone());

        runner.stop("ctr-adhoc").await.unwrap();

        assert_eq!(engine.calls(), vec!["remove ctr-adhoc".to_string()]);
        assert!(sink.events().is_empty());
    }
}
