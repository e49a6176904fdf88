//! Subprocess execution context: a worker program over piped stdio.
//!
//! stdin carries `SendMessage` frames to the child, stdout carries
//! `ReturnMessage` frames back, stderr is inherited so the worker's logs
//! land next to the controller's.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use serde_json::Value;
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{ContextEvent, QueueContext, SpawnError, SpawnedContext, WorkerSpawner};
use crate::bridge::protocol::ReturnMessage;
use crate::bridge::transport::{WORKER_DATA_ENV, read_frames, write_frames};

/// How to start a worker program.
#[derive(Debug, Clone)]
pub struct ProgramSpec {
    pub program: PathBuf,
    pub args: Vec<OsString>,
    pub env: Vec<(OsString, OsString)>,
}

impl ProgramSpec {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    fn command(&self, initial_data: &Value) -> Result<Command, SpawnError> {
        let data = serde_json::to_string(initial_data)
            .map_err(|e| SpawnError::Other(format!("worker data is not serializable: {}", e)))?;

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .envs(self.env.iter().map(|(k, v)| (k, v)))
            .env(WORKER_DATA_ENV, data)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true);
        Ok(cmd)
    }
}

/// Spawns one child process per context.
pub struct ProcessSpawner {
    spec: ProgramSpec,
}

impl ProcessSpawner {
    pub fn new(spec: ProgramSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &ProgramSpec {
        &self.spec
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&self, initial_data: &Value) -> Result<SpawnedContext, SpawnError> {
        let mut child = self.spec.command(initial_data)?.spawn()?;
        let pid = child.id();
        tracing::info!(program = %self.spec.program.display(), ?pid, "Spawned worker process");

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SpawnError::Other("stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpawnError::Other("stdout not captured".to_string()))?;

        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let kill = CancellationToken::new();
        let exited = CancellationToken::new();

        let kill_for_writer = kill.clone();
        tokio::spawn(async move {
            if let Err(e) = write_frames(stdin, in_rx, kill_for_writer).await {
                tracing::debug!(?pid, error = %e, "Worker stdin closed");
            }
        });

        let kill_for_pump = kill.clone();
        let exited_for_pump = exited.clone();
        tokio::spawn(async move {
            let read = read_frames::<_, ReturnMessage, _>(stdout, |item| {
                let event = match item {
                    Ok(envelope) => ContextEvent::Message(envelope),
                    Err(diagnostic) => ContextEvent::Diagnostic(diagnostic),
                };
                events_tx.send(event).is_ok()
            });

            // a corrupt stream cannot be resynchronized, so it ends the worker
            let mut killed = tokio::select! {
                result = read => match result {
                    Ok(()) => {
                        tracing::debug!(?pid, "Worker stdout closed");
                        false
                    }
                    Err(e) => {
                        tracing::error!(?pid, error = %e, "Worker stdout error");
                        true
                    }
                },
                _ = kill_for_pump.cancelled() => true,
            };

            if !killed {
                killed = tokio::select! {
                    biased;
                    _ = kill_for_pump.cancelled() => true,
                    _ = child.wait() => false,
                };
            }

            if killed {
                tracing::debug!(?pid, "Killing worker process");
                if let Err(e) = child.start_kill() {
                    tracing::warn!(?pid, error = %e, "Failed to kill worker process");
                }
            }

            let code = match child.wait().await {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::error!(?pid, error = %e, "Failed to wait for worker process");
                    None
                }
            };
            tracing::info!(?pid, ?code, "Worker process exited");

            let _ = events_tx.send(ContextEvent::Exit { code });
            exited_for_pump.cancel();
        });

        Ok(SpawnedContext {
            context: Arc::new(QueueContext::new(in_tx, kill, exited)),
            events: events_rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn program_spec_builder_collects_args_and_env() {
        let spec = ProgramSpec::new("/bin/worker")
            .arg("--fast")
            .args(["a", "b"])
            .env("MODE", "test");
        assert_eq!(spec.program, PathBuf::from("/bin/worker"));
        assert_eq!(
            spec.args,
            vec![OsString::from("--fast"), OsString::from("a"), OsString::from("b")]
        );
        assert_eq!(spec.env, vec![(OsString::from("MODE"), OsString::from("test"))]);
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let spawner = ProcessSpawner::new(ProgramSpec::new("/nonexistent/tether-worker"));
        let err = spawner.spawn(&json!(null)).err().expect("spawn should fail");
        assert!(matches!(err, SpawnError::Spawn(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unframed_stdout_kills_the_child() {
        // the child keeps running on stdin, so only the bad frame can end it
        let spawner = ProcessSpawner::new(
            ProgramSpec::new("sh")
                .arg("-c")
                .arg("printf 'hello world\\n'; cat >/dev/null"),
        );
        let SpawnedContext {
            context,
            mut events,
        } = spawner.spawn(&json!(null)).unwrap();

        let code = tokio::time::timeout(std::time::Duration::from_secs(10), async {
            loop {
                match events.recv().await {
                    Some(ContextEvent::Exit { code }) => break code,
                    Some(ContextEvent::Message(envelope)) => {
                        panic!("unexpected message {:?}", envelope.message)
                    }
                    Some(ContextEvent::Diagnostic(_)) => {}
                    None => panic!("event stream closed without exit"),
                }
            }
        })
        .await
        .expect("worker should be killed");

        assert_eq!(code, None);
        drop(context);
    }
}
