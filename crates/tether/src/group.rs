//! Spawns execution contexts and tracks the channels wired to them.

use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::join_all;
use serde_json::Value;

use crate::context::{
    InProcessSpawner, ProcessSpawner, ProgramSpec, SpawnError, WorkerSpawner,
};
use crate::controller::{ChannelConfig, ChannelId, ControllerChannel};
use crate::diagnostics::DiagnosticSink;
use crate::error::TransportError;
use crate::worker::{Registration, WorkerChannel};

/// Where a new worker's code comes from.
#[derive(Clone)]
pub enum WorkerSource {
    /// Methods installed in-process by a registration callback.
    Inline(Registration),
    /// A worker program speaking the stdio protocol.
    Program(ProgramSpec),
    /// Any other spawn strategy.
    Custom(Arc<dyn WorkerSpawner>),
}

impl WorkerSource {
    pub fn inline<F>(register: F) -> Self
    where
        F: Fn(&WorkerChannel) + Send + Sync + 'static,
    {
        Self::Inline(Arc::new(register))
    }

    pub fn program(path: impl Into<PathBuf>) -> Self {
        Self::Program(ProgramSpec::new(path))
    }
}

impl std::fmt::Debug for WorkerSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Inline(_) => f.write_str("Inline"),
            Self::Program(spec) => f.debug_tuple("Program").field(&spec.program).finish(),
            Self::Custom(_) => f.write_str("Custom"),
        }
    }
}

#[derive(Clone, Default)]
pub struct GroupConfig {
    pub channel: ChannelConfig,
}

impl GroupConfig {
    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: DiagnosticSink) -> Self {
        self.channel = self.channel.with_diagnostics(diagnostics);
        self
    }
}

/// The active set of channels. Channels whose context exits are dropped
/// from the set automatically.
#[derive(Clone, Default)]
pub struct ChannelGroup {
    channels: Arc<DashMap<ChannelId, Arc<ControllerChannel>>>,
    config: GroupConfig,
}

impl ChannelGroup {
    pub fn new(config: GroupConfig) -> Self {
        Self {
            channels: Arc::new(DashMap::new()),
            config,
        }
    }

    /// Start a worker from `source` and wire a channel to it.
    pub fn spawn(
        &self,
        source: WorkerSource,
        initial_data: Value,
    ) -> Result<Arc<ControllerChannel>, SpawnError> {
        tracing::debug!(?source, "Spawning worker");
        let spawned = match source {
            WorkerSource::Inline(registration) => InProcessSpawner::new(registration)
                .with_diagnostics(Arc::clone(&self.config.channel.diagnostics))
                .spawn(&initial_data)?,
            WorkerSource::Program(spec) => ProcessSpawner::new(spec).spawn(&initial_data)?,
            WorkerSource::Custom(spawner) => spawner.spawn(&initial_data)?,
        };

        let channel = ControllerChannel::attach(spawned, self.config.channel.clone());
        let id = channel.id();
        self.channels.insert(id, Arc::clone(&channel));

        let channels = Arc::downgrade(&self.channels);
        let closed = channel.closed();
        tokio::spawn(async move {
            closed.await;
            let Some(channels) = channels.upgrade() else {
                return;
            };
            if channels.remove(&id).is_some() {
                tracing::debug!(channel = %id, "Pruned exited channel");
            }
        });

        tracing::info!(channel = %id, active = self.channels.len(), "Worker spawned");
        Ok(channel)
    }

    /// Terminate one channel and drop it from the set.
    pub async fn kill_one(&self, channel: &ControllerChannel) -> Result<(), TransportError> {
        self.channels.remove(&channel.id());
        channel.terminate().await
    }

    /// Terminate every channel. Returns the first termination error, if any.
    pub async fn shutdown(&self) -> Result<(), TransportError> {
        let ids: Vec<ChannelId> = self.channels.iter().map(|entry| *entry.key()).collect();
        let channels: Vec<Arc<ControllerChannel>> = ids
            .iter()
            .filter_map(|id| self.channels.remove(id).map(|(_, channel)| channel))
            .collect();
        tracing::info!(count = channels.len(), "Shutting down channel group");

        let results = join_all(channels.iter().map(|channel| channel.terminate())).await;
        results.into_iter().collect()
    }

    pub fn channels(&self) -> Vec<Arc<ControllerChannel>> {
        self.channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    pub fn get(&self, id: &ChannelId) -> Option<Arc<ControllerChannel>> {
        self.channels.get(id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::transfer::TransferBuffer;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    fn demo_worker(worker: &WorkerChannel) {
        worker
            .register_method("foo", |_ctx, args| async move {
                Ok(json!(format!("foo{}", args[0].as_str().unwrap_or_default())))
            })
            .register_method("fail", |_ctx, _args| async {
                Err::<Value, _>(HandlerError::new("FooError"))
            })
            .register_method("count", |ctx, _args| async move {
                for i in 0..3 {
                    ctx.send_event("tick", vec![json!(i)])?;
                    tokio::task::yield_now().await;
                }
                Ok(json!("bar"))
            })
            .register_method("hang", |_ctx, _args| async {
                futures::future::pending::<()>().await;
                Ok(Value::Null)
            })
            .register_method("reverse", |ctx, _args| async move {
                let mut data = ctx.transfers()[0].to_vec();
                data.reverse();
                ctx.set_transfer_list(vec![TransferBuffer::new(data)]);
                Ok(json!(ctx.transfers().len()))
            })
            .register_method("exit", |ctx, _args| async move {
                ctx.worker().exit();
                Ok(Value::Null)
            })
            .register_method("seed", |ctx, _args| async move {
                Ok(ctx.worker().worker_data().clone())
            });

        let echo = worker.downgrade();
        worker.on(
            "ping",
            crate::events::listener(move |args| {
                if let Some(worker) = echo.upgrade() {
                    let _ = worker.emit("pong", args.to_vec());
                }
            }),
        );
    }

    fn spawn_demo(group: &ChannelGroup) -> Arc<ControllerChannel> {
        group
            .spawn(WorkerSource::inline(demo_worker), json!({"seed": 11}))
            .unwrap()
    }

    #[tokio::test]
    async fn call_resolves_to_handler_result() {
        let group = ChannelGroup::default();
        let channel = spawn_demo(&group);

        let value = channel.call("foo", vec![json!("bar")]).await.unwrap();
        assert_eq!(value, json!("foobar"));
        assert_eq!(channel.call("seed", vec![]).await.unwrap(), json!({"seed": 11}));
    }

    #[tokio::test]
    async fn unhandled_method_rejects() {
        let group = ChannelGroup::default();
        let channel = spawn_demo(&group);

        let err = channel.call("nope", vec![]).await.unwrap_err();
        assert_eq!(err.to_string(), "Method nope is unhandled");
        assert_eq!(err.fault().and_then(|f| f.name()), Some("UnhandledMethodError"));
        assert!(channel.is_alive());
    }

    #[tokio::test]
    async fn handler_failure_rejects_with_record() {
        let group = ChannelGroup::default();
        let channel = spawn_demo(&group);

        let err = channel.call("fail", vec![]).await.unwrap_err();
        let record = err.fault().and_then(|f| f.record()).cloned().unwrap();
        assert_eq!(record.message, "FooError");
        assert_eq!(record.name, "Error");
    }

    #[tokio::test]
    async fn call_events_arrive_in_order_before_resolution() {
        let group = ChannelGroup::default();
        let channel = spawn_demo(&group);
        let seen = Arc::new(Mutex::new(Vec::new()));

        let session = {
            let seen = Arc::clone(&seen);
            channel
                .call("count", vec![])
                .on("tick", move |args| seen.lock().unwrap().push(args[0].clone()))
        };
        let value = session.await.unwrap();

        assert_eq!(value, json!("bar"));
        assert_eq!(*seen.lock().unwrap(), vec![json!(0), json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn panicking_event_handler_does_not_stall_other_calls() {
        let group = ChannelGroup::default();
        let channel = spawn_demo(&group);

        let counting = channel
            .call("count", vec![])
            .on("tick", |_| panic!("user bug"))
            .outcome();
        let other = channel.call("foo", vec![json!("baz")]).outcome();

        let (counting, other) = tokio::time::timeout(
            Duration::from_secs(5),
            futures::future::join(counting, other),
        )
        .await
        .unwrap();
        assert_eq!(counting.unwrap(), json!("bar"));
        assert_eq!(other.unwrap(), json!("foobaz"));
        assert!(channel.is_alive());
    }

    #[tokio::test]
    async fn terminate_then_call_is_not_alive() {
        let group = ChannelGroup::default();
        let channel = spawn_demo(&group);
        let pending = channel.call("hang", vec![]);
        let waiting = pending.outcome();

        channel.terminate().await.unwrap();
        assert!(waiting.await.unwrap_err().is_not_alive());

        let err = channel.call("foo", vec![json!("bar")]).await.unwrap_err();
        assert_eq!(err.to_string(), "Worker is not alive");
    }

    #[tokio::test]
    async fn buffers_move_both_ways() {
        let group = ChannelGroup::default();
        let channel = spawn_demo(&group);
        let buffer = TransferBuffer::new(b"abc".to_vec());

        let returned = channel
            .call("reverse", vec![])
            .with_transfer_list(vec![buffer.clone()])
            .returned()
            .await
            .unwrap();

        assert!(buffer.is_detached());
        assert_eq!(returned.data, json!(1));
        assert_eq!(returned.transfers[0].to_vec(), b"cba");
    }

    #[tokio::test]
    async fn pure_events_cross_both_ways() {
        let group = ChannelGroup::default();
        let channel = spawn_demo(&group);
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        channel.on(
            "pong",
            crate::events::listener(move |args| {
                let _ = tx.send(args.to_vec());
            }),
        );

        channel.emit("ping", vec![json!("hello")]).unwrap();
        let args = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(args, vec![json!("hello")]);
    }

    #[tokio::test]
    async fn worker_exit_prunes_channel() {
        let group = ChannelGroup::default();
        let channel = spawn_demo(&group);
        let hanging = channel.call("hang", vec![]).outcome();
        assert_eq!(group.len(), 1);

        let _ = channel.call("exit", vec![]).await;
        tokio::time::timeout(Duration::from_secs(5), channel.closed())
            .await
            .unwrap();

        assert!(hanging.await.unwrap_err().is_not_alive());
        assert!(!channel.is_alive());
        tokio::time::timeout(Duration::from_secs(5), async {
            while !group.is_empty() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn kill_one_and_shutdown() {
        let group = ChannelGroup::default();
        let first = spawn_demo(&group);
        let second = spawn_demo(&group);
        let third = spawn_demo(&group);
        assert_eq!(group.len(), 3);
        assert!(group.get(&first.id()).is_some());

        group.kill_one(&first).await.unwrap();
        assert!(!first.is_alive());
        assert_eq!(group.len(), 2);
        assert!(second.is_alive());

        group.shutdown().await.unwrap();
        assert!(group.is_empty());
        assert!(!second.is_alive());
        assert!(!third.is_alive());
    }

    #[tokio::test]
    async fn concurrent_calls_resolve_independently() {
        let group = ChannelGroup::default();
        let channel = spawn_demo(&group);

        let hanging = channel.call("hang", vec![]).outcome();
        let calls: Vec<_> = (0..10)
            .map(|i| channel.call("foo", vec![json!(i.to_string())]))
            .collect();
        let values = join_all(calls.iter().map(|c| c.outcome())).await;

        for (i, value) in values.into_iter().enumerate() {
            assert_eq!(value.unwrap(), json!(format!("foo{}", i)));
        }
        assert_eq!(channel.pending_calls(), 1);
        drop(hanging);
    }
}
