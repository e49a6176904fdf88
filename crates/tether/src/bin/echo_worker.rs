//! Demo worker program for the stdio execution context.
//!
//! Spawn it through `WorkerSource::Program`; startup data arrives in
//! `TETHER_WORKER_DATA`.

use std::time::Duration;

use serde_json::{Value, json};
use tether::{HandlerError, TransferBuffer, WorkerChannel, listener, run_stdio_worker};

fn register(worker: &WorkerChannel) {
    worker
        .register_method("echo", |_ctx, args| async move { Ok(Value::Array(args)) })
        .register_method("greet", |ctx, args| async move {
            let name = args
                .first()
                .and_then(Value::as_str)
                .ok_or_else(|| HandlerError::named("TypeError", "greet expects a name"))?;
            let greeting = ctx
                .worker()
                .worker_data()
                .get("greeting")
                .and_then(Value::as_str)
                .unwrap_or("hello");
            Ok(json!(format!("{} {}", greeting, name)))
        })
        .register_method("count", |ctx, args| async move {
            let n = args.first().and_then(Value::as_u64).unwrap_or(3);
            for i in 0..n {
                ctx.send_event("tick", vec![json!(i)])?;
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            Ok(json!("done"))
        })
        .register_method("fail", |_ctx, args| async move {
            let message = args
                .first()
                .and_then(Value::as_str)
                .unwrap_or("failed")
                .to_string();
            Err::<Value, _>(HandlerError::new(message))
        })
        .register_method("reverse", |ctx, _args| async move {
            let mut data = ctx
                .transfers()
                .first()
                .map(TransferBuffer::to_vec)
                .ok_or_else(|| HandlerError::named("TypeError", "reverse expects a buffer"))?;
            data.reverse();
            let len = data.len();
            ctx.set_transfer_list(vec![TransferBuffer::new(data)]);
            Ok(json!(len))
        })
        .register_method("hang", |_ctx, _args| async {
            futures::future::pending::<()>().await;
            Ok(Value::Null)
        })
        .register_method("exit", |ctx, _args| async move {
            ctx.worker().exit();
            Ok(Value::Null)
        });

    let events = worker.downgrade();
    worker.on(
        "ping",
        listener(move |args| {
            let Some(worker) = events.upgrade() else {
                return;
            };
            if let Err(e) = worker.emit("pong", args.to_vec()) {
                tracing::warn!(error = %e, "Failed to answer ping");
            }
        }),
    );
}

#[tokio::main]
async fn main() {
    tether::logging::init_tracing();

    let code = match run_stdio_worker(register).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(error = %e, "Worker failed");
            1
        }
    };
    // stdin is read on a blocking thread that cannot be cancelled; exiting
    // directly keeps runtime shutdown from waiting on it.
    std::process::exit(code);
}
