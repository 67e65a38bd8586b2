//! Fixture worker binary for the end-to-end tests.
//!
//! Registers a handful of scenarios around a minimal HTTP responder:
//! stdout belongs to the RPC channel, so everything else goes to stderr.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use stagehand_worker::{
    callback, ConnectionService, LifecycleCompiler, StaticLoader, TestContext, TestStream,
};

/// Answers every request with 200 and the current body text.
struct ReplyService {
    body: Arc<Mutex<String>>,
}

#[async_trait]
impl ConnectionService for ReplyService {
    async fn serve(&self, mut stream: Box<dyn TestStream>) {
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    head.extend_from_slice(&buf[..n]);
                    if head.windows(4).any(|w| w == b"\r\n\r\n") {
                        break;
                    }
                }
            }
        }

        let body = self.body.lock().clone();
        let response = format!(
            "HTTP/1.1 200 OK\r\n\
             Content-Type: text/plain\r\n\
             Content-Length: {}\r\n\
             Connection: close\r\n\r\n{body}",
            body.len()
        );
        let _ = stream.write_all(response.as_bytes()).await;
        let _ = stream.shutdown().await;
    }
}

fn login_module(
    ctx: Arc<TestContext>,
    compiler: &mut LifecycleCompiler,
) -> stagehand_common::Result<()> {
    let successful_ctx = ctx.clone();
    compiler.scenario(
        "login:successful",
        Box::new(move |c| {
            let ctx = successful_ctx.clone();
            c.setup(callback(move || async move {
                ctx.log("mounting login responder");
                ctx.listen(Arc::new(ReplyService {
                    body: Arc::new(Mutex::new("login ok".to_string())),
                }))
                .await?;
                Ok(())
            }))?;
            c.teardown(callback(|| async { Ok(()) }))
        }),
    )?;

    let retried_ctx = ctx;
    compiler.scenario(
        "login:retried",
        Box::new(move |c| {
            let ctx = retried_ctx.clone();
            let body = Arc::new(Mutex::new("pending".to_string()));
            let service_body = body.clone();
            c.setup(callback(move || async move {
                ctx.listen(Arc::new(ReplyService { body: service_body })).await?;
                Ok(())
            }))?;
            c.step(callback(move || async move {
                *body.lock() = "confirmed".to_string();
                Ok(())
            }))?;
            c.teardown(callback(|| async { Ok(()) }))
        }),
    )
}

fn broken_module(
    _ctx: Arc<TestContext>,
    compiler: &mut LifecycleCompiler,
) -> stagehand_common::Result<()> {
    compiler.scenario(
        "broken:setup",
        Box::new(|c| {
            c.setup(callback(|| async {
                Err(anyhow::anyhow!("account fixture is unavailable"))
            }))
        }),
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let loader = StaticLoader::new()
        .register("login.scenario", login_module)
        .register("broken.scenario", broken_module);

    stagehand_worker::run(Box::new(loader)).await
}
