//! Per-test worker context
//!
//! What a scenario sees of its environment: the bind host/port, a log
//! sink, and the one place it may mount a server. With a real port the
//! listener binds it and serves direct connections; without one the
//! mounted service only ever sees relayed fake sockets.

use async_trait::async_trait;
use parking_lot::Mutex;
use stagehand_common::{Error, Result};
use std::future::Future;
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error};

/// A duplex byte stream handed to a scenario's connection service.
pub trait TestStream: AsyncRead + AsyncWrite + Send + Unpin {
    /// Idle timeout for the connection. Zero disables it.
    fn set_timeout(&mut self, timeout: Duration);
    fn set_nodelay(&mut self, no_delay: bool);
}

/// What a scenario mounts to serve connections.
#[async_trait]
pub trait ConnectionService: Send + Sync {
    async fn serve(&self, stream: Box<dyn TestStream>);
}

pub struct TestContext {
    host: String,
    port: Option<u16>,
    service: Mutex<Option<Arc<dyn ConnectionService>>>,
    log: Mutex<Option<std::fs::File>>,
}

impl TestContext {
    pub fn new(host: String, port: Option<u16>, log: Option<std::fs::File>) -> Self {
        Self {
            host,
            port,
            service: Mutex::new(None),
            log: Mutex::new(log),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Append a line to the test's log file.
    pub fn log(&self, line: &str) {
        if let Some(file) = self.log.lock().as_mut() {
            let _ = writeln!(file, "{line}");
        }
    }

    /// Mount the scenario's server. A second listener is an error.
    pub async fn listen(&self, service: Arc<dyn ConnectionService>) -> Result<()> {
        {
            let mut slot = self.service.lock();
            if slot.is_some() {
                return Err(Error::Internal(
                    "scenario attempted to create a second listener".to_string(),
                ));
            }
            *slot = Some(service.clone());
        }

        if let Some(port) = self.port {
            let listener = TcpListener::bind((self.host.as_str(), port)).await?;
            debug!("Scenario listening on {}:{}", self.host, port);
            tokio::spawn(async move {
                loop {
                    match listener.accept().await {
                        Ok((stream, _)) => {
                            let service = service.clone();
                            tokio::spawn(async move {
                                service.serve(Box::new(RealSocket::new(stream))).await;
                            });
                        }
                        Err(e) => {
                            error!("Accept failed: {}", e);
                            break;
                        }
                    }
                }
            });
        }
        Ok(())
    }

    pub fn service(&self) -> Option<Arc<dyn ConnectionService>> {
        self.service.lock().clone()
    }
}

/// A direct TCP connection on the worker's own listener.
pub struct RealSocket {
    stream: TcpStream,
    idle: Option<Duration>,
    deadline: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl RealSocket {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            idle: None,
            deadline: None,
        }
    }
}

impl AsyncRead for RealSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        match Pin::new(&mut this.stream).poll_read(cx, buf) {
            Poll::Pending => {
                if let Some(limit) = this.idle {
                    let deadline = this
                        .deadline
                        .get_or_insert_with(|| Box::pin(tokio::time::sleep(limit)));
                    if deadline.as_mut().poll(cx).is_ready() {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::TimedOut,
                            "connection idle timeout",
                        )));
                    }
                }
                Poll::Pending
            }
            ready => {
                this.deadline = None;
                ready
            }
        }
    }
}

impl AsyncWrite for RealSocket {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl TestStream for RealSocket {
    fn set_timeout(&mut self, timeout: Duration) {
        self.idle = (!timeout.is_zero()).then_some(timeout);
        self.deadline = None;
    }

    fn set_nodelay(&mut self, no_delay: bool) {
        let _ = self.stream.set_nodelay(no_delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct Sink;

    #[async_trait]
    impl ConnectionService for Sink {
        async fn serve(&self, _stream: Box<dyn TestStream>) {}
    }

    #[tokio::test]
    async fn a_second_listener_is_rejected() {
        let ctx = TestContext::new("127.0.0.1".to_string(), None, None);
        ctx.listen(Arc::new(Sink)).await.unwrap();
        assert!(ctx.listen(Arc::new(Sink)).await.is_err());
        assert!(ctx.service().is_some());
    }

    #[tokio::test]
    async fn without_a_port_nothing_binds() {
        let ctx = TestContext::new("127.0.0.1".to_string(), None, None);
        ctx.listen(Arc::new(Sink)).await.unwrap();
    }

    struct Echo;

    #[async_trait]
    impl ConnectionService for Echo {
        async fn serve(&self, mut stream: Box<dyn TestStream>) {
            let mut buf = [0u8; 32];
            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if stream.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    #[tokio::test]
    async fn a_port_binds_a_real_listener() {
        // Grab a free port the same way the master does.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let ctx = TestContext::new("127.0.0.1".to_string(), Some(port), None);
        ctx.listen(Arc::new(Echo)).await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        client.shutdown().await.unwrap();

        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"ping");
    }

    #[tokio::test]
    async fn log_lines_reach_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.log");
        let file = std::fs::File::create(&path).unwrap();

        let ctx = TestContext::new("127.0.0.1".to_string(), None, Some(file));
        ctx.log("setup ran");
        ctx.log("step ran");

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "setup ran\nstep ran\n");
    }
}
