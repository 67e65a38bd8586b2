//! Client-facing listener
//!
//! Every connection reaching the master's port is either a control-API
//! request or traffic for a header-bound test. The head of the connection
//! is buffered until the header block is complete, the binding header
//! decides where it goes, and the buffered bytes are replayed in front of
//! whatever the socket carries next.

use crate::control_api;
use crate::orchestrator::Master;
use crate::socket_registry::{SocketCommand, SocketRegistry};
use bytes::{Bytes, BytesMut};
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use socket2::SockRef;
use stagehand_common::rpc::{encode_chunk, Request};
use stagehand_common::{Error, Result, RpcChannel};
use std::io;
use std::os::fd::AsRawFd;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

/// Largest request head worth buffering while routing.
const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Read buffer for relayed traffic; also the chunk size on the wire.
const RELAY_BUF_BYTES: usize = 64 * 1024;

pub async fn serve(master: Arc<Master>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(master.config().listen_addr()).await?;
    info!(
        "Master listening on http://{}{}",
        listener.local_addr()?,
        master.config().endpoints_prefix
    );
    run(master, listener).await
}

/// Accept loop over an already-bound listener.
pub async fn run(master: Arc<Master>, listener: TcpListener) -> anyhow::Result<()> {
    let router = control_api::router(master.clone());
    loop {
        let (stream, peer) = listener.accept().await?;
        let master = master.clone();
        let router = router.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(master, router, stream).await {
                debug!("Connection from {} ended: {}", peer, e);
            }
        });
    }
}

async fn handle_connection(
    master: Arc<Master>,
    router: axum::Router,
    mut stream: TcpStream,
) -> Result<()> {
    let head = read_head(&mut stream).await?;
    match binding_header_value(&head, &master.config().binding_header_name) {
        Some(test_id) => relay_to_worker(master, stream, head, &test_id).await,
        None => serve_control(router, stream, head).await,
    }
}

/// Buffer the connection until the header block terminator arrives.
///
/// Body bytes the client pipelined behind the head stay in the buffer;
/// both routes replay the whole buffer before reading the socket again.
async fn read_head(stream: &mut TcpStream) -> Result<BytesMut> {
    let mut head = BytesMut::with_capacity(1024);
    loop {
        let n = stream.read_buf(&mut head).await?;
        if header_block_end(&head).is_some() || n == 0 {
            return Ok(head);
        }
        if head.len() > MAX_HEAD_BYTES {
            return Err(Error::Protocol("request head too large".to_string()));
        }
    }
}

fn header_block_end(head: &[u8]) -> Option<usize> {
    head.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Extract the binding header's value from a buffered request head.
fn binding_header_value(head: &[u8], header_name: &str) -> Option<String> {
    let end = header_block_end(head).unwrap_or(head.len());
    let text = std::str::from_utf8(&head[..end]).ok()?;
    let (_request_line, headers) = text.split_once("\r\n")?;
    for line in headers.split("\r\n") {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case(header_name) {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

/// Hand the connection to the control API with the head stitched back on.
async fn serve_control(router: axum::Router, stream: TcpStream, head: BytesMut) -> Result<()> {
    let io = TokioIo::new(RewindStream::new(head.freeze(), stream));
    hyper::server::conn::http1::Builder::new()
        .serve_connection(io, TowerToHyperService::new(router))
        .await
        .map_err(|e| Error::Internal(format!("control connection failed: {e}")))
}

/// Relay a header-bound connection to the test's worker.
async fn relay_to_worker(
    master: Arc<Master>,
    stream: TcpStream,
    head: BytesMut,
    test_id: &str,
) -> Result<()> {
    let worker = master.tests.get_worker(test_id)?;
    let (command_tx, mut commands) = mpsc::unbounded_channel();
    let Some(socket_id) = master.sockets.add(stream.as_raw_fd(), command_tx) else {
        // Some task is already mid-relay on this descriptor.
        return Ok(());
    };

    debug!("Relaying socket {} to test {}", socket_id, test_id);
    let channel = worker.channel().clone();
    let result = relay_loop(&channel, &master.sockets, &stream, &mut commands, socket_id, head).await;
    let _ = master.sockets.remove(socket_id);
    result
}

async fn relay_loop(
    channel: &RpcChannel,
    sockets: &SocketRegistry,
    stream: &TcpStream,
    commands: &mut mpsc::UnboundedReceiver<SocketCommand>,
    socket_id: Uuid,
    head: BytesMut,
) -> Result<()> {
    // The head was consumed during routing; the worker sees it first.
    channel
        .call(Request::Receive {
            socket_id,
            chunk: encode_chunk(Some(&head)),
        })
        .await?;

    let mut buf = vec![0u8; RELAY_BUF_BYTES];
    let mut idle: Option<Duration> = None;
    let mut client_done = false;
    let mut worker_done = false;

    while !(client_done && worker_done) {
        tokio::select! {
            command = commands.recv(), if !worker_done => {
                match command {
                    Some(SocketCommand::Write(bytes)) => write_all(stream, &bytes).await?,
                    Some(SocketCommand::End) => {
                        // Half-close so the client still drains what we wrote.
                        SockRef::from(stream).shutdown(std::net::Shutdown::Write)?;
                        // A finalized stream takes no more worker commands;
                        // anything sent after this fails UnknownSocket.
                        let _ = sockets.remove(socket_id);
                        worker_done = true;
                    }
                    Some(SocketCommand::SetTimeout(timeout)) => {
                        idle = (!timeout.is_zero()).then_some(timeout);
                    }
                    Some(SocketCommand::SetNoDelay(no_delay)) => stream.set_nodelay(no_delay)?,
                    None => break,
                }
            }
            readiness = await_readable(stream, idle), if !client_done => {
                match readiness? {
                    ReadReadiness::Ready => match stream.try_read(&mut buf) {
                        Ok(0) => {
                            client_done = true;
                            channel.call(Request::Receive { socket_id, chunk: None }).await?;
                        }
                        Ok(n) => {
                            // Sequentially awaited per socket, which is what
                            // keeps the byte stream in arrival order.
                            channel
                                .call(Request::Receive {
                                    socket_id,
                                    chunk: encode_chunk(Some(&buf[..n])),
                                })
                                .await?;
                        }
                        Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {}
                        Err(e) => return Err(e.into()),
                    },
                    ReadReadiness::IdleExpired => {
                        debug!("Socket {} idle timeout expired", socket_id);
                        let _ = channel.call(Request::Receive { socket_id, chunk: None }).await;
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

enum ReadReadiness {
    Ready,
    IdleExpired,
}

async fn await_readable(stream: &TcpStream, idle: Option<Duration>) -> Result<ReadReadiness> {
    match idle {
        Some(limit) => match tokio::time::timeout(limit, stream.readable()).await {
            Ok(ready) => {
                ready?;
                Ok(ReadReadiness::Ready)
            }
            Err(_) => Ok(ReadReadiness::IdleExpired),
        },
        None => {
            stream.readable().await?;
            Ok(ReadReadiness::Ready)
        }
    }
}

async fn write_all(stream: &TcpStream, mut data: &[u8]) -> io::Result<()> {
    while !data.is_empty() {
        stream.writable().await?;
        match stream.try_write(data) {
            Ok(n) => data = &data[n..],
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// A stream with already-consumed bytes stitched back in front.
struct RewindStream {
    prefix: Bytes,
    inner: TcpStream,
}

impl RewindStream {
    fn new(prefix: Bytes, inner: TcpStream) -> Self {
        Self { prefix, inner }
    }
}

impl AsyncRead for RewindStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if !self.prefix.is_empty() {
            let n = self.prefix.len().min(buf.remaining());
            let chunk = self.prefix.split_to(n);
            buf.put_slice(&chunk);
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for RewindStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}
