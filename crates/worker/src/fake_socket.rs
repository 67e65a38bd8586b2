//! Fake socket
//!
//! Emulates a duplex byte stream without a network connection. Inbound
//! bytes arrive from the relay through a bounded channel; awaiting the
//! delivery is the backpressure signal, so bytes are never dropped or
//! reordered. Writes made by the scenario's own server code surface as
//! events the runtime relays back to the master.

use crate::context::TestStream;
use bytes::Bytes;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;

#[derive(Debug)]
pub enum SocketEvent {
    /// Outbound bytes; `None` finalizes the stream.
    Send(Option<Bytes>),
    /// Idle timeout requested for the real socket, in milliseconds.
    SetTimeout(u64),
    SetNoDelay(bool),
}

pub struct FakeSocket {
    inbound: mpsc::Receiver<Option<Bytes>>,
    pending: Option<Bytes>,
    events: mpsc::UnboundedSender<SocketEvent>,
    read_done: bool,
    write_done: bool,
}

/// The relay's side of a fake socket.
#[derive(Clone)]
pub struct FakeSocketHandle {
    inbound: mpsc::Sender<Option<Bytes>>,
}

pub fn fake_socket_pair(
    capacity: usize,
) -> (
    FakeSocket,
    FakeSocketHandle,
    mpsc::UnboundedReceiver<SocketEvent>,
) {
    let (inbound_tx, inbound_rx) = mpsc::channel(capacity);
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (
        FakeSocket {
            inbound: inbound_rx,
            pending: None,
            events: event_tx,
            read_done: false,
            write_done: false,
        },
        FakeSocketHandle {
            inbound: inbound_tx,
        },
        event_rx,
    )
}

impl FakeSocketHandle {
    /// Deliver an inbound chunk; `None` ends the stream. Completes once
    /// the socket has room, which is what propagates backpressure to the
    /// relay. Returns `false` when the socket is gone.
    pub async fn deliver(&self, chunk: Option<Bytes>) -> bool {
        self.inbound.send(chunk).await.is_ok()
    }
}

impl AsyncRead for FakeSocket {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            // Drain a partially consumed chunk before pulling the next.
            if let Some(pending) = this.pending.as_mut() {
                let n = pending.len().min(buf.remaining());
                buf.put_slice(&pending.split_to(n));
                if pending.is_empty() {
                    this.pending = None;
                }
                return Poll::Ready(Ok(()));
            }
            if this.read_done {
                return Poll::Ready(Ok(()));
            }
            match this.inbound.poll_recv(cx) {
                Poll::Ready(Some(Some(bytes))) => {
                    if !bytes.is_empty() {
                        this.pending = Some(bytes);
                    }
                }
                Poll::Ready(Some(None)) | Poll::Ready(None) => this.read_done = true,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

impl AsyncWrite for FakeSocket {
    fn poll_write(
        self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.write_done {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "fake socket already finalized",
            )));
        }
        if this
            .events
            .send(SocketEvent::Send(Some(Bytes::copy_from_slice(data))))
            .is_err()
        {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "fake socket consumer is gone",
            )));
        }
        Poll::Ready(Ok(data.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.write_done {
            this.write_done = true;
            let _ = this.events.send(SocketEvent::Send(None));
        }
        Poll::Ready(Ok(()))
    }
}

impl TestStream for FakeSocket {
    fn set_timeout(&mut self, timeout: Duration) {
        let _ = self
            .events
            .send(SocketEvent::SetTimeout(timeout.as_millis() as u64));
    }

    fn set_nodelay(&mut self, no_delay: bool) {
        let _ = self.events.send(SocketEvent::SetNoDelay(no_delay));
    }
}
