//! Correlated RPC channel between the master and a worker process.
//!
//! One channel per worker, carrying newline-delimited JSON envelopes over
//! the worker's stdin/stdout pipes. Every outgoing `call` gets a fresh
//! request id; the matching `resolve`/`reject` settles the pending call.
//! Incoming calls dispatch to the peer's handler, and handler failures
//! travel back as wire errors tagged with an explicit kind so the caller
//! can match on the kind after crossing the process boundary.

use crate::{Error, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};
use tracing::{debug, error, trace};
use uuid::Uuid;

/// Upper bound for one wire frame. Relay chunks are at most 64 KiB before
/// base64, so this leaves generous headroom.
const MAX_FRAME_BYTES: usize = 4 * 1024 * 1024;

/// Error kind tag carried across the process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireErrorKind {
    /// A scenario lifecycle callback (setup/step/teardown) failed.
    Lifecycle,
    /// A step was requested but no steps remain.
    UnexpectedStep,
    /// The peer received a call type it does not serve.
    Protocol,
    /// Anything else; the message is the only context.
    Internal,
}

/// Error reconstructed on the caller side of the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireError {
    pub kind: WireErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scenario_id: Option<String>,
}

impl WireError {
    pub fn lifecycle(scenario_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: WireErrorKind::Lifecycle,
            message: message.into(),
            scenario_id: Some(scenario_id.into()),
        }
    }

    pub fn unexpected_step(scenario_id: impl Into<String>) -> Self {
        Self {
            kind: WireErrorKind::UnexpectedStep,
            message: "no steps remaining".to_string(),
            scenario_id: Some(scenario_id.into()),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self {
            kind: WireErrorKind::Protocol,
            message: message.into(),
            scenario_id: None,
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: WireErrorKind::Internal,
            message: message.into(),
            scenario_id: None,
        }
    }
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.scenario_id {
            Some(id) => write!(f, "{} (scenario {id})", self.message),
            None => f.write_str(&self.message),
        }
    }
}

impl std::error::Error for WireError {}

/// Parameters of the master-issued `setup` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupParams {
    pub module: String,
    pub scenario_name: String,
    pub log_path: PathBuf,
    pub host: String,
    pub port: Option<u16>,
}

/// Every call type crossing the channel, in either direction.
///
/// `setup`/`step`/`teardown`/`receive` travel master→worker;
/// `send`/`set_timeout`/`set_no_delay` travel worker→master. Each side's
/// handler matches exhaustively and rejects the types it does not serve.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "parameters", rename_all = "snake_case")]
pub enum Request {
    Setup(SetupParams),
    Step,
    Teardown,
    Receive { socket_id: Uuid, chunk: Option<String> },
    Send { socket_id: Uuid, chunk: Option<String> },
    SetTimeout { socket_id: Uuid, timeout_ms: u64 },
    SetNoDelay { socket_id: Uuid, no_delay: bool },
}

/// Wire envelope. Unknown kinds are a decode error, not a runtime branch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Envelope {
    Call {
        request_id: Uuid,
        #[serde(flatten)]
        request: Request,
    },
    Resolve {
        request_id: Uuid,
        value: serde_json::Value,
    },
    Reject {
        request_id: Uuid,
        error: WireError,
    },
}

/// Encode a relay chunk for the wire; `None` marks end of stream.
pub fn encode_chunk(chunk: Option<&[u8]>) -> Option<String> {
    chunk.map(|bytes| BASE64.encode(bytes))
}

/// Decode a relay chunk from the wire; `None` marks end of stream.
pub fn decode_chunk(chunk: Option<&str>) -> Result<Option<Vec<u8>>> {
    match chunk {
        Some(text) => BASE64
            .decode(text)
            .map(Some)
            .map_err(|e| Error::Protocol(format!("invalid chunk encoding: {e}"))),
        None => Ok(None),
    }
}

/// Handler for calls arriving from the peer.
///
/// The channel itself is passed back in so a handler can issue calls of
/// its own over the same transport (the worker's socket relay does).
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(
        &self,
        channel: RpcChannel,
        request: Request,
    ) -> std::result::Result<serde_json::Value, WireError>;
}

struct ChannelInner {
    pending: Mutex<HashMap<Uuid, oneshot::Sender<Result<serde_json::Value>>>>,
    outgoing: Mutex<Option<mpsc::UnboundedSender<Envelope>>>,
    closed_tx: watch::Sender<bool>,
}

/// One end of a correlated RPC channel. Cheap to clone.
#[derive(Clone)]
pub struct RpcChannel {
    inner: Arc<ChannelInner>,
}

impl RpcChannel {
    /// Start serving a channel over the given transport halves.
    ///
    /// Spawns a writer task (owning the write half, so closing the channel
    /// drops the pipe and the peer sees EOF) and a reader task that
    /// dispatches envelopes until EOF or a protocol violation.
    pub fn spawn<R, W>(reader: R, writer: W, handler: Arc<dyn RpcHandler>) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let (closed_tx, _) = watch::channel(false);
        let channel = RpcChannel {
            inner: Arc::new(ChannelInner {
                pending: Mutex::new(HashMap::new()),
                outgoing: Mutex::new(Some(tx)),
                closed_tx,
            }),
        };

        tokio::spawn(async move {
            let mut sink = FramedWrite::new(writer, LinesCodec::new());
            while let Some(envelope) = rx.recv().await {
                let line = match serde_json::to_string(&envelope) {
                    Ok(line) => line,
                    Err(e) => {
                        error!("Failed to encode envelope: {}", e);
                        continue;
                    }
                };
                if let Err(e) = sink.send(line).await {
                    debug!("Channel write failed: {}", e);
                    break;
                }
            }
        });

        let chan = channel.clone();
        tokio::spawn(async move {
            let mut lines = FramedRead::new(reader, LinesCodec::new_with_max_length(MAX_FRAME_BYTES));
            let violation = loop {
                match lines.next().await {
                    Some(Ok(line)) => {
                        let envelope: Envelope = match serde_json::from_str(&line) {
                            Ok(envelope) => envelope,
                            Err(e) => break Some(format!("undecodable message: {e}")),
                        };
                        if let Err(reason) = chan.dispatch(envelope, handler.clone()) {
                            break Some(reason);
                        }
                    }
                    Some(Err(e)) => break Some(format!("transport error: {e}")),
                    None => break None,
                }
            };
            if let Some(reason) = &violation {
                error!("RPC protocol error: {}", reason);
            }
            chan.shutdown(violation);
        });

        channel
    }

    /// Issue a call and await the matching `resolve`/`reject`.
    ///
    /// Fails immediately with [`Error::ChannelClosed`] if the transport is
    /// already gone; nothing is enqueued in that case.
    pub async fn call(&self, request: Request) -> Result<serde_json::Value> {
        let request_id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        {
            let outgoing = self.inner.outgoing.lock();
            let Some(sender) = outgoing.as_ref() else {
                return Err(Error::ChannelClosed);
            };
            self.inner.pending.lock().insert(request_id, tx);
            if sender.send(Envelope::Call { request_id, request }).is_err() {
                self.inner.pending.lock().remove(&request_id);
                return Err(Error::ChannelClosed);
            }
        }

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::ChannelClosed),
        }
    }

    /// Close the transport. The peer sees EOF; pending calls fail with
    /// [`Error::ChannelClosed`]. Safe to call more than once.
    pub fn close(&self) {
        self.shutdown(None);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.outgoing.lock().is_none()
    }

    /// Wait until the peer disconnects or the channel is closed locally.
    pub async fn closed(&self) {
        let mut rx = self.inner.closed_tx.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                break;
            }
        }
    }

    fn dispatch(
        &self,
        envelope: Envelope,
        handler: Arc<dyn RpcHandler>,
    ) -> std::result::Result<(), String> {
        match envelope {
            Envelope::Call { request_id, request } => {
                trace!(%request_id, "incoming call");
                let chan = self.clone();
                tokio::spawn(async move {
                    let response = match handler.handle(chan.clone(), request).await {
                        Ok(value) => Envelope::Resolve { request_id, value },
                        Err(error) => Envelope::Reject { request_id, error },
                    };
                    chan.post(response);
                });
                Ok(())
            }
            Envelope::Resolve { request_id, value } => self.settle(request_id, Ok(value)),
            Envelope::Reject { request_id, error } => {
                self.settle(request_id, Err(Error::Remote(error)))
            }
        }
    }

    fn settle(
        &self,
        request_id: Uuid,
        outcome: Result<serde_json::Value>,
    ) -> std::result::Result<(), String> {
        match self.inner.pending.lock().remove(&request_id) {
            Some(tx) => {
                let _ = tx.send(outcome);
                Ok(())
            }
            None => Err(format!("unexpected request id \"{request_id}\"")),
        }
    }

    fn post(&self, envelope: Envelope) {
        if let Some(tx) = self.inner.outgoing.lock().as_ref() {
            let _ = tx.send(envelope);
        }
    }

    fn shutdown(&self, violation: Option<String>) {
        self.inner.outgoing.lock().take();
        let pending: Vec<_> = {
            let mut pending = self.inner.pending.lock();
            pending.drain().collect()
        };
        for (_, tx) in pending {
            let err = match &violation {
                Some(reason) => Error::Protocol(reason.clone()),
                None => Error::ChannelClosed,
            };
            let _ = tx.send(Err(err));
        }
        let _ = self.inner.closed_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    struct NullHandler;

    #[async_trait]
    impl RpcHandler for NullHandler {
        async fn handle(
            &self,
            _channel: RpcChannel,
            _request: Request,
        ) -> std::result::Result<serde_json::Value, WireError> {
            Ok(serde_json::Value::Null)
        }
    }

    struct FailingHandler;

    #[async_trait]
    impl RpcHandler for FailingHandler {
        async fn handle(
            &self,
            _channel: RpcChannel,
            _request: Request,
        ) -> std::result::Result<serde_json::Value, WireError> {
            Err(WireError::lifecycle("login:successful", "setup exploded"))
        }
    }

    /// A channel plus the raw peer side of its transport.
    fn raw_peer_channel(
        handler: Arc<dyn RpcHandler>,
    ) -> (RpcChannel, BufReader<tokio::io::ReadHalf<tokio::io::DuplexStream>>, tokio::io::WriteHalf<tokio::io::DuplexStream>) {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        let (read_ours, write_ours) = tokio::io::split(ours);
        let (read_theirs, write_theirs) = tokio::io::split(theirs);
        let channel = RpcChannel::spawn(read_ours, write_ours, handler);
        (channel, BufReader::new(read_theirs), write_theirs)
    }

    fn channel_pair(
        left: Arc<dyn RpcHandler>,
        right: Arc<dyn RpcHandler>,
    ) -> (RpcChannel, RpcChannel) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (read_a, write_a) = tokio::io::split(a);
        let (read_b, write_b) = tokio::io::split(b);
        (
            RpcChannel::spawn(read_a, write_a, left),
            RpcChannel::spawn(read_b, write_b, right),
        )
    }

    #[test]
    fn envelope_wire_shape() {
        let envelope = Envelope::Call {
            request_id: Uuid::nil(),
            request: Request::Receive {
                socket_id: Uuid::nil(),
                chunk: None,
            },
        };
        let json: serde_json::Value =
            serde_json::from_str(&serde_json::to_string(&envelope).unwrap()).unwrap();
        assert_eq!(json["kind"], "call");
        assert_eq!(json["type"], "receive");
        assert_eq!(json["parameters"]["chunk"], serde_json::Value::Null);
    }

    #[test]
    fn unknown_kind_is_a_decode_error() {
        let result: std::result::Result<Envelope, _> =
            serde_json::from_str(r#"{"kind":"shrug","request_id":"00000000-0000-0000-0000-000000000000"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn unknown_call_type_is_a_decode_error() {
        let result: std::result::Result<Envelope, _> = serde_json::from_str(
            r#"{"kind":"call","request_id":"00000000-0000-0000-0000-000000000000","type":"frobnicate","parameters":{}}"#,
        );
        assert!(result.is_err());
    }

    #[test]
    fn chunk_round_trip_and_end_of_stream() {
        let encoded = encode_chunk(Some(b"\x00\x01binary\xff"));
        let decoded = decode_chunk(encoded.as_deref()).unwrap();
        assert_eq!(decoded.as_deref(), Some(&b"\x00\x01binary\xff"[..]));
        assert_eq!(encode_chunk(None), None);
        assert_eq!(decode_chunk(None).unwrap(), None);
        assert!(decode_chunk(Some("not base64!!")).is_err());
    }

    #[tokio::test]
    async fn call_resolves_against_peer_handler() {
        let (caller, _callee) = channel_pair(Arc::new(NullHandler), Arc::new(NullHandler));
        let value = caller.call(Request::Step).await.unwrap();
        assert_eq!(value, serde_json::Value::Null);
    }

    #[tokio::test]
    async fn rejected_call_preserves_error_kind_and_scenario() {
        let (caller, _callee) = channel_pair(Arc::new(NullHandler), Arc::new(FailingHandler));
        let err = caller.call(Request::Step).await.unwrap_err();
        match err {
            Error::Remote(wire) => {
                assert_eq!(wire.kind, WireErrorKind::Lifecycle);
                assert_eq!(wire.scenario_id.as_deref(), Some("login:successful"));
                assert_eq!(wire.message, "setup exploded");
            }
            other => panic!("expected remote error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn identical_calls_get_fresh_request_ids() {
        let (channel, mut peer_read, mut peer_write) = raw_peer_channel(Arc::new(NullHandler));

        let first = tokio::spawn({
            let channel = channel.clone();
            async move { channel.call(Request::Step).await }
        });
        let second = tokio::spawn({
            let channel = channel.clone();
            async move { channel.call(Request::Step).await }
        });

        let mut ids = Vec::new();
        for _ in 0..2 {
            let mut line = String::new();
            peer_read.read_line(&mut line).await.unwrap();
            let value: serde_json::Value = serde_json::from_str(&line).unwrap();
            assert_eq!(value["kind"], "call");
            assert_eq!(value["type"], "step");
            ids.push(value["request_id"].as_str().unwrap().to_string());
        }
        assert_ne!(ids[0], ids[1]);

        for id in &ids {
            let resolve = json!({"kind": "resolve", "request_id": id, "value": null});
            peer_write
                .write_all(format!("{resolve}\n").as_bytes())
                .await
                .unwrap();
        }
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn resolve_for_unknown_id_is_a_protocol_violation() {
        let (channel, _peer_read, mut peer_write) = raw_peer_channel(Arc::new(NullHandler));

        let in_flight = tokio::spawn({
            let channel = channel.clone();
            async move { channel.call(Request::Teardown).await }
        });

        // Give the call time to land in the pending table.
        tokio::task::yield_now().await;

        let bogus = json!({
            "kind": "resolve",
            "request_id": Uuid::new_v4(),
            "value": null,
        });
        peer_write
            .write_all(format!("{bogus}\n").as_bytes())
            .await
            .unwrap();

        match in_flight.await.unwrap() {
            Err(Error::Protocol(reason)) => assert!(reason.contains("unexpected request id")),
            other => panic!("expected protocol error, got {other:?}"),
        }
        channel.closed().await;
        assert!(channel.is_closed());
    }

    #[tokio::test]
    async fn call_on_closed_channel_fails_immediately() {
        let (channel, _callee) = channel_pair(Arc::new(NullHandler), Arc::new(NullHandler));
        channel.close();
        match channel.call(Request::Step).await {
            Err(Error::ChannelClosed) => {}
            other => panic!("expected channel closed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn peer_eof_fails_pending_calls() {
        let (channel, peer_read, peer_write) = raw_peer_channel(Arc::new(NullHandler));

        let in_flight = tokio::spawn({
            let channel = channel.clone();
            async move { channel.call(Request::Step).await }
        });
        tokio::task::yield_now().await;

        drop(peer_read);
        drop(peer_write);

        match in_flight.await.unwrap() {
            Err(Error::ChannelClosed) => {}
            other => panic!("expected channel closed, got {other:?}"),
        }
    }
}
