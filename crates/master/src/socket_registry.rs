//! Relayed-socket registry
//!
//! Maps relay ids to the command queue of the task driving the client
//! socket, so worker-issued calls (`send`, `setTimeout`, `setNoDelay`)
//! reach the right connection.

use bytes::Bytes;
use parking_lot::Mutex;
use stagehand_common::{Error, Result};
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Command issued by a worker against a relayed client socket.
#[derive(Debug)]
pub enum SocketCommand {
    /// Write outbound bytes to the client.
    Write(Bytes),
    /// Half-close the write side; the client sees end of stream.
    End,
    /// Idle timeout for the connection. Zero disables it.
    SetTimeout(Duration),
    SetNoDelay(bool),
}

struct Entry {
    sender: mpsc::UnboundedSender<SocketCommand>,
    fd: RawFd,
}

#[derive(Default)]
pub struct SocketRegistry {
    sockets: Mutex<HashMap<Uuid, Entry>>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a socket and hand back its relay id.
    ///
    /// Returns `None` when the descriptor is already registered, which
    /// means some task is mid-relay on this connection already.
    pub fn add(&self, fd: RawFd, sender: mpsc::UnboundedSender<SocketCommand>) -> Option<Uuid> {
        let mut sockets = self.sockets.lock();
        if sockets.values().any(|entry| entry.fd == fd) {
            return None;
        }
        let id = Uuid::new_v4();
        sockets.insert(id, Entry { sender, fd });
        Some(id)
    }

    /// Queue a command for the task relaying the socket.
    pub fn send(&self, id: Uuid, command: SocketCommand) -> Result<()> {
        let sockets = self.sockets.lock();
        let entry = sockets.get(&id).ok_or(Error::UnknownSocket { id })?;
        // The relay task may already be winding down with the client; a
        // vanished receiver is not worth surfacing to the worker.
        let _ = entry.sender.send(command);
        Ok(())
    }

    pub fn remove(&self, id: Uuid) -> Result<()> {
        self.sockets
            .lock()
            .remove(&id)
            .map(|_| ())
            .ok_or(Error::UnknownSocket { id })
    }

    pub fn len(&self) -> usize {
        self.sockets.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sockets.lock().is_empty()
    }
}
