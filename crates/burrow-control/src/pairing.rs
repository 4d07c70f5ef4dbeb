//! Pending connection table
//!
//! Single-shot rendezvous between the external-side handler (which reserves
//! a slot and waits) and the control handler (which delivers the agent's
//! data socket for that slot). A slot is used exactly once: delivered,
//! cancelled, or timed out by its owner. No lock is held across I/O.

use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tracing::{debug, warn};

/// Pairing errors
#[derive(Debug, Error)]
pub enum PairingError {
    #[error("pairing slot {0} already reserved")]
    DuplicateConnId(String),
}

/// An agent data socket on its way to an external-side handler.
///
/// `residual` holds bytes the control handler's buffered reader consumed
/// past the `DATA:` line; they belong to the agent→external direction and
/// must be written before anything read from the socket itself.
pub struct DataConn {
    pub stream: TcpStream,
    pub residual: Vec<u8>,
}

impl DataConn {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            residual: Vec::new(),
        }
    }

    pub fn with_residual(stream: TcpStream, residual: Vec<u8>) -> Self {
        Self { stream, residual }
    }
}

/// Tracks external connections awaiting an agent data socket
#[derive(Clone, Default)]
pub struct PendingConns {
    slots: Arc<DashMap<String, oneshot::Sender<DataConn>>>,
}

impl PendingConns {
    pub fn new() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
        }
    }

    /// Reserve a slot for a connection id.
    ///
    /// Ids are unique within the broker lifetime, so a collision is a
    /// caller bug and is reported rather than silently replacing the slot.
    pub fn reserve(&self, conn_id: &str) -> Result<oneshot::Receiver<DataConn>, PairingError> {
        match self.slots.entry(conn_id.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(PairingError::DuplicateConnId(conn_id.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let (tx, rx) = oneshot::channel();
                entry.insert(tx);
                debug!(conn_id, "Reserved pairing slot");
                Ok(rx)
            }
        }
    }

    /// Hand a data socket to the waiting handler and release the slot.
    ///
    /// Returns `false` when no slot matches or the waiter is gone; in both
    /// cases the socket is dropped, which closes it.
    pub fn deliver(&self, conn_id: &str, conn: DataConn) -> bool {
        let Some((_, tx)) = self.slots.remove(conn_id) else {
            debug!(conn_id, "No pending slot for data connection; closing");
            return false;
        };

        if tx.send(conn).is_err() {
            // Receiver dropped between removal and send (timed out or
            // cancelled); the socket is closed with it.
            warn!(conn_id, "Pairing receiver gone; closing data connection");
            return false;
        }

        debug!(conn_id, "Data connection paired");
        true
    }

    /// Release a slot without delivering (timeout or handler teardown).
    pub fn cancel(&self, conn_id: &str) {
        if self.slots.remove(conn_id).is_some() {
            debug!(conn_id, "Cancelled pairing slot");
        }
    }

    /// Release every slot belonging to a tunnel (ids carry the tunnel id
    /// prefix). Called when a tunnel closes.
    pub fn cancel_tunnel(&self, tunnel_id: &str) {
        let prefix = format!("{tunnel_id}-");
        self.slots.retain(|conn_id, _| !conn_id.starts_with(&prefix));
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}
