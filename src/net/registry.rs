use std::sync::Mutex;

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::net::frame::Frame;

/// The set of live peer connections, used for broadcast.
///
/// This is the only structure in the system touched from more than one OS
/// thread (the log-forwarding layer broadcasts from the auxiliary context),
/// so it holds the outbound queue handles behind a single mutex. Everything
/// else about a connection stays on the control plane.
#[derive(Default)]
pub struct Registry {
    connections: Mutex<Vec<Entry>>,
}

struct Entry {
    id: Uuid,
    outbound: mpsc::UnboundedSender<Frame>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: Uuid, outbound: mpsc::UnboundedSender<Frame>) {
        let mut connections = self.connections.lock().expect("registry lock poisoned");
        connections.retain(|entry| !entry.outbound.is_closed());
        connections.push(Entry { id, outbound });
    }

    pub fn remove(&self, id: Uuid) {
        let mut connections = self.connections.lock().expect("registry lock poisoned");
        connections.retain(|entry| entry.id != id);
    }

    /// Enqueue a frame on one connection. Returns false if it is gone.
    pub fn send_to(&self, id: Uuid, frame: Frame) -> bool {
        let connections = self.connections.lock().expect("registry lock poisoned");
        connections
            .iter()
            .find(|entry| entry.id == id)
            .map(|entry| entry.outbound.send(frame).is_ok())
            .unwrap_or(false)
    }

    /// Enqueue one freshly generated frame on every live connection,
    /// dropping entries whose connection has gone away. Returns the number
    /// of connections reached.
    pub fn broadcast<F>(&self, mut generate: F) -> usize
    where
        F: FnMut() -> Frame,
    {
        let mut connections = self.connections.lock().expect("registry lock poisoned");
        connections.retain(|entry| !entry.outbound.is_closed());
        let mut queued = 0;
        for entry in connections.iter() {
            if entry.outbound.send(generate()).is_ok() {
                queued += 1;
            }
        }
        queued
    }

    pub fn len(&self) -> usize {
        let connections = self.connections.lock().expect("registry lock poisoned");
        connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
