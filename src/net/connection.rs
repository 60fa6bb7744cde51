use std::cell::Cell;
use std::rc::Rc;
use std::sync::Arc;

use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::capacity::Capacity;
use crate::net::frame::{self, Frame};
use crate::net::protocol;
use crate::net::registry::Registry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Outbound connection to a supervisor.
    Client,
    /// Inbound connection accepted from a peer.
    Server,
}

/// One peer connection. Frames are sent by enqueueing on the outbound
/// queue; a single writer task drains it strictly in order.
pub struct Connection {
    pub id: Uuid,
    pub role: Role,
    version: Cell<u8>,
    outbound: mpsc::UnboundedSender<Frame>,
    closed: CancellationToken,
}

impl Connection {
    /// Negotiated protocol version; 0 until the handshake arrives.
    pub fn version(&self) -> u8 {
        self.version.get()
    }

    /// Settle on the lower of our version and the peer's. Returns the
    /// previously negotiated value.
    pub fn negotiate(&self, theirs: u8) -> u8 {
        let old = self.version.get();
        self.version.set(theirs.min(protocol::PROTOCOL_VERSION));
        old
    }

    pub fn send(&self, frame: Frame) {
        let _ = self.outbound.send(frame);
    }

    pub fn outbound(&self) -> mpsc::UnboundedSender<Frame> {
        self.outbound.clone()
    }

    /// Cancelled when the read loop exits, after the close actions ran.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }
}

/// Take ownership of an accepted or dialed socket: register the connection
/// for broadcast, advertise our version and capacity, and spawn the reader
/// and writer tasks on the control-plane context.
pub fn establish(
    stream: TcpStream,
    role: Role,
    capacity: Rc<Capacity>,
    registry: Arc<Registry>,
) -> Rc<Connection> {
    let (read_half, write_half) = stream.into_split();
    let (outbound, outbound_rx) = mpsc::unbounded_channel();
    let connection = Rc::new(Connection {
        id: Uuid::new_v4(),
        role,
        version: Cell::new(0),
        outbound,
        closed: CancellationToken::new(),
    });
    registry.insert(connection.id, connection.outbound());
    connection.send(Frame::Version {
        version: protocol::PROTOCOL_VERSION,
        capacity: Some(capacity.advertised_capacity()),
    });
    tokio::task::spawn_local(write_loop(connection.clone(), write_half, outbound_rx));
    tokio::task::spawn_local(read_loop(connection.clone(), read_half, capacity, registry));
    connection
}

async fn write_loop(
    connection: Rc<Connection>,
    mut socket: OwnedWriteHalf,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
) {
    while let Some(frame) = outbound.recv().await {
        if let Err(err) = socket.write_all(&frame.encode()).await {
            tracing::warn!(
                connection = %connection.id,
                error = %err,
                "Failed to write frame, closing outbound queue"
            );
            break;
        }
    }
}

/// Decode and dispatch inbound frames. Whatever way the loop exits — clean
/// close, decode error or I/O failure — the close action runs: a client
/// connection releases the process-level completion wait, a server
/// connection has its outstanding work overspilled.
async fn read_loop(
    connection: Rc<Connection>,
    socket: OwnedReadHalf,
    capacity: Rc<Capacity>,
    registry: Arc<Registry>,
) {
    let mut reader = BufReader::new(socket);
    loop {
        match frame::read_frame(&mut reader).await {
            Ok(Some(frame)) => {
                if !protocol::permitted(connection.version(), &frame) {
                    tracing::warn!(
                        connection = %connection.id,
                        control = frame.control(),
                        version = connection.version(),
                        "Frame not allowed at negotiated version, ignoring"
                    );
                    continue;
                }
                protocol::dispatch(&connection, &capacity, frame);
            }
            Ok(None) => {
                tracing::info!(connection = %connection.id, "Peer connection closed");
                break;
            }
            Err(err) => {
                tracing::warn!(connection = %connection.id, error = %err, "Peer connection failed");
                break;
            }
        }
    }

    registry.remove(connection.id);
    match connection.role {
        Role::Client => tracing::info!(
            connection = %connection.id,
            "Network connection closed, releasing completion wait"
        ),
        Role::Server => capacity.overspill_work(connection.id),
    }
    connection.closed.cancel();
}
