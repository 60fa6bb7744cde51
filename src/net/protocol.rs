use std::rc::Rc;

use crate::capacity::Capacity;
use crate::net::connection::{Connection, Role};
use crate::net::frame::Frame;

/// Highest protocol version this build speaks. Version 0 peers understand
/// only the handshake; version 1 adds execute, completed and log frames.
pub const PROTOCOL_VERSION: u8 = 1;

/// Whether a frame may be dispatched at the negotiated version. Unknown
/// controls pass through so the dispatcher can warn about them — the
/// protocol must stay forward-compatible.
pub fn permitted(version: u8, frame: &Frame) -> bool {
    match frame {
        Frame::Version { .. } | Frame::Unknown { .. } => true,
        Frame::Execute { .. } | Frame::Completed { .. } | Frame::LogMessage { .. } => version >= 1,
    }
}

/// Handle one inbound frame.
pub fn dispatch(connection: &Rc<Connection>, capacity: &Rc<Capacity>, frame: Frame) {
    match frame {
        Frame::Version {
            version,
            capacity: advertised,
        } => {
            let old = connection.negotiate(version);
            tracing::info!(
                connection = %connection.id,
                offered = version,
                ours = PROTOCOL_VERSION,
                previous = old,
                negotiated = connection.version(),
                "Version negotiated"
            );
            match advertised {
                Some(advertised) if connection.role == Role::Server => {
                    if let Err(err) =
                        capacity.additional(connection.id, advertised, connection.outbound())
                    {
                        tracing::error!(
                            connection = %connection.id,
                            error = %err,
                            "Rejected capacity advertisement"
                        );
                    }
                }
                Some(advertised) => tracing::info!(
                    connection = %connection.id,
                    advertised,
                    "Peer advertised capacity"
                ),
                None => {}
            }
        }
        Frame::Execute { job } => capacity.enqueue_remote(connection.id, job),
        Frame::Completed { job } => capacity.job_done_remote(connection.id, &job),
        Frame::LogMessage { record } => {
            crate::logging::replay_peer_record(connection.id, &record)
        }
        Frame::Unknown { control } => tracing::warn!(
            connection = %connection.id,
            control,
            "Unknown control byte received"
        ),
    }
}
