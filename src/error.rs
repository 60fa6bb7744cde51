use thiserror::Error;
use uuid::Uuid;

use crate::net::frame::FrameError;

#[derive(Error, Debug)]
pub enum JobherdError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("peer {0} is already registered")]
    PeerAlreadyRegistered(Uuid),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, JobherdError>;

/// Process exit codes for the fatal conditions that have no recovery path.
/// Each failure mode gets its own code so a caller can tell them apart.
pub mod exit_code {
    /// Standard input could not be attached to the event loop (a regular
    /// file was redirected instead of piping the commands in).
    pub const STDIN_NOT_PIPE: i32 = 2;
    /// A worker subprocess could not be spawned.
    pub const SPAWN_FAILED: i32 = 5;
    /// A job was admitted but neither a peer nor a local worker had room;
    /// the admission accounting is broken.
    pub const NO_SLOT: i32 = 6;
    /// Writing to a live worker's job pipe failed.
    pub const PIPE_WRITE: i32 = 7;
    /// A worker reported it could not exec its program at all.
    pub const EXEC_FAILED: i32 = 8;
    /// A worker died while it still had queued jobs.
    pub const WORKER_DIED: i32 = 9;
    /// An execution context stalled past the watchdog interval.
    pub const WATCHDOG: i32 = 11;
}
