//! jobherd distributes a stream of textual job commands to a pool of
//! line-oriented worker subprocesses, overspilling work to peer instances
//! over a small binary TCP protocol. Total concurrent work is bounded by a
//! counting admission limiter, and workers that crash mid-job are respawned
//! and asked to replay their queue.

pub mod capacity;
pub mod config;
pub mod error;
pub mod limiter;
pub mod logging;
pub mod net;
pub mod runtime;
pub mod supervisor;
pub mod watchdog;
pub mod worker;
