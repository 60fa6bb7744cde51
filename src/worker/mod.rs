//! Worker subprocess management.
//!
//! Each worker is a forked child executing jobs one at a time over byte
//! streams:
//! - [`link`]: one subprocess — job pipe, result pipe, diagnostics, and the
//!   control back-channel with its resend protocol
//! - [`pool`]: forks the configured number of links and reacts to child death
//! - [`child`]: the supervision loop run inside the forked process
//! - [`echo`]: the simulated worker body used as a test harness
//!
//! # Execution Flow
//!
//! 1. [`pool::WorkerPool::spawn`] forks one worker-child per link
//! 2. The admission controller submits commands into a link's FIFO
//! 3. [`link::handle_results`] correlates result lines against the FIFO head
//! 4. A crashed worker is respawned by its child loop, which asks for the
//!    queued commands to be resent

pub mod child;
pub mod echo;
pub mod link;
pub mod pool;
pub mod profile;

pub use link::WorkerLink;
pub use pool::WorkerPool;
