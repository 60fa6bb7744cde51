use std::path::PathBuf;

/// Depth of each worker's in-flight job queue.
pub const FIFO_DEPTH: usize = 3;

/// Configuration for a supervising process (supervisor or network peer).
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of worker subprocesses to spawn
    pub workers: usize,
    /// In-flight queue depth per worker
    pub fifo_depth: usize,
    /// Port to listen on for peers (supervisor) or to connect to (peer)
    pub port: Option<u16>,
    /// Host of the supervisor to connect to; selects network-peer mode
    pub connect: Option<String>,
    /// Extra capacity advertised to a supervisor, per worker, above the
    /// workers' own queue depth
    pub overspill_per_worker: u64,
    /// Program forked for each worker link (normally this binary, re-entered
    /// in worker-child mode)
    pub child_program: PathBuf,
    /// Argument vector of the worker program the child loop runs
    pub exec: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            fifo_depth: FIFO_DEPTH,
            port: None,
            connect: None,
            overspill_per_worker: 2,
            child_program: std::env::current_exe()
                .unwrap_or_else(|_| PathBuf::from("jobherd")),
            exec: Vec::new(),
        }
    }
}

impl Config {
    /// Total number of jobs the local workers can hold at once.
    pub fn local_capacity(&self) -> u64 {
        (self.workers * self.fifo_depth) as u64
    }

    /// Capacity advertised to a supervisor when running as a network peer.
    pub fn advertised_capacity(&self) -> u64 {
        self.local_capacity() + self.overspill_per_worker * self.workers as u64
    }
}

fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Settings for the simulated worker body.
#[derive(Debug, Clone)]
pub struct SimulateConfig {
    /// Mean simulated job duration in milliseconds
    pub mean_ms: u64,
    /// Standard deviation of the simulated duration in milliseconds
    pub sd_ms: u64,
    /// Whether the simulator is allowed to crash deliberately
    pub can_die: bool,
}

impl Default for SimulateConfig {
    fn default() -> Self {
        Self {
            mean_ms: 1000,
            sd_ms: 500,
            can_die: true,
        }
    }
}

/// Settings for the worker-child supervision loop.
#[derive(Debug, Clone)]
pub struct ChildConfig {
    /// Ordinal assigned by the parent, starting at 1
    pub ordinal: usize,
    /// Inherited descriptor number of the back-channel pipe
    pub backchannel_fd: i32,
    /// Argument vector of the worker program to respawn
    pub exec: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_default() {
        let cfg = Config::default();
        assert!(cfg.workers >= 1);
        assert_eq!(cfg.fifo_depth, FIFO_DEPTH);
        assert!(cfg.port.is_none());
        assert!(cfg.connect.is_none());
        assert_eq!(cfg.overspill_per_worker, 2);
        assert!(cfg.exec.is_empty());
    }

    #[test]
    fn local_capacity_is_workers_times_depth() {
        let cfg = Config {
            workers: 4,
            fifo_depth: 3,
            ..Config::default()
        };
        assert_eq!(cfg.local_capacity(), 12);
    }

    #[test]
    fn advertised_capacity_includes_overspill_headroom() {
        let cfg = Config {
            workers: 2,
            fifo_depth: 3,
            overspill_per_worker: 2,
            ..Config::default()
        };
        assert_eq!(cfg.advertised_capacity(), 10);
    }

    #[test]
    fn simulate_config_default() {
        let cfg = SimulateConfig::default();
        assert_eq!(cfg.mean_ms, 1000);
        assert_eq!(cfg.sd_ms, 500);
        assert!(cfg.can_die);
    }
}
