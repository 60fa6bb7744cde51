use std::cell::RefCell;
use std::os::unix::process::ExitStatusExt;
use std::rc::Rc;
use std::time::Duration;

use tokio::signal::unix::{signal, SignalKind};

use crate::config::Config;
use crate::error::{exit_code, Result};
use crate::worker::link::{LinkIo, WorkerLink};
use crate::worker::profile::DurationProfile;

/// The set of local worker links plus the rolling job-duration profile.
pub struct WorkerPool {
    links: Vec<Rc<WorkerLink>>,
    local_capacity: u64,
    job_times: RefCell<DurationProfile>,
}

impl WorkerPool {
    /// Fork the configured number of worker links.
    pub fn spawn(config: &Config) -> Result<(Rc<WorkerPool>, Vec<LinkIo>)> {
        let mut links = Vec::with_capacity(config.workers);
        let mut io = Vec::with_capacity(config.workers);
        for ordinal in 1..=config.workers {
            let (link, link_io) = WorkerLink::spawn(ordinal, config)?;
            tracing::info!(
                worker = link.ordinal(),
                pid = link.pid(),
                "Started worker process"
            );
            links.push(link);
            io.push(link_io);
        }
        let pool = Rc::new(WorkerPool {
            local_capacity: (links.len() * config.fifo_depth) as u64,
            links,
            job_times: RefCell::new(DurationProfile::new(Duration::from_millis(1), 1.2, 64)),
        });
        Ok((pool, io))
    }

    pub fn links(&self) -> &[Rc<WorkerLink>] {
        &self.links
    }

    /// Total number of jobs the local workers can hold at once.
    pub fn local_capacity(&self) -> u64 {
        self.local_capacity
    }

    pub fn record_job_time(&self, elapsed: Duration) {
        self.job_times.borrow_mut().record(elapsed);
    }

    pub fn job_times_json(&self) -> serde_json::Value {
        serde_json::to_value(&*self.job_times.borrow()).unwrap_or(serde_json::Value::Null)
    }

    /// React to child-death notifications. A worker dying with an empty
    /// queue is a race against normal shutdown and only worth a log line;
    /// one dying with queued jobs means admitted work would be lost, which
    /// has no recovery path.
    pub async fn reap_loop(pool: Rc<WorkerPool>) {
        let mut sigchld = signal(SignalKind::child()).expect("failed to install SIGCHLD handler");
        while sigchld.recv().await.is_some() {
            for link in pool.links.iter().filter(|link| link.is_alive()) {
                let Some(status) = link.try_reap() else {
                    continue;
                };
                if link.fifo_is_empty() {
                    tracing::info!(
                        worker = link.ordinal(),
                        pid = link.pid(),
                        code = ?status.code(),
                        "Worker exited with an empty queue"
                    );
                } else {
                    tracing::error!(
                        worker = link.ordinal(),
                        pid = link.pid(),
                        code = ?status.code(),
                        signal = ?status.signal(),
                        queued = link.fifo_len(),
                        "Worker died holding queued jobs"
                    );
                    std::process::exit(exit_code::WORKER_DIED);
                }
            }
        }
    }

    /// Close every worker's job pipe and wait for the processes to finish.
    /// The per-link service tasks must already be stopped.
    pub async fn shutdown(&self) {
        for link in &self.links {
            link.close_input();
        }
        for link in &self.links {
            match link.wait().await {
                Ok(status) => tracing::debug!(
                    worker = link.ordinal(),
                    pid = link.pid(),
                    code = ?status.code(),
                    "Worker reaped"
                ),
                Err(err) => tracing::warn!(
                    worker = link.ordinal(),
                    pid = link.pid(),
                    error = %err,
                    "Failed to reap worker"
                ),
            }
        }
    }
}
