//! Test harness for driving the admission engine against real worker
//! subprocesses.
//!
//! Workers are spawned through the actual binary (worker-child mode) with a
//! small shell script standing in for the worker program, so the FIFO,
//! back-channel and resend paths are all exercised for real.

#![allow(dead_code)]

use std::io;
use std::path::PathBuf;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use jobherd::capacity::Capacity;
use jobherd::config::Config;
use jobherd::net::registry::Registry;
use jobherd::supervisor;
use jobherd::worker::WorkerPool;

/// Shell worker that echoes each command straight back.
pub const ECHO_WORKER: &str = "while read line; do echo \"$line\"; done";

/// Shell worker that holds each command briefly before echoing, so queue
/// occupancy can be observed.
pub const SLOW_WORKER: &str = "while read line; do sleep 0.3; echo \"$line\"; done";

pub fn test_config(workers: usize, script: &str) -> Config {
    Config {
        workers,
        child_program: PathBuf::from(env!("CARGO_BIN_EXE_jobherd")),
        exec: vec!["/bin/sh".to_string(), "-c".to_string(), script.to_string()],
        ..Config::default()
    }
}

/// Completed-job sink capturing output lines for assertions.
#[derive(Clone, Default)]
pub struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl SharedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        let bytes = self.0.lock().expect("sink lock");
        String::from_utf8_lossy(&bytes)
            .lines()
            .map(str::to_string)
            .collect()
    }
}

impl io::Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().expect("sink lock").extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// A wired pool and admission controller with the service tasks running on
/// the current `LocalSet`.
pub struct Engine {
    pub pool: Rc<WorkerPool>,
    pub capacity: Rc<Capacity>,
    pub registry: Arc<Registry>,
    pub sink: SharedSink,
    tasks: Vec<JoinHandle<()>>,
}

impl Engine {
    pub fn start(config: &Config) -> Engine {
        let registry = Arc::new(Registry::new());
        let sink = SharedSink::new();
        let (pool, link_io) = WorkerPool::spawn(config).expect("workers spawn");
        let (capacity, spills) = Capacity::new(
            pool.clone(),
            registry.clone(),
            Box::new(sink.clone()),
            config.overspill_per_worker * config.workers as u64,
        );
        let mut tasks = supervisor::wire(&pool, link_io, &capacity, &Handle::current());
        tasks.push(tokio::task::spawn_local(WorkerPool::reap_loop(pool.clone())));
        tasks.push(tokio::task::spawn_local(Capacity::consume_overspill(
            capacity.clone(),
            spills,
        )));
        Engine {
            pool,
            capacity,
            registry,
            sink,
            tasks,
        }
    }

    /// Close the input, wait for every admitted job to complete, then stop
    /// the tasks and reap the workers. Returns the completed-job lines.
    pub async fn finish(self) -> Vec<String> {
        self.capacity.close_input();
        tokio::time::timeout(Duration::from_secs(20), self.capacity.drained().cancelled())
            .await
            .expect("all jobs complete before the deadline");
        for task in &self.tasks {
            task.abort();
        }
        self.pool.shutdown().await;
        self.sink.lines()
    }

    /// Stop without waiting for outstanding work.
    pub async fn abandon(self) {
        for task in &self.tasks {
            task.abort();
        }
        self.pool.shutdown().await;
    }
}

/// Poll a condition until it holds or the deadline passes.
pub async fn assert_eventually<F>(deadline: Duration, what: &str, check: F)
where
    F: Fn() -> bool,
{
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}
