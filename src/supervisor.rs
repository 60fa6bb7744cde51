use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::rc::Rc;
use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tokio::net::unix::pipe;
use tokio::net::TcpStream;
use tokio::runtime::Handle;
use tokio::task::{JoinHandle, LocalSet};

use crate::capacity::{Capacity, Job};
use crate::config::Config;
use crate::error::{exit_code, JobherdError, Result};
use crate::net::connection::{self, Role};
use crate::net::registry::Registry;
use crate::net::server;
use crate::runtime::Contexts;
use crate::watchdog;
use crate::worker::link::LinkIo;
use crate::worker::{link, WorkerPool};

/// Run as the supervisor: fork workers, read jobs from standard input,
/// distribute them, and optionally listen for peers offering capacity.
/// Returns the process exit code once all admitted work has completed.
pub fn run_supervisor(config: Config, registry: Arc<Registry>) -> Result<i32> {
    let contexts = Contexts::new()?;
    let auxiliary = contexts.auxiliary.handle().clone();
    let local = LocalSet::new();
    local.block_on(&contexts.control, async move {
        watchdog::cross_monitor(&auxiliary);

        let (pool, link_io) = spawn_pool(&config);
        let (capacity, spills) = Capacity::new(
            pool.clone(),
            registry.clone(),
            Box::new(io::stdout()),
            config.overspill_per_worker * config.workers as u64,
        );
        let mut tasks = wire(&pool, link_io, &capacity, &auxiliary);
        tasks.push(tokio::task::spawn_local(WorkerPool::reap_loop(pool.clone())));
        tasks.push(tokio::task::spawn_local(Capacity::consume_overspill(
            capacity.clone(),
            spills,
        )));
        if let Some(port) = config.port {
            tasks.push(tokio::task::spawn_local(server::start(
                port,
                capacity.clone(),
                registry.clone(),
            )));
        }

        feed_stdin(&capacity).await;
        capacity.close_input();
        capacity.drained().cancelled().await;

        for task in &tasks {
            task.abort();
        }
        pool.shutdown().await;
        dump_stats(&pool, &capacity);
        Ok(0)
    })
}

/// Run as a network peer: fork workers, connect out to a supervisor and
/// execute the jobs it dispatches until the connection closes.
pub fn run_netvisor(config: Config, registry: Arc<Registry>) -> Result<i32> {
    let contexts = Contexts::new()?;
    let auxiliary = contexts.auxiliary.handle().clone();
    let local = LocalSet::new();
    local.block_on(&contexts.control, async move {
        watchdog::cross_monitor(&auxiliary);

        let (pool, link_io) = spawn_pool(&config);
        let (capacity, spills) = Capacity::new(
            pool.clone(),
            registry.clone(),
            Box::new(io::stdout()),
            config.overspill_per_worker * config.workers as u64,
        );
        let mut tasks = wire(&pool, link_io, &capacity, &auxiliary);
        tasks.push(tokio::task::spawn_local(WorkerPool::reap_loop(pool.clone())));
        tasks.push(tokio::task::spawn_local(Capacity::consume_overspill(
            capacity.clone(),
            spills,
        )));

        let host = config
            .connect
            .clone()
            .ok_or_else(|| JobherdError::Config("peer mode requires a host".into()))?;
        let port = config
            .port
            .ok_or_else(|| JobherdError::Config("peer mode requires a port".into()))?;
        let stream = TcpStream::connect((host.as_str(), port)).await?;
        let cnx = connection::establish(stream, Role::Client, capacity.clone(), registry.clone());
        tracing::info!(host = %host, port, connection = %cnx.id, "Connection established");

        cnx.closed().cancelled().await;
        // The supervisor is gone; anything a worker asks to resend now is
        // work nobody can acknowledge.
        capacity.drained().cancel();

        for task in &tasks {
            task.abort();
        }
        pool.shutdown().await;
        dump_stats(&pool, &capacity);
        Ok(0)
    })
}

fn spawn_pool(config: &Config) -> (Rc<WorkerPool>, Vec<LinkIo>) {
    match WorkerPool::spawn(config) {
        Ok(spawned) => spawned,
        Err(err) => {
            tracing::error!(error = %err, "Failed to fork workers");
            std::process::exit(exit_code::SPAWN_FAILED);
        }
    }
}

/// Attach the per-link service tasks: the job writer, result correlation
/// and back-channel handling on the control plane; the diagnostic drain on
/// the auxiliary context.
pub fn wire(
    pool: &Rc<WorkerPool>,
    link_io: Vec<LinkIo>,
    capacity: &Rc<Capacity>,
    auxiliary: &Handle,
) -> Vec<JoinHandle<()>> {
    let mut tasks = Vec::new();
    for (worker, streams) in pool.links().iter().cloned().zip(link_io) {
        tasks.push(tokio::task::spawn_local(link::feed_jobs(
            worker.ordinal(),
            worker.pid(),
            streams.stdin,
            streams.writer_rx,
        )));
        let job_done = {
            let capacity = capacity.clone();
            move |job: Job| capacity.job_done(job)
        };
        tasks.push(tokio::task::spawn_local(link::handle_results(
            worker.clone(),
            pool.clone(),
            streams.stdout,
            job_done,
        )));
        tasks.push(tokio::task::spawn_local(link::handle_backchannel(
            worker.clone(),
            streams.backchannel,
            capacity.drained(),
        )));
        auxiliary.spawn(link::drain_diagnostics(
            worker.ordinal(),
            worker.pid(),
            streams.stderr,
        ));
    }
    tasks
}

/// Queue each line from standard input as a job, suspending on admission.
async fn feed_stdin(capacity: &Rc<Capacity>) {
    let receiver = match attach_stdin() {
        Ok(receiver) => receiver,
        Err(err) => {
            tracing::error!(error = %err, "Cannot attach stdin to the event loop");
            eprintln!(
                "Cannot attach stdin to the event loop. This probably means \
                 you're trying to redirect a file rather than pipe the \
                 commands\n\nI.e. try this:\n   cat commands.txt | jobherd\n\
                 instead of\n   jobherd < commands.txt"
            );
            std::process::exit(exit_code::STDIN_NOT_PIPE);
        }
    };
    let mut lines = tokio::io::BufReader::new(receiver).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line: String = line.chars().filter(|c| *c != '\0').collect();
                if line.is_empty() {
                    continue;
                }
                capacity.submit_input(line).await;
            }
            Ok(None) => break,
            Err(err) => {
                tracing::info!(error = %err, "Input error, presumed end of work");
                break;
            }
        }
    }
}

fn attach_stdin() -> io::Result<pipe::Receiver> {
    let fd: OwnedFd = io::stdin().as_fd().try_clone_to_owned()?;
    pipe::Receiver::from_owned_fd(fd)
}

fn dump_stats(pool: &WorkerPool, capacity: &Capacity) {
    let stats = serde_json::json!({
        "jobs": {
            "accepted": capacity.accepted(),
            "completed": capacity.completed(),
        },
        "job_times": pool.job_times_json(),
    });
    eprintln!("{stats}");
}
