use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::os::fd::AsRawFd;
use std::process::Stdio;
use std::rc::Rc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio_stream::wrappers::LinesStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::capacity::Job;
use crate::config::Config;
use crate::error::{exit_code, JobherdError, Result};
use crate::worker::WorkerPool;

/// One local worker subprocess: the job pipe, the result pipe, the
/// diagnostic pipe and the control back-channel, plus the bounded FIFO of
/// jobs the worker is currently holding.
///
/// The worker must reply in the order it was given commands; the FIFO is
/// the parent's record of that order.
pub struct WorkerLink {
    ordinal: usize,
    pid: u32,
    fifo_depth: usize,
    fifo: RefCell<VecDeque<Job>>,
    writer: RefCell<Option<mpsc::UnboundedSender<String>>>,
    resends: Cell<u64>,
    child: RefCell<Child>,
    dead: Cell<bool>,
}

/// The streams a freshly spawned link hands back for task wiring.
pub struct LinkIo {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
    pub backchannel: pipe::Receiver,
    pub writer_rx: mpsc::UnboundedReceiver<String>,
}

impl WorkerLink {
    /// Fork one worker-child process. Its three standard streams are piped;
    /// the back-channel write end is left inheritable and its descriptor
    /// number travels on the rewritten argument vector together with the
    /// ordinal and the banner suppression.
    pub fn spawn(ordinal: usize, config: &Config) -> Result<(Rc<WorkerLink>, LinkIo)> {
        let (bc_read, bc_write) =
            nix::unistd::pipe().map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;

        let mut child = Command::new(&config.child_program)
            .arg("--child")
            .arg(ordinal.to_string())
            .arg("--no-banner")
            .arg("--backchannel-fd")
            .arg(bc_write.as_raw_fd().to_string())
            .arg("--")
            .args(&config.exec)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;
        // The worker holds its own copy of the write end now.
        drop(bc_write);

        let backchannel = pipe::Receiver::from_owned_fd(bc_read)?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| JobherdError::Internal("worker stdin not captured".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| JobherdError::Internal("worker stdout not captured".into()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| JobherdError::Internal("worker stderr not captured".into()))?;
        let pid = child.id().unwrap_or_default();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        let link = Rc::new(WorkerLink {
            ordinal,
            pid,
            fifo_depth: config.fifo_depth,
            fifo: RefCell::new(VecDeque::with_capacity(config.fifo_depth)),
            writer: RefCell::new(Some(writer_tx)),
            resends: Cell::new(0),
            child: RefCell::new(child),
            dead: Cell::new(false),
        });
        let io = LinkIo {
            stdin,
            stdout,
            stderr,
            backchannel,
            writer_rx,
        };
        Ok((link, io))
    }

    pub fn ordinal(&self) -> usize {
        self.ordinal
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn fifo_len(&self) -> usize {
        self.fifo.borrow().len()
    }

    pub fn fifo_is_empty(&self) -> bool {
        self.fifo.borrow().is_empty()
    }

    pub fn fifo_is_full(&self) -> bool {
        self.fifo.borrow().len() >= self.fifo_depth
    }

    pub fn is_alive(&self) -> bool {
        !self.dead.get()
    }

    pub fn resends(&self) -> u64 {
        self.resends.get()
    }

    /// Queue a job on this worker: the command joins the FIFO and the line
    /// is handed to the writer task that owns the job pipe.
    pub fn submit(&self, job: Job) {
        let queued = {
            let writer = self.writer.borrow();
            match writer.as_ref() {
                Some(tx) => tx.send(job.text.clone()).is_ok(),
                None => false,
            }
        };
        if queued {
            self.fifo.borrow_mut().push_back(job);
        } else {
            tracing::error!(
                worker = self.ordinal,
                pid = self.pid,
                job = %job.text,
                "Submitted a job to a worker whose input is gone"
            );
        }
    }

    /// Close the job pipe; the worker sees EOF once the writer task drains.
    pub fn close_input(&self) {
        self.writer.borrow_mut().take();
    }

    pub fn kill(&self) {
        if let Err(err) = self.child.borrow_mut().start_kill() {
            tracing::warn!(
                worker = self.ordinal,
                pid = self.pid,
                error = %err,
                "Failed to kill worker"
            );
        }
    }

    /// Collect the exit status if the worker has died, marking the link
    /// dead so dispatch skips it.
    pub fn try_reap(&self) -> Option<std::process::ExitStatus> {
        match self.child.borrow_mut().try_wait() {
            Ok(Some(status)) => {
                self.dead.set(true);
                Some(status)
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(
                    worker = self.ordinal,
                    pid = self.pid,
                    error = %err,
                    "Failed to poll worker status"
                );
                None
            }
        }
    }

    /// Wait for the worker to exit. Only the shutdown path may call this,
    /// after the service tasks for the link have been stopped.
    pub async fn wait(&self) -> io::Result<std::process::ExitStatus> {
        let mut child = self.child.borrow_mut();
        child.wait().await
    }
}

/// Writer task owning the job pipe: drains the queue in order and writes
/// newline-terminated commands. A live worker losing its input pipe has no
/// recovery path, so a failed write aborts the process.
pub async fn feed_jobs(
    ordinal: usize,
    pid: u32,
    mut stdin: ChildStdin,
    mut queue: mpsc::UnboundedReceiver<String>,
) {
    while let Some(text) = queue.recv().await {
        let mut line = text.into_bytes();
        line.push(b'\n');
        if let Err(err) = write_line(&mut stdin, &line).await {
            tracing::error!(
                worker = ordinal,
                pid,
                error = %err,
                "Failed to write job to worker"
            );
            std::process::exit(exit_code::PIPE_WRITE);
        }
    }
    // Queue closed: dropping the pipe delivers EOF to the worker.
}

async fn write_line(stdin: &mut ChildStdin, line: &[u8]) -> io::Result<()> {
    stdin.write_all(line).await?;
    stdin.flush().await
}

/// The lazy sequence of result lines from the worker's stdout.
pub fn result_lines(stdout: ChildStdout) -> LinesStream<BufReader<ChildStdout>> {
    LinesStream::new(BufReader::new(stdout).lines())
}

/// Consume result lines and correlate them against the FIFO head. A line
/// matching the head completes that job; anything else is logged and
/// discarded — results are never matched by scanning ahead, so a worker
/// that replays work after a resend cannot complete the wrong entry.
pub async fn handle_results<F>(
    link: Rc<WorkerLink>,
    pool: Rc<WorkerPool>,
    stdout: ChildStdout,
    job_done: F,
) where
    F: Fn(Job),
{
    let mut lines = result_lines(stdout);
    while let Some(next) = lines.next().await {
        let line = match next {
            Ok(line) => line,
            Err(err) => {
                tracing::warn!(
                    worker = link.ordinal(),
                    pid = link.pid(),
                    error = %err,
                    "Read error from worker result stream"
                );
                break;
            }
        };
        // Some platforms deliver spurious NUL bytes at the start of a line;
        // they are noise, not data.
        let line = if line.contains('\0') {
            line.replace('\0', "")
        } else {
            line
        };
        if line.is_empty() {
            continue;
        }

        let completed = {
            let mut fifo = link.fifo.borrow_mut();
            let matches = fifo.front().map(|job| job.text == line).unwrap_or(false);
            if matches {
                let job = fifo.pop_front();
                if let Some(next) = fifo.front_mut() {
                    next.restart_timer();
                }
                job
            } else {
                None
            }
        };
        match completed {
            Some(job) => {
                pool.record_job_time(job.started.elapsed());
                tracing::debug!(
                    worker = link.ordinal(),
                    pid = link.pid(),
                    result = %line,
                    "Got result from worker"
                );
                job_done(job);
            }
            None => {
                let fifo = link.fifo.borrow();
                match fifo.front() {
                    Some(expected) => tracing::debug!(
                        worker = link.ordinal(),
                        input = %line,
                        expected = %expected.text,
                        "Ignored line from worker"
                    ),
                    None => tracing::debug!(
                        worker = link.ordinal(),
                        input = %line,
                        "Ignored line from idle worker"
                    ),
                }
            }
        }
    }
    tracing::info!(worker = link.ordinal(), pid = link.pid(), "Worker done");
}

/// Service the control back-channel: `'r'` asks for a replay of the queue
/// (or marks the worker useless once the system is draining), `'x'` reports
/// total exec failure, `'{'` opens an inline NUL-terminated JSON log record.
pub async fn handle_backchannel(
    link: Rc<WorkerLink>,
    backchannel: pipe::Receiver,
    draining: CancellationToken,
) {
    let mut reader = BufReader::new(backchannel);
    loop {
        let control = match reader.read_u8().await {
            Ok(byte) => byte,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(err) => {
                tracing::warn!(
                    worker = link.ordinal(),
                    error = %err,
                    "Read error on worker back-channel"
                );
                break;
            }
        };
        match control {
            b'r' => {
                if draining.is_cancelled() && link.fifo_is_empty() {
                    tracing::info!(
                        worker = link.ordinal(),
                        pid = link.pid(),
                        "Worker still respawning after drain, killing it"
                    );
                    link.kill();
                } else {
                    let texts: Vec<String> = link
                        .fifo
                        .borrow()
                        .iter()
                        .map(|job| job.text.clone())
                        .collect();
                    {
                        let writer = link.writer.borrow();
                        if let Some(tx) = writer.as_ref() {
                            for text in &texts {
                                let _ = tx.send(text.clone());
                            }
                        }
                    }
                    link.resends.set(link.resends.get() + 1);
                    tracing::warn!(
                        worker = link.ordinal(),
                        pid = link.pid(),
                        jobs = texts.len(),
                        "Worker requested resend, replaying its queue"
                    );
                }
            }
            b'x' => {
                tracing::error!(
                    worker = link.ordinal(),
                    pid = link.pid(),
                    "Worker could not exec its program"
                );
                std::process::exit(exit_code::EXEC_FAILED);
            }
            b'{' => {
                let mut record = vec![b'{'];
                if let Err(err) = reader.read_until(0, &mut record).await {
                    tracing::warn!(
                        worker = link.ordinal(),
                        error = %err,
                        "Read error in worker log record"
                    );
                    break;
                }
                if record.last() == Some(&0) {
                    record.pop();
                }
                match serde_json::from_slice::<serde_json::Value>(&record) {
                    Ok(value) => crate::logging::replay_worker_record(link.ordinal(), &value),
                    Err(err) => tracing::warn!(
                        worker = link.ordinal(),
                        error = %err,
                        "Unparseable log record from worker back-channel"
                    ),
                }
            }
            other => tracing::warn!(
                worker = link.ordinal(),
                control = other,
                "Unknown control byte from worker back-channel"
            ),
        }
    }
}

/// Drain the diagnostic stream on the auxiliary context, forwarding each
/// line tagged with the worker's identity; JSON lines become structured
/// records.
pub async fn drain_diagnostics(ordinal: usize, pid: u32, stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match serde_json::from_str::<serde_json::Value>(&line) {
                Ok(value) if value.is_object() => {
                    crate::logging::replay_worker_record(ordinal, &value)
                }
                _ => tracing::info!(worker = ordinal, pid, line = %line, "Worker stderr"),
            },
            Ok(None) => break,
            Err(err) => {
                tracing::warn!(worker = ordinal, pid, error = %err, "Worker stderr read error");
                break;
            }
        }
    }
}
