use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io::Write;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{exit_code, JobherdError, Result};
use crate::limiter::{Limiter, Permit};
use crate::net::frame::Frame;
use crate::net::registry::Registry;
use crate::worker::WorkerPool;

/// One admitted unit of work. The permit it carries is the admission slot;
/// dropping the job returns the slot to the limiter.
pub struct Job {
    pub text: String,
    /// Connection the job arrived from, when it was dispatched to us by a
    /// peer; completions are acknowledged back to it.
    pub origin: Option<Uuid>,
    pub started: Instant,
    _permit: Permit,
}

impl Job {
    pub fn new(text: String, origin: Option<Uuid>, permit: Permit) -> Self {
        Self {
            text,
            origin,
            started: Instant::now(),
            _permit: permit,
        }
    }

    pub fn restart_timer(&mut self) {
        self.started = Instant::now();
    }
}

/// Work returned for re-dispatch: jobs taken back from a detached peer and
/// jobs a peer has dispatched to us.
pub struct Spill {
    pub origin: Option<Uuid>,
    pub text: String,
}

struct Peer {
    advertised: u64,
    outstanding: HashMap<String, Job>,
    outbound: mpsc::UnboundedSender<Frame>,
}

/// The admission controller: bounds total in-flight work and routes each
/// admitted job to a peer with spare capacity first, else round-robin
/// across the local workers.
pub struct Capacity {
    limiter: Limiter,
    pool: Rc<WorkerPool>,
    registry: Arc<Registry>,
    peers: RefCell<HashMap<Uuid, Peer>>,
    cursor: Cell<usize>,
    overspill: mpsc::UnboundedSender<Spill>,
    overspill_pending: Cell<usize>,
    overspill_headroom: u64,
    input_closed: Cell<bool>,
    accepted: Cell<u64>,
    completed: Cell<u64>,
    drained: CancellationToken,
    sink: RefCell<Box<dyn Write>>,
}

impl Capacity {
    /// Create the controller sized to the local workers. The returned
    /// receiver is the overspill output; run [`Capacity::consume_overspill`]
    /// on it to feed the work back through `next_job`.
    pub fn new(
        pool: Rc<WorkerPool>,
        registry: Arc<Registry>,
        sink: Box<dyn Write>,
        overspill_headroom: u64,
    ) -> (Rc<Capacity>, mpsc::UnboundedReceiver<Spill>) {
        let (overspill, rx) = mpsc::unbounded_channel();
        let capacity = Rc::new(Capacity {
            limiter: Limiter::new(pool.local_capacity()),
            pool,
            registry,
            peers: RefCell::new(HashMap::new()),
            cursor: Cell::new(0),
            overspill,
            overspill_pending: Cell::new(0),
            overspill_headroom,
            input_closed: Cell::new(false),
            accepted: Cell::new(0),
            completed: Cell::new(0),
            drained: CancellationToken::new(),
            sink: RefCell::new(sink),
        });
        (capacity, rx)
    }

    /// Current total capacity, local plus peers.
    pub fn size(&self) -> u64 {
        self.limiter.capacity()
    }

    pub fn outstanding(&self) -> u64 {
        self.limiter.outstanding()
    }

    pub fn accepted(&self) -> u64 {
        self.accepted.get()
    }

    pub fn completed(&self) -> u64 {
        self.completed.get()
    }

    /// Capacity advertised to a peer supervisor: everything we can take now
    /// plus the configured overspill headroom.
    pub fn advertised_capacity(&self) -> u64 {
        self.limiter.capacity() + self.overspill_headroom
    }

    /// Take one job from standard input.
    pub async fn submit_input(&self, text: String) {
        self.accepted.set(self.accepted.get() + 1);
        self.next_job(None, text).await;
    }

    /// Take one job dispatched to us by a peer. It goes through the
    /// overspill queue so admission happens on the control loop, not in the
    /// frame handler.
    pub fn enqueue_remote(&self, origin: Uuid, text: String) {
        self.accepted.set(self.accepted.get() + 1);
        tracing::debug!(connection = %origin, job = %text, "Received job from peer");
        self.spill(Some(origin), text);
    }

    /// Suspend until the limiter yields a permit, then place the job.
    /// Network capacity is scarcer than local slots and is kept utilized
    /// first; local dispatch rotates a cursor so no worker is starved.
    pub async fn next_job(&self, origin: Option<Uuid>, text: String) {
        let permit = self.limiter.acquire().await;
        let job = Job::new(text, origin, permit);

        let target = {
            let peers = self.peers.borrow();
            peers
                .iter()
                .find(|(_, peer)| (peer.outstanding.len() as u64) < peer.advertised)
                .map(|(id, _)| *id)
        };
        if let Some(id) = target {
            self.dispatch_to_peer(id, job);
            return;
        }

        let links = self.pool.links();
        let count = links.len();
        for offset in 0..count {
            let index = (self.cursor.get() + offset) % count;
            let link = &links[index];
            if link.is_alive() && !link.fifo_is_full() {
                self.cursor.set((index + 1) % count);
                tracing::debug!(
                    worker = link.ordinal(),
                    job = %job.text,
                    "Dispatching job to worker"
                );
                link.submit(job);
                return;
            }
        }
        tracing::error!(job = %job.text, "Got a job and nowhere to put it");
        std::process::exit(exit_code::NO_SLOT);
    }

    fn dispatch_to_peer(&self, id: Uuid, mut job: Job) {
        {
            let mut peers = self.peers.borrow_mut();
            if let Some(peer) = peers.get_mut(&id) {
                let frame = Frame::Execute {
                    job: job.text.clone(),
                };
                if peer.outbound.send(frame).is_ok() {
                    tracing::debug!(connection = %id, job = %job.text, "Dispatching job to peer");
                    job.restart_timer();
                    peer.outstanding.insert(job.text.clone(), job);
                    return;
                }
                tracing::warn!(
                    connection = %id,
                    job = %job.text,
                    "Peer outbound queue closed, respooling job"
                );
            }
        }
        // The peer is gone or going; its disconnect handler will not see
        // this job, so respool it ourselves.
        let Job { text, origin, .. } = job;
        self.spill(origin, text);
    }

    /// A local worker finished a job.
    pub fn job_done(&self, job: Job) {
        self.finish(job);
    }

    /// A peer reported completion of a job we dispatched to it.
    pub fn job_done_remote(&self, peer: Uuid, text: &str) {
        let job = {
            let mut peers = self.peers.borrow_mut();
            match peers.get_mut(&peer) {
                Some(entry) => entry.outstanding.remove(text),
                None => None,
            }
        };
        match job {
            Some(job) => self.finish(job),
            None => tracing::warn!(
                connection = %peer,
                job = %text,
                "Peer reported completion of a job it does not hold"
            ),
        }
    }

    fn finish(&self, job: Job) {
        self.completed.set(self.completed.get() + 1);
        match job.origin {
            None => {
                let mut sink = self.sink.borrow_mut();
                let written = writeln!(sink, "{}", job.text).and_then(|_| sink.flush());
                if let Err(err) = written {
                    tracing::warn!(error = %err, job = %job.text, "Failed to report completed job");
                }
            }
            Some(origin) => {
                let frame = Frame::Completed {
                    job: job.text.clone(),
                };
                if !self.registry.send_to(origin, frame) {
                    tracing::warn!(
                        connection = %origin,
                        job = %job.text,
                        "Origin of completed job is gone, acknowledgement dropped"
                    );
                }
            }
        }
        drop(job);
        self.check_drained();
    }

    /// Register a peer's advertised capacity, raising the limiter by the
    /// same amount. A known peer advertising again is an error.
    pub fn additional(
        &self,
        peer: Uuid,
        advertised: u64,
        outbound: mpsc::UnboundedSender<Frame>,
    ) -> Result<()> {
        let mut peers = self.peers.borrow_mut();
        if peers.contains_key(&peer) {
            return Err(JobherdError::PeerAlreadyRegistered(peer));
        }
        let old = self.limiter.capacity();
        peers.insert(
            peer,
            Peer {
                advertised,
                outstanding: HashMap::new(),
                outbound,
            },
        );
        self.limiter.add(advertised);
        tracing::info!(
            connection = %peer,
            advertised,
            old_capacity = old,
            new_capacity = self.limiter.capacity(),
            "Peer attached, adding capacity"
        );
        Ok(())
    }

    /// A peer disconnected: push its outstanding jobs to the overspill
    /// output for re-dispatch and lower the limiter by its advertised
    /// amount. Unknown peers are a no-op, so a connection that never
    /// advertised can disconnect silently.
    pub fn overspill_work(&self, peer: Uuid) {
        let Some(entry) = self.peers.borrow_mut().remove(&peer) else {
            return;
        };
        tracing::warn!(
            connection = %peer,
            jobs = entry.outstanding.len(),
            advertised = entry.advertised,
            "Peer detached, re-distributing its outstanding work"
        );
        for (_, job) in entry.outstanding {
            let Job { text, origin, .. } = job;
            self.spill(origin, text);
        }
        self.limiter.reduce(entry.advertised);
        self.check_drained();
    }

    fn spill(&self, origin: Option<Uuid>, text: String) {
        self.overspill_pending.set(self.overspill_pending.get() + 1);
        let _ = self.overspill.send(Spill { origin, text });
    }

    /// Re-consume the overspill output, resubmitting each job through
    /// `next_job` with its origin preserved.
    pub async fn consume_overspill(
        capacity: Rc<Capacity>,
        mut spills: mpsc::UnboundedReceiver<Spill>,
    ) {
        while let Some(spill) = spills.recv().await {
            capacity.next_job(spill.origin, spill.text).await;
            capacity
                .overspill_pending
                .set(capacity.overspill_pending.get() - 1);
        }
    }

    /// Mark the input stream fully consumed.
    pub fn close_input(&self) {
        self.input_closed.set(true);
        self.check_drained();
    }

    pub fn input_closed(&self) -> bool {
        self.input_closed.get()
    }

    /// True once the input is fully consumed and no work is outstanding or
    /// waiting for re-dispatch. Monotone: latched by the drained token.
    pub fn all_done(&self) -> bool {
        self.drained.is_cancelled()
    }

    /// Token cancelled when `all_done` becomes true; the completion wait
    /// and the back-channel handlers watch it.
    pub fn drained(&self) -> CancellationToken {
        self.drained.clone()
    }

    fn check_drained(&self) {
        if self.input_closed.get()
            && self.limiter.outstanding() == 0
            && self.overspill_pending.get() == 0
            && !self.drained.is_cancelled()
        {
            tracing::info!(completed = self.completed.get(), "All work complete");
            self.drained.cancel();
        }
    }
}
