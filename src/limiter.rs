use std::cell::Cell;
use std::rc::Rc;

use tokio::sync::Notify;

/// Counting admission limiter bounding total in-flight jobs system-wide.
///
/// Capacity changes live as peers attach and detach, and may drop below the
/// number of currently held permits; `acquire` then suspends until enough
/// permits are returned. All state is owned by the control-plane context, so
/// plain `Cell` counters with a `Notify` wake are sufficient — no locking.
#[derive(Clone)]
pub struct Limiter {
    inner: Rc<Inner>,
}

struct Inner {
    capacity: Cell<u64>,
    outstanding: Cell<u64>,
    notify: Notify,
}

/// One unit of admitted work. Dropping it returns the slot to the limiter
/// and wakes any suspended `acquire`.
pub struct Permit {
    inner: Rc<Inner>,
}

impl Limiter {
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Rc::new(Inner {
                capacity: Cell::new(capacity),
                outstanding: Cell::new(0),
                notify: Notify::new(),
            }),
        }
    }

    /// Suspend until a slot is free, then take it.
    pub async fn acquire(&self) -> Permit {
        loop {
            if self.inner.outstanding.get() < self.inner.capacity.get() {
                self.inner.outstanding.set(self.inner.outstanding.get() + 1);
                return Permit {
                    inner: Rc::clone(&self.inner),
                };
            }
            self.inner.notify.notified().await;
        }
    }

    /// Raise capacity by `n`, waking suspended acquirers.
    pub fn add(&self, n: u64) {
        self.inner.capacity.set(self.inner.capacity.get() + n);
        self.inner.notify.notify_waiters();
    }

    /// Lower capacity by `n`. Held permits are unaffected; `outstanding` may
    /// exceed the new capacity until they are returned.
    pub fn reduce(&self, n: u64) {
        self.inner
            .capacity
            .set(self.inner.capacity.get().saturating_sub(n));
    }

    pub fn capacity(&self) -> u64 {
        self.inner.capacity.get()
    }

    pub fn outstanding(&self) -> u64 {
        self.inner.outstanding.get()
    }
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.inner.outstanding.set(self.inner.outstanding.get() - 1);
        self.inner.notify.notify_waiters();
    }
}
