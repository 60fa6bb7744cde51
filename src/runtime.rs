use std::io;

use tokio::runtime::{Builder, Runtime};

/// The two execution contexts the system runs on.
///
/// The control plane is a single-threaded runtime driving a `LocalSet`, so
/// admission, worker and peer state need no locking. The auxiliary context
/// is a small thread pool for work that must keep running even if the
/// control plane wedges: diagnostics draining and the watchdog halves that
/// monitor it.
pub struct Contexts {
    pub control: Runtime,
    pub auxiliary: Runtime,
}

impl Contexts {
    pub fn new() -> io::Result<Self> {
        let control = Builder::new_current_thread().enable_all().build()?;
        let auxiliary = Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("jobherd-aux")
            .enable_all()
            .build()?;
        Ok(Self { control, auxiliary })
    }
}
