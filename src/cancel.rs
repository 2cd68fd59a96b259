use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Cooperative cancellation shared by the scanner, workers and monitor.
///
/// The flag side answers `is_cancelled` between units of work; `done()` is a
/// channel that disconnects when the token fires, so it can sit in a
/// `select!` arm next to regular mailboxes. In-flight work is never
/// preempted.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    holder: Arc<Mutex<Option<Sender<()>>>>,
    done: Receiver<()>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = bounded::<()>(0);
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            holder: Arc::new(Mutex::new(Some(tx))),
            done: rx,
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.holder.lock().unwrap().take();
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Never yields a value; disconnects once `cancel` runs.
    pub fn done(&self) -> &Receiver<()> {
        &self.done
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
