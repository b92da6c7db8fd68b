//! Debounced sync trigger.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;

/// One cancellable timer per domain.
///
/// The first trigger arms the timer; later triggers are absorbed until it
/// fires, so a burst of mutations yields one sync. Firing spawns the action
/// as its own task, so `cancel` never interrupts a sync that already started.
pub struct Debouncer {
    delay: Duration,
    armed: Arc<AtomicBool>,
    timer: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            armed: Arc::new(AtomicBool::new(false)),
            timer: Mutex::new(None),
        }
    }

    pub const fn delay(&self) -> Duration {
        self.delay
    }

    /// Arm the timer unless it is already armed. Returns whether a new timer was armed.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn trigger<F, Fut>(&self, action: F) -> bool
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if self.armed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let armed = Arc::clone(&self.armed);
        let delay = self.delay;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if armed.swap(false, Ordering::AcqRel) {
                tokio::spawn(action());
            }
        });

        // Any previous handle belongs to a timer that already fired or was cancelled
        if let Some(previous) = self.lock_timer().replace(timer) {
            previous.abort();
        }
        true
    }

    /// Drop an armed timer. Returns whether one was armed.
    pub fn cancel(&self) -> bool {
        let was_armed = self.armed.swap(false, Ordering::AcqRel);
        if let Some(timer) = self.lock_timer().take() {
            timer.abort();
        }
        if was_armed {
            tracing::debug!("Cancelled scheduled sync");
        }
        was_armed
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    fn lock_timer(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.timer.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}
