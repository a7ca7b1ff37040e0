//! Cooperative interruption of blocking calls.
//!
//! Every thread has an interruption flag. Another thread can set it through
//! an [`Interrupter`] obtained on the target thread. A blocking wait checks
//! the flag before sleeping and is woken when the flag is raised while it
//! sleeps. The wait clears the flag before returning
//! [`SessionError::Interrupted`](crate::SessionError::Interrupted), so it
//! never leaks into the next call on the same thread.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

type Waker = Arc<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct InterruptState {
    flag: AtomicBool,
    waker: Mutex<Option<Waker>>,
}

thread_local! {
    static CURRENT: Arc<InterruptState> = Arc::new(InterruptState::default());
}

/// Handle that can interrupt one particular thread.
///
/// ```rust,ignore
/// let interrupter = Interrupter::current();
/// std::thread::spawn(move || interrupter.interrupt());
/// // a blocked upload/download on the original thread now fails with Interrupted
/// ```
#[derive(Clone)]
pub struct Interrupter {
    state: Arc<InterruptState>,
}

impl Interrupter {
    /// Returns the interrupter of the calling thread.
    pub fn current() -> Self {
        Self {
            state: CURRENT.with(Arc::clone),
        }
    }

    /// Raises the interruption flag and wakes the thread if it is blocked.
    pub fn interrupt(&self) {
        self.state.flag.store(true, Ordering::SeqCst);
        let waker = self.state.waker.lock().clone();
        if let Some(wake) = waker {
            wake();
        }
    }

    /// Returns true if the flag is raised.
    pub fn is_interrupted(&self) -> bool {
        self.state.flag.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Interrupter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interrupter")
            .field("interrupted", &self.is_interrupted())
            .finish()
    }
}

/// Returns true if the calling thread's interruption flag is raised.
pub fn interrupted() -> bool {
    CURRENT.with(|state| state.flag.load(Ordering::SeqCst))
}

/// Clears the calling thread's flag, returning whether it was raised.
pub(crate) fn take_interrupt() -> bool {
    CURRENT.with(|state| state.flag.swap(false, Ordering::SeqCst))
}

/// Keeps a waker registered for the calling thread while alive.
pub(crate) struct WakerGuard {
    state: Arc<InterruptState>,
}

/// Registers `wake` to run when the calling thread gets interrupted.
///
/// `wake` must take the lock the waiter sleeps under before notifying,
/// otherwise a wake-up between the flag check and the sleep is lost.
pub(crate) fn register_waker(wake: impl Fn() + Send + Sync + 'static) -> WakerGuard {
    let state = CURRENT.with(Arc::clone);
    *state.waker.lock() = Some(Arc::new(wake));
    WakerGuard { state }
}

impl Drop for WakerGuard {
    fn drop(&mut self) {
        self.state.waker.lock().take();
    }
}
