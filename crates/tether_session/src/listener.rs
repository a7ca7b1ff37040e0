//! Listener registration and dispatch.
//!
//! Two listener capabilities exist: [`ConnectionListener`] for connection
//! state transitions and [`ErrorHandler`] for errors reported outside of any
//! call (fatal divergence, other fatal transport errors). Each has its own
//! [`ListenerRegistry`].
//!
//! Registrations are keyed by the identity of the `Arc` that was added, not
//! by value: two distinct listeners that happen to compare equal are two
//! registrations.

use crate::connection::ConnectionState;
use crate::reset::SessionErrorEvent;
use crate::session::SyncSession;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::error;

/// Callback for connection state transitions.
pub trait ConnectionListener: Send + Sync {
    /// Called once per transition with the old and new state.
    fn on_change(&self, old: ConnectionState, new: ConnectionState);
}

impl<F> ConnectionListener for F
where
    F: Fn(ConnectionState, ConnectionState) + Send + Sync,
{
    fn on_change(&self, old: ConnectionState, new: ConnectionState) {
        self(old, new)
    }
}

/// Callback for errors that are not the result of a call.
pub trait ErrorHandler: Send + Sync {
    /// Called synchronously with the affected session.
    fn on_error(&self, session: &SyncSession, event: &SessionErrorEvent);
}

impl<F> ErrorHandler for F
where
    F: Fn(&SyncSession, &SessionErrorEvent) + Send + Sync,
{
    fn on_error(&self, session: &SyncSession, event: &SessionErrorEvent) {
        self(session, event)
    }
}

/// Receives panics raised by listeners during dispatch.
pub type UnhandledErrorHook = Arc<dyn Fn(&str) + Send + Sync>;

struct Registration<L: ?Sized> {
    listener: Arc<L>,
    active: AtomicBool,
}

/// Thread-safe, insertion-ordered set of listeners.
///
/// Dispatch works on a snapshot, so listeners may add or remove listeners
/// (including themselves) from inside a callback. A listener removed before
/// dispatch reaches it is skipped.
pub struct ListenerRegistry<L: ?Sized> {
    entries: Mutex<Vec<Arc<Registration<L>>>>,
    hook: Option<UnhandledErrorHook>,
}

impl<L: ?Sized + Send + Sync> ListenerRegistry<L> {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            hook: None,
        }
    }

    /// Creates a registry that reports listener panics to `hook`.
    pub fn with_hook(hook: Option<UnhandledErrorHook>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            hook,
        }
    }

    /// Adds a listener. Returns false if this exact listener is already registered.
    pub fn add(&self, listener: Arc<L>) -> bool {
        let mut entries = self.entries.lock();
        if entries.iter().any(|r| same(&r.listener, &listener)) {
            return false;
        }
        entries.push(Arc::new(Registration {
            listener,
            active: AtomicBool::new(true),
        }));
        true
    }

    /// Removes the registration of this exact listener, if any.
    pub fn remove(&self, listener: &Arc<L>) -> bool {
        let mut entries = self.entries.lock();
        match entries.iter().position(|r| same(&r.listener, listener)) {
            Some(index) => {
                let registration = entries.remove(index);
                registration.active.store(false, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Removes every listener.
    pub fn clear(&self) {
        for registration in self.entries.lock().drain(..) {
            registration.active.store(false, Ordering::SeqCst);
        }
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Invokes `call` on every registered listener, in registration order, on
    /// the calling thread.
    ///
    /// A panicking listener does not stop the dispatch; the panic goes to the
    /// unhandled error hook and the log instead of the caller.
    pub fn dispatch(&self, call: impl Fn(&L)) {
        let snapshot: Vec<_> = self.entries.lock().iter().cloned().collect();
        for registration in snapshot {
            if !registration.active.load(Ordering::SeqCst) {
                continue;
            }
            let result = panic::catch_unwind(AssertUnwindSafe(|| call(registration.listener.as_ref())));
            if let Err(payload) = result {
                let message = panic_message(payload.as_ref());
                error!(%message, "listener panicked during dispatch");
                if let Some(hook) = &self.hook {
                    hook(&message);
                }
            }
        }
    }
}

impl<L: ?Sized + Send + Sync> Default for ListenerRegistry<L> {
    fn default() -> Self {
        Self::new()
    }
}

impl<L: ?Sized> std::fmt::Debug for ListenerRegistry<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerRegistry")
            .field("len", &self.entries.lock().len())
            .finish()
    }
}

fn same<L: ?Sized>(a: &Arc<L>, b: &Arc<L>) -> bool {
    // Compare data pointers only; vtable pointers of the same type may differ.
    std::ptr::eq(Arc::as_ptr(a) as *const (), Arc::as_ptr(b) as *const ())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "listener panicked".to_string()
    }
}
