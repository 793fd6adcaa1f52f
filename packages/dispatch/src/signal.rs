//! Scoped termination-signal handling.
//!
//! Jobs that must bound their own runtime install a handler for the duration
//! of a scope: while a [`TermSignalScope`] is alive, SIGTERM invokes its
//! handler; dropping the scope restores whatever was in effect before, on
//! every exit path. Scopes nest; the innermost live handler wins.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, Once};

use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, warn};

type Handler = Box<dyn Fn() + Send + Sync>;

static HANDLERS: Mutex<Vec<(u64, Handler)>> = Mutex::new(Vec::new());
static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static LISTENER: Once = Once::new();

/// Invoke the innermost installed handler, if any.
fn dispatch_signal() {
    let handlers = HANDLERS.lock().unwrap_or_else(|e| e.into_inner());
    if let Some((_, handler)) = handlers.last() {
        handler();
    } else {
        debug!("termination signal received with no scoped handler");
    }
}

fn ensure_listener() {
    LISTENER.call_once(|| {
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                tokio::spawn(async move {
                    while stream.recv().await.is_some() {
                        dispatch_signal();
                    }
                });
            }
            Err(e) => warn!(error = %e, "failed to install termination-signal listener"),
        }
    });
}

/// RAII scope redirecting the termination signal to a handler.
///
/// Must be created from within a tokio runtime (the listener is a background
/// task).
pub struct TermSignalScope {
    id: u64,
}

impl TermSignalScope {
    pub fn install<F>(handler: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        ensure_listener();
        let id = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        HANDLERS
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Box::new(handler)));
        Self { id }
    }
}

impl Drop for TermSignalScope {
    fn drop(&mut self) {
        let mut handlers = HANDLERS.lock().unwrap_or_else(|e| e.into_inner());
        handlers.retain(|(id, _)| *id != self.id);
    }
}
