//! External cancellation for pending receives.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;

/// Handle returned by [`CancellationManager::register_callback`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct CancellationToken(u64);

type Callback = Box<dyn FnOnce() + Send>;

struct State {
    cancelled: bool,
    next_token: u64,
    callbacks: HashMap<u64, Callback>,
}

/// A set of callbacks fired once when cancellation starts.
///
/// Callbacks run on the thread that calls [`start_cancel`](Self::start_cancel),
/// after the manager's lock is released, so they may call back into the
/// manager.
pub struct CancellationManager {
    state: Mutex<State>,
}

impl CancellationManager {
    /// A manager with no callbacks that has not been cancelled.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                cancelled: false,
                next_token: 0,
                callbacks: HashMap::new(),
            }),
        }
    }

    /// Register `callback` to run on cancellation.
    ///
    /// Returns `None` without registering if cancellation already started.
    pub fn register_callback(
        &self,
        callback: impl FnOnce() + Send + 'static,
    ) -> Option<CancellationToken> {
        let mut state = self.state.lock();
        if state.cancelled {
            return None;
        }
        let token = state.next_token;
        state.next_token += 1;
        state.callbacks.insert(token, Box::new(callback));
        Some(CancellationToken(token))
    }

    /// Remove a callback. Returns `false` if it already ran or was removed.
    pub fn deregister_callback(&self, token: CancellationToken) -> bool {
        self.state.lock().callbacks.remove(&token.0).is_some()
    }

    /// Mark cancelled and run every registered callback. Idempotent.
    pub fn start_cancel(&self) {
        let callbacks = {
            let mut state = self.state.lock();
            if state.cancelled {
                return;
            }
            state.cancelled = true;
            std::mem::take(&mut state.callbacks)
        };
        tracing::debug!(count = callbacks.len(), "running cancellation callbacks");
        for (_, callback) in callbacks {
            callback();
        }
    }

    /// Whether [`start_cancel`](Self::start_cancel) has been called.
    pub fn is_cancelled(&self) -> bool {
        self.state.lock().cancelled
    }
}

impl Default for CancellationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancellationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CancellationManager")
            .field("cancelled", &state.cancelled)
            .field("callbacks", &state.callbacks.len())
            .finish()
    }
}
