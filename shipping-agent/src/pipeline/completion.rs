//! Single-fire completion shared by the two workers of a shipment.

use std::sync::{Mutex, PoisonError};

type Callback = Box<dyn FnOnce(bool) + Send>;

struct State {
    first_seen: bool,
    callback: Option<Callback>,
}

/// Fires its callback exactly once.
///
/// A failure fires immediately. A success only counts as the first half: the
/// callback fires on the second report, with that report's value.
pub struct Completion {
    state: Mutex<State>,
}

impl Completion {
    pub fn new(callback: impl FnOnce(bool) + Send + 'static) -> Self {
        Self {
            state: Mutex::new(State {
                first_seen: false,
                callback: Some(Box::new(callback)),
            }),
        }
    }

    /// Record one worker's result. Returns the value the callback fired with,
    /// if this call fired it.
    pub fn report(&self, success: bool) -> Option<bool> {
        let callback = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let fire = !success || state.first_seen;
            state.first_seen = true;
            if fire {
                state.callback.take()
            } else {
                None
            }
        };
        // Run outside the lock, the callback may report again.
        callback.map(|cb| {
            cb(success);
            success
        })
    }

    pub fn is_fired(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .callback
            .is_none()
    }
}
