//! Death-notification primitive.
//!
//! The platform embedding supplies the real process-death signal (binder
//! death linking or similar); the engine only needs arm/disarm plus an
//! asynchronous callback. [`ManualDeathWatch`] is the in-process
//! implementation used by embedders without a platform signal and by the
//! test suite to simulate caller death.

use std::collections::HashMap;
use std::sync::Mutex;

use super::registry::RequestId;

/// Callback invoked when the watched process dies.
pub type DeathCallback = Box<dyn FnOnce() + Send>;

/// Transport-agnostic process-death watch.
pub trait DeathWatch: Send + Sync {
    /// Arms a watch for the given registration. The callback fires at most
    /// once, asynchronously, if the registering process dies.
    fn arm(&self, id: RequestId, on_died: DeathCallback);

    /// Disarms the watch; a no-op if nothing is armed for the id.
    fn disarm(&self, id: RequestId);
}

/// In-process death watch driven by explicit [`notify_death`] calls.
///
/// [`notify_death`]: ManualDeathWatch::notify_death
#[derive(Default)]
pub struct ManualDeathWatch {
    armed: Mutex<HashMap<RequestId, DeathCallback>>,
}

impl ManualDeathWatch {
    /// Creates a watch with nothing armed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the death of the process behind `id`.
    ///
    /// Fires the armed callback at most once; returns true if a callback
    /// fired.
    pub fn notify_death(&self, id: RequestId) -> bool {
        let callback = match self.armed.lock() {
            Ok(mut armed) => armed.remove(&id),
            Err(_) => None,
        };
        match callback {
            Some(on_died) => {
                on_died();
                true
            }
            None => false,
        }
    }

    /// Number of currently armed watches.
    #[must_use]
    pub fn armed_count(&self) -> usize {
        self.armed.lock().map(|armed| armed.len()).unwrap_or(0)
    }
}

impl DeathWatch for ManualDeathWatch {
    fn arm(&self, id: RequestId, on_died: DeathCallback) {
        if let Ok(mut armed) = self.armed.lock() {
            armed.insert(id, on_died);
        }
    }

    fn disarm(&self, id: RequestId) {
        if let Ok(mut armed) = self.armed.lock() {
            armed.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn notify_fires_armed_callback_once() {
        let watch = ManualDeathWatch::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let id = RequestId::from_raw(1);

        let counter = Arc::clone(&fired);
        watch.arm(id, Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(watch.armed_count(), 1);

        assert!(watch.notify_death(id));
        assert!(!watch.notify_death(id));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(watch.armed_count(), 0);
    }

    #[test]
    fn disarm_prevents_callback() {
        let watch = ManualDeathWatch::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let id = RequestId::from_raw(2);

        let counter = Arc::clone(&fired);
        watch.arm(id, Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));
        watch.disarm(id);

        assert!(!watch.notify_death(id));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
