//! Deferred cleanup bookkeeping.
//!
//! Temp directories created during conversion (Dockerfile materialization,
//! docker-load staging) outlive the converter and are torn down by the
//! caller once the build has finished.

use std::sync::Mutex;
use tracing::warn;

type CleanupFn = Box<dyn FnOnce() -> std::io::Result<()> + Send>;

/// Append-only, thread-safe queue of cleanup callbacks.
#[derive(Default)]
pub struct CleanupCollection {
    callbacks: Mutex<Vec<CleanupFn>>,
}

impl CleanupCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a callback to run at close.
    pub fn add(&self, f: impl FnOnce() -> std::io::Result<()> + Send + 'static) {
        self.callbacks.lock().expect("cleanup mutex poisoned").push(Box::new(f));
    }

    /// Runs all registered callbacks, newest first. Failures are logged
    /// and do not stop the remaining callbacks.
    pub fn close(&self) {
        let mut callbacks = self.callbacks.lock().expect("cleanup mutex poisoned");
        while let Some(f) = callbacks.pop() {
            if let Err(err) = f() {
                warn!(error = %err, "cleanup callback failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_close_runs_all_callbacks() {
        let collection = CleanupCollection::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            collection.add(move || {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }
        collection.close();
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_failure_does_not_stop_others() {
        let collection = CleanupCollection::new();
        let count = Arc::new(AtomicUsize::new(0));
        collection.add({
            let count = count.clone();
            move || {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        collection.add(|| Err(std::io::Error::other("boom")));
        collection.close();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
