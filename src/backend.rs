//! Coordination store availability.
//!
//! Every store in this crate sits behind a trait so a networked backend can be
//! swapped in. The in-memory implementations carry an [`Availability`] switch
//! that lets callers simulate the store becoming unreachable.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

/// The backing store could not be reached.
///
/// Distinct from contention or business-rule failures: callers should retry
/// with backoff rather than reject.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{store} backend unavailable")]
pub struct BackendError {
    pub store: &'static str,
}

/// Shared on/off switch for a simulated backend.
#[derive(Debug, Clone)]
pub struct Availability {
    store: &'static str,
    up: Arc<AtomicBool>,
}

impl Availability {
    pub fn new(store: &'static str) -> Self {
        Self {
            store,
            up: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn set_available(&self, available: bool) {
        self.up.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.up.load(Ordering::SeqCst)
    }

    /// `Err` while the backend is marked down.
    pub fn check(&self) -> Result<(), BackendError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(BackendError { store: self.store })
        }
    }
}
