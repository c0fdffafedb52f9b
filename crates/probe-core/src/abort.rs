//! Cooperative stop flag.
//!
//! Cancellation in this stack is advisory: long-running operations check the
//! flag between discrete steps (poll iterations, tree-walk boundaries) and
//! bail out with [`StationError::Stopped`]. Nothing is pre-empted mid-call;
//! the underlying instrument protocols have no mid-command abort.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{StationError, StationResult};

/// Cloneable stop flag shared between a requester and a worker.
#[derive(Debug, Clone, Default)]
pub struct AbortFlag {
    inner: Arc<AtomicBool>,
}

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request the current operation to stop at its next checkpoint.
    pub fn set(&self) {
        self.inner.store(true, Ordering::SeqCst);
    }

    /// Clear the flag before starting a new operation.
    pub fn clear(&self) {
        self.inner.store(false, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.inner.load(Ordering::SeqCst)
    }

    /// Checkpoint: error out with [`StationError::Stopped`] when set.
    pub fn check(&self) -> StationResult<()> {
        if self.is_set() {
            Err(StationError::Stopped)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checkpoint_errors_only_when_set() {
        let flag = AbortFlag::new();
        assert!(flag.check().is_ok());
        flag.set();
        assert!(matches!(flag.check(), Err(StationError::Stopped)));
        flag.clear();
        assert!(flag.check().is_ok());
    }

    #[test]
    fn clones_share_state() {
        let flag = AbortFlag::new();
        let other = flag.clone();
        other.set();
        assert!(flag.is_set());
    }
}
