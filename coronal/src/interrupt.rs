//! Cooperative cancellation.

use crate::error::{Error, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable handle to a cooperative user-interrupt flag.
///
/// A higher layer (typically a signal handler) raises the flag; long-running
/// loads and evaluations sample it at file and component boundaries and
/// unwind with [`Error::Cancelled`] when it is set. Partial results are
/// discarded by the observing operation, so the database and store stay
/// consistent.
#[derive(Clone, Debug, Default)]
pub struct Interrupt(Arc<AtomicBool>);

impl Interrupt {
    /// New, un-raised flag.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag. Safe to call from a signal handler thread.
    pub fn raise(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Lower the flag again.
    pub fn clear(&self) {
        self.0.store(false, Ordering::Relaxed);
    }

    /// Whether the flag is currently raised.
    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Sample the flag, converting a raised flag into [`Error::Cancelled`].
    pub(crate) fn check(&self) -> Result<()> {
        if self.is_raised() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn raise_and_clear() {
        let flag = Interrupt::new();
        assert!(!flag.is_raised());
        assert!(flag.check().is_ok());

        let observer = flag.clone();
        flag.raise();
        assert!(observer.is_raised());
        assert!(matches!(observer.check(), Err(Error::Cancelled)));

        flag.clear();
        assert!(observer.check().is_ok());
    }
}
