//! Shared termination flag for one connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

/// Write-once-effective flag observed by the send loop, the receive loop
/// and the worker thread.
///
/// Clones share state. Setting it again is a no-op.
#[derive(Debug, Clone, Default)]
pub struct TerminationFlag {
    claimed: Arc<AtomicBool>,
    token: CancellationToken,
}

impl TerminationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the flag. Returns `true` only for the call that actually set it.
    pub fn set(&self) -> bool {
        if self.claimed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.token.cancel();
        true
    }

    pub fn is_set(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the flag is set.
    pub async fn terminated(&self) {
        self.token.cancelled().await;
    }

    /// Guard that sets the flag when dropped, including during unwinding.
    pub fn guard(&self) -> TerminateOnDrop {
        TerminateOnDrop { flag: self.clone() }
    }
}

/// Sets the termination flag on drop.
pub struct TerminateOnDrop {
    flag: TerminationFlag,
}

impl Drop for TerminateOnDrop {
    fn drop(&mut self) {
        self.flag.set();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn set_is_idempotent() {
        let flag = TerminationFlag::new();
        assert!(!flag.is_set());
        assert!(flag.set());
        assert!(!flag.set());
        assert!(!flag.set());
        assert!(flag.is_set());
    }

    #[test]
    fn clones_share_state() {
        let flag = TerminationFlag::new();
        let other = flag.clone();
        other.set();
        assert!(flag.is_set());
    }

    #[test]
    fn guard_sets_on_drop() {
        let flag = TerminationFlag::new();
        {
            let _guard = flag.guard();
            assert!(!flag.is_set());
        }
        assert!(flag.is_set());
    }

    #[test]
    fn guard_sets_during_panic() {
        let flag = TerminationFlag::new();
        let inner = flag.clone();
        let result = std::thread::spawn(move || {
            let _guard = inner.guard();
            panic!("worker blew up");
        })
        .join();
        assert!(result.is_err());
        assert!(flag.is_set());
    }

    #[tokio::test]
    async fn terminated_wakes_waiters() {
        let flag = TerminationFlag::new();
        let setter = flag.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            setter.set();
        });
        tokio::time::timeout(Duration::from_secs(1), flag.terminated())
            .await
            .unwrap();
    }
}
