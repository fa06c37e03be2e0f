//! Commit interlock between ledger writes and checkpoints
//!
//! Every ledger write holds a shared guard for its whole duration, and a
//! checkpoint takes the exclusive side, so a checkpoint never captures a
//! half-applied transition. Shared guards nest: a caller already holding
//! one (the resolution driver's critical section) may enter again.
//! A thread holding a shared guard must not start a checkpoint.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

#[derive(Debug, Default)]
pub struct CommitInterlock {
    lock: RwLock<()>,
}

/// Held while a ledger write is in progress
#[must_use = "the interlock is released when the guard is dropped"]
pub struct CommitGuard<'a> {
    _guard: RwLockReadGuard<'a, ()>,
}

/// Held while a checkpoint runs; no ledger write can be in progress
#[must_use = "the interlock is released when the guard is dropped"]
pub struct CheckpointGuard<'a> {
    _guard: RwLockWriteGuard<'a, ()>,
}

impl CommitInterlock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the calling thread as not interruptible by a checkpoint
    pub fn enter(&self) -> CommitGuard<'_> {
        CommitGuard {
            _guard: self.lock.read_recursive(),
        }
    }

    /// Wait for in-flight writes and keep new ones out
    pub fn block_commits(&self) -> CheckpointGuard<'_> {
        CheckpointGuard {
            _guard: self.lock.write(),
        }
    }

    /// Non-blocking variant of [`block_commits`](Self::block_commits)
    pub fn try_block_commits(&self) -> Option<CheckpointGuard<'_>> {
        self.lock
            .try_write()
            .map(|guard| CheckpointGuard { _guard: guard })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_excluded_while_writing() {
        let interlock = CommitInterlock::new();
        {
            let _outer = interlock.enter();
            let _inner = interlock.enter();
            assert!(interlock.try_block_commits().is_none());
        }
        assert!(interlock.try_block_commits().is_some());
    }
}
