//! LIFO rollback stack for multi-step operations.
//!
//! Failure paths in Start funnel through a `Reverter`: each successfully
//! completed step pushes an undo hook, and unless `commit()` is called the
//! hooks run in reverse order when the reverter is dropped.

use tracing::debug;

/// A stack of undo hooks executed in LIFO order on drop unless committed.
pub struct Reverter {
    hooks: Vec<Box<dyn FnOnce() + Send>>,
    committed: bool,
}

impl Reverter {
    pub fn new() -> Self {
        Self {
            hooks: Vec::new(),
            committed: false,
        }
    }

    /// Push an undo hook for a step that just succeeded.
    pub fn add<F>(&mut self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.hooks.push(Box::new(hook));
    }

    /// Mark the operation successful. No hooks will run.
    pub fn commit(mut self) {
        self.committed = true;
        self.hooks.clear();
    }

    /// Number of pending undo hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl Default for Reverter {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Reverter {
    fn drop(&mut self) {
        if self.committed {
            return;
        }

        if !self.hooks.is_empty() {
            debug!(hooks = self.hooks.len(), "rolling back partial operation");
        }

        while let Some(hook) = self.hooks.pop() {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::sync::Mutex;

    #[test]
    fn test_runs_in_reverse_order() {
        let order = Arc::new(Mutex::new(Vec::new()));

        {
            let mut revert = Reverter::new();
            for i in 0..3 {
                let order = order.clone();
                revert.add(move || order.lock().unwrap().push(i));
            }
        }

        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn test_commit_skips_hooks() {
        let count = Arc::new(AtomicUsize::new(0));

        let mut revert = Reverter::new();
        let c = count.clone();
        revert.add(move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        revert.commit();

        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_hooks_run_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));

        {
            let mut revert = Reverter::new();
            let c = count.clone();
            revert.add(move || {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
