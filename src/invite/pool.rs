// Bounded pool of concurrently running invite tasks.
//
// The pool has a fixed capacity; the dispatcher checks `has_capacity()` before
// dequeuing, and `spawn` refuses work once the pool is full.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

use crate::metrics;

/// Tracks how many invite tasks are running and caps them.
#[derive(Debug, Clone)]
pub struct InvitePool {
    capacity: usize,
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

/// Decrements the active count when the task ends, including by panic or abort.
struct ActiveSlot {
    active: Arc<AtomicUsize>,
    idle: Arc<Notify>,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        let now = self.active.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::INVITE_WORKERS_ACTIVE.set(now as i64);
        if now == 0 {
            self.idle.notify_waiters();
        }
    }
}

impl InvitePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            active: Arc::new(AtomicUsize::new(0)),
            idle: Arc::new(Notify::new()),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Whether the pool can take another task.
    pub fn has_capacity(&self) -> bool {
        self.active.load(Ordering::SeqCst) < self.capacity
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Resolve once no task is running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.active_count() == 0 {
                return;
            }
            notified.await;
        }
    }

    /// Run `task` on the tokio runtime. Returns false if the pool is at capacity.
    pub fn spawn<F>(&self, task: F) -> bool
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let cap = self.capacity;
        let reserved = self
            .active
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < cap).then_some(n + 1)
            });
        let Ok(previous) = reserved else {
            return false;
        };
        metrics::INVITE_WORKERS_ACTIVE.set(previous as i64 + 1);

        let slot = ActiveSlot {
            active: self.active.clone(),
            idle: self.idle.clone(),
        };
        tokio::spawn(async move {
            let _slot = slot;
            task.await;
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::oneshot;

    #[test]
    fn test_pool_capacity() {
        let pool = InvitePool::new(4);
        assert!(pool.has_capacity());
        assert_eq!(pool.active_count(), 0);
        assert_eq!(pool.capacity(), 4);
    }

    #[test]
    fn test_pool_zero_capacity() {
        let pool = InvitePool::new(0);
        assert!(!pool.has_capacity());
    }

    #[tokio::test]
    async fn test_pool_refuses_when_full_and_frees_on_completion() {
        let pool = InvitePool::new(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let (done_tx, done_rx) = oneshot::channel::<()>();

        assert!(pool.spawn(async move {
            let _ = release_rx.await;
            let _ = done_tx.send(());
        }));
        assert_eq!(pool.active_count(), 1);
        assert!(!pool.spawn(async {}));

        release_tx.send(()).unwrap();
        done_rx.await.unwrap();
        while pool.active_count() > 0 {
            tokio::task::yield_now().await;
        }
        assert!(pool.has_capacity());
    }

    #[tokio::test]
    async fn test_wait_idle_returns_after_last_task() {
        let pool = InvitePool::new(2);
        pool.wait_idle().await;

        let (release_tx, release_rx) = oneshot::channel::<()>();
        assert!(pool.spawn(async move {
            let _ = release_rx.await;
        }));
        assert!(pool.spawn(async {}));

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.wait_idle().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        release_tx.send(()).unwrap();
        waiter.await.unwrap();
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test]
    async fn test_panicking_task_releases_slot() {
        let pool = InvitePool::new(1);
        assert!(pool.spawn(async { panic!("invite task blew up") }));
        while pool.active_count() > 0 {
            tokio::task::yield_now().await;
        }
        assert!(pool.has_capacity());
    }
}
