use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

/// Lowest configurable per-user parallelism.
pub const MIN_PARALLELISM: usize = 1;

/// Highest configurable per-user parallelism.
pub const MAX_PARALLELISM: usize = 5;

struct UserEntry {
    sem: Arc<Semaphore>,
    width: usize,
    active: Arc<AtomicUsize>,
}

/// Per-user admission control bounding simultaneous transfers.
///
/// One entry per user, created lazily on first acquire and retained for the
/// process lifetime. The permit releases its slot on drop, so release is
/// guaranteed on every exit path of a transfer, including errors and
/// panics. Admission order under contention is whatever the underlying
/// semaphore provides; no FIFO guarantee is made.
pub struct ConcurrencyGate {
    users: Mutex<HashMap<i64, UserEntry>>,
}

impl Default for ConcurrencyGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ConcurrencyGate {
    /// Creates an empty gate. Users get a width of 1 until configured.
    pub fn new() -> Self {
        Self {
            users: Mutex::new(HashMap::new()),
        }
    }

    /// Waits for a free slot for `user_id` and returns the permit holding it.
    ///
    /// Suspends the calling task only; other sessions keep running.
    pub async fn acquire(&self, user_id: i64) -> TransferPermit {
        let (sem, active) = {
            let mut users = self.users.lock().unwrap();
            let entry = users.entry(user_id).or_insert_with(|| UserEntry {
                sem: Arc::new(Semaphore::new(MIN_PARALLELISM)),
                width: MIN_PARALLELISM,
                active: Arc::new(AtomicUsize::new(0)),
            });
            (Arc::clone(&entry.sem), Arc::clone(&entry.active))
        };

        // The semaphore is never closed, so acquisition cannot fail.
        let permit = sem
            .acquire_owned()
            .await
            .expect("gate semaphore is never closed");
        active.fetch_add(1, Ordering::SeqCst);
        TransferPermit {
            _permit: permit,
            active,
        }
    }

    /// Sets the user's parallelism, clamped to `[1, 5]`, and returns the
    /// applied value.
    ///
    /// Takes effect for admissions after the call; permits already held
    /// keep their original slot until dropped.
    pub fn set_parallelism(&self, user_id: i64, width: usize) -> usize {
        let width = width.clamp(MIN_PARALLELISM, MAX_PARALLELISM);
        let mut users = self.users.lock().unwrap();
        match users.get_mut(&user_id) {
            Some(entry) if entry.width == width => {}
            Some(entry) => {
                debug!(user_id, from = entry.width, to = width, "gate width changed");
                entry.sem = Arc::new(Semaphore::new(width));
                entry.width = width;
            }
            None => {
                users.insert(
                    user_id,
                    UserEntry {
                        sem: Arc::new(Semaphore::new(width)),
                        width,
                        active: Arc::new(AtomicUsize::new(0)),
                    },
                );
            }
        }
        width
    }

    /// The user's configured parallelism.
    pub fn parallelism(&self, user_id: i64) -> usize {
        let users = self.users.lock().unwrap();
        users.get(&user_id).map_or(MIN_PARALLELISM, |e| e.width)
    }

    /// Number of permits currently held by `user_id`.
    pub fn active(&self, user_id: i64) -> usize {
        let users = self.users.lock().unwrap();
        users
            .get(&user_id)
            .map_or(0, |e| e.active.load(Ordering::SeqCst))
    }
}

/// A held admission slot. Dropping it frees the slot.
pub struct TransferPermit {
    _permit: OwnedSemaphorePermit,
    active: Arc<AtomicUsize>,
}

impl Drop for TransferPermit {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn acquire_and_release_tracks_active() {
        let gate = ConcurrencyGate::new();
        assert_eq!(gate.active(1), 0);

        let permit = gate.acquire(1).await;
        assert_eq!(gate.active(1), 1);

        drop(permit);
        assert_eq!(gate.active(1), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn second_acquire_blocks_at_default_width() {
        let gate = ConcurrencyGate::new();
        let _held = gate.acquire(7).await;

        let blocked = timeout(Duration::from_secs(1), gate.acquire(7)).await;
        assert!(blocked.is_err(), "width 1 must block the second acquire");
    }

    #[tokio::test]
    async fn release_unblocks_waiter() {
        let gate = Arc::new(ConcurrencyGate::new());
        let permit = gate.acquire(7).await;

        let g = Arc::clone(&gate);
        let waiter = tokio::spawn(async move {
            let _p = g.acquire(7).await;
        });

        drop(permit);
        waiter.await.unwrap();
        assert_eq!(gate.active(7), 0);
    }

    #[tokio::test]
    async fn wider_gate_admits_concurrently() {
        let gate = ConcurrencyGate::new();
        assert_eq!(gate.set_parallelism(3, 3), 3);

        let _p1 = gate.acquire(3).await;
        let _p2 = gate.acquire(3).await;
        let _p3 = gate.acquire(3).await;
        assert_eq!(gate.active(3), 3);
    }

    #[tokio::test]
    async fn users_do_not_contend_with_each_other() {
        let gate = ConcurrencyGate::new();
        let _a = gate.acquire(1).await;
        let _b = gate.acquire(2).await;
        assert_eq!(gate.active(1), 1);
        assert_eq!(gate.active(2), 1);
    }

    #[test]
    fn parallelism_is_clamped() {
        let gate = ConcurrencyGate::new();
        assert_eq!(gate.set_parallelism(1, 0), 1);
        assert_eq!(gate.set_parallelism(1, 99), 5);
        assert_eq!(gate.parallelism(1), 5);
        assert_eq!(gate.parallelism(42), 1); // unconfigured default
    }

    #[tokio::test]
    async fn permit_survives_task_abort() {
        let gate = Arc::new(ConcurrencyGate::new());
        let g = Arc::clone(&gate);
        let task = tokio::spawn(async move {
            let _p = g.acquire(9).await;
            // Hold the permit until aborted.
            std::future::pending::<()>().await;
        });

        // Let the task acquire.
        tokio::task::yield_now().await;
        while gate.active(9) == 0 {
            tokio::task::yield_now().await;
        }

        task.abort();
        let _ = task.await;
        assert_eq!(gate.active(9), 0, "abort must still release the permit");
    }
}
