use std::pin::pin;
use std::sync::Mutex;

use tokio::sync::Notify;

pub type ChildId = u64;

/// Process-wide budget for buffered child output.
///
/// Readers reserve space before appending to a child's store and sleep while
/// the total is over the cap. The single foreground child is exempt: its
/// bytes go straight to the terminal, so counting them would only stall the
/// one child the user is watching.
pub struct MemoryBudget {
    max_bytes: i64,
    inner: Mutex<Inner>,
    freed: Notify,
}

#[derive(Default)]
struct Inner {
    currently_stored: i64,
    foreground: Option<ChildId>,
}

impl MemoryBudget {
    pub fn new(max_bytes: u64) -> Self {
        Self {
            max_bytes: i64::try_from(max_bytes).unwrap_or(i64::MAX),
            inner: Mutex::new(Inner::default()),
            freed: Notify::new(),
        }
    }

    /// Accounts `delta` bytes of buffered output for `child`, waiting while
    /// the process-wide total is over the cap. Returns immediately for the
    /// foreground child. A waiter whose child is promoted mid-sleep backs
    /// its reservation out (the bytes will be written live, not stored) and
    /// proceeds.
    pub async fn reserve(&self, child: ChildId, delta: u64) {
        let delta = delta as i64;
        {
            let mut inner = self.lock();
            if inner.foreground == Some(child) {
                return;
            }
            inner.currently_stored += delta;
            if inner.currently_stored <= self.max_bytes {
                return;
            }
        }
        loop {
            let mut notified = pin!(self.freed.notified());
            {
                let mut inner = self.lock();
                if inner.foreground == Some(child) {
                    inner.currently_stored -= delta;
                    return;
                }
                if inner.currently_stored <= self.max_bytes {
                    return;
                }
                // Register before releasing the lock so a promotion between
                // the check and the await still wakes us.
                notified.as_mut().enable();
            }
            notified.await;
        }
    }

    /// Returns a reservation that never became buffered bytes (the child was
    /// promoted while the bytes were in flight).
    pub fn unreserve(&self, delta: u64) {
        self.lock().currently_stored -= delta as i64;
        self.freed.notify_waiters();
    }

    /// Marks `child` as the foreground child and credits back the `flushed`
    /// bytes its drained store was holding, then wakes every blocked reader.
    pub fn promote_to_foreground(&self, child: ChildId, flushed: u64) {
        {
            let mut inner = self.lock();
            inner.currently_stored -= flushed as i64;
            inner.foreground = Some(child);
        }
        self.freed.notify_waiters();
    }

    pub fn currently_stored(&self) -> i64 {
        self.lock().currently_stored
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory budget lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn reserve_within_budget_does_not_block() {
        let budget = MemoryBudget::new(1024);
        budget.reserve(1, 512).await;
        budget.reserve(2, 512).await;
        assert_eq!(budget.currently_stored(), 1024);
    }

    #[tokio::test]
    async fn foreground_child_bypasses_the_cap() {
        let budget = MemoryBudget::new(0);
        budget.promote_to_foreground(7, 0);
        // Would deadlock if the foreground child were accounted.
        budget.reserve(7, 10 * 1024 * 1024).await;
        assert_eq!(budget.currently_stored(), 0);
    }

    #[tokio::test]
    async fn over_budget_reader_wakes_on_promotion() {
        let budget = Arc::new(MemoryBudget::new(100));
        budget.reserve(1, 90).await;

        let blocked = {
            let budget = Arc::clone(&budget);
            tokio::spawn(async move { budget.reserve(2, 50).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        // Child 1 reaches the foreground; its 90 bytes are flushed.
        budget.promote_to_foreground(1, 90);
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("reader should wake after promotion")
            .expect("reader task failed");
        assert_eq!(budget.currently_stored(), 50);
    }

    #[tokio::test]
    async fn promoted_sleeper_backs_its_reservation_out() {
        let budget = Arc::new(MemoryBudget::new(100));
        budget.reserve(1, 200).await; // over budget, but nothing was waiting yet

        let blocked = {
            let budget = Arc::clone(&budget);
            tokio::spawn(async move { budget.reserve(2, 30).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!blocked.is_finished());

        // Child 2 itself is promoted; its pending bytes will be written
        // live, so the reservation must be returned.
        budget.promote_to_foreground(2, 0);
        tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .expect("reader should wake after promotion")
            .expect("reader task failed");
        assert_eq!(budget.currently_stored(), 200);
    }
}
