//! Concurrency admission gate for notary operations
//!
//! Lets the server drain in-flight operations before shutting down without
//! blocking new operations while running. An atomic signed job counter
//! counts in-flight tickets while non-negative; a negative sentinel means
//! shutdown is in progress. In-flight operations always run to completion;
//! shutdown only prevents new ones.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Sentinel the counter is flipped to when shutdown begins. Live tickets
/// keep decrementing past it; drain completes at `sentinel - jobs`.
const SHUTDOWN_SENTINEL: i64 = i64::MIN / 2;

/// Admission gate
pub struct Gatekeeper {
    /// Non-negative: in-flight ticket count. Negative: shutdown in progress.
    jobs: AtomicI64,

    /// Set once all pre-shutdown tickets have released
    drained: AtomicBool,

    /// One-shot completion gate for concurrent shutdown callers
    drained_notify: Notify,
}

impl Gatekeeper {
    /// Create a new open gate
    pub fn new() -> Self {
        Self {
            jobs: AtomicI64::new(0),
            drained: AtomicBool::new(false),
            drained_notify: Notify::new(),
        }
    }

    /// Acquire an admission ticket.
    ///
    /// If shutdown has already begun the returned ticket is invalid and the
    /// caller must decline to execute its operation.
    pub fn acquire(self: &Arc<Self>) -> Ticket {
        loop {
            let current = self.jobs.load(Ordering::Acquire);
            if current < 0 {
                return Ticket {
                    gate: self.clone(),
                    valid: false,
                };
            }

            if self
                .jobs
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ticket {
                    gate: self.clone(),
                    valid: true,
                };
            }
            // Lost the race against another acquire/release; retry
        }
    }

    /// Initiate shutdown and wait for all live tickets to release.
    ///
    /// Once this returns, no ticket acquired before the transition is still
    /// outstanding and no new valid ticket is ever granted. Concurrent and
    /// repeated calls wait on the same completion gate.
    pub async fn shutdown(&self) {
        loop {
            let current = self.jobs.load(Ordering::Acquire);

            if current < 0 {
                // Another caller performed the transition; wait it out
                break;
            }

            if self
                .jobs
                .compare_exchange(
                    current,
                    SHUTDOWN_SENTINEL,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                let target = SHUTDOWN_SENTINEL - current;

                tracing::info!(in_flight = current, "Gatekeeper shutdown initiated");

                while self.jobs.load(Ordering::Acquire) != target {
                    tokio::task::yield_now().await;
                }

                self.drained.store(true, Ordering::Release);
                self.drained_notify.notify_waiters();

                tracing::info!("Gatekeeper drained");
                return;
            }
        }

        while !self.drained.load(Ordering::Acquire) {
            let notified = self.drained_notify.notified();
            if self.drained.load(Ordering::Acquire) {
                break;
            }
            notified.await;
        }
    }

    /// True once shutdown has begun (drained or not)
    pub fn is_shutting_down(&self) -> bool {
        self.jobs.load(Ordering::Acquire) < 0
    }
}

impl Default for Gatekeeper {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped admission token.
///
/// Valid only if acquired while the counter was non-negative; decrements
/// the counter on drop unless invalid.
pub struct Ticket {
    gate: Arc<Gatekeeper>,
    valid: bool,
}

impl Ticket {
    /// True if this ticket admits its holder
    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

impl Drop for Ticket {
    fn drop(&mut self) {
        if self.valid {
            self.gate.jobs.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_acquire_release_counts() {
        let gate = Arc::new(Gatekeeper::new());

        let t1 = gate.acquire();
        let t2 = gate.acquire();
        assert!(t1.is_valid() && t2.is_valid());
        assert_eq!(gate.jobs.load(Ordering::Acquire), 2);

        drop(t1);
        assert_eq!(gate.jobs.load(Ordering::Acquire), 1);
        drop(t2);
        assert_eq!(gate.jobs.load(Ordering::Acquire), 0);
    }

    #[tokio::test]
    async fn test_shutdown_with_no_tickets() {
        let gate = Arc::new(Gatekeeper::new());
        gate.shutdown().await;
        assert!(gate.is_shutting_down());
    }

    #[tokio::test]
    async fn test_acquire_after_shutdown_invalid() {
        let gate = Arc::new(Gatekeeper::new());
        gate.shutdown().await;

        let ticket = gate.acquire();
        assert!(!ticket.is_valid());

        // Invalid ticket must not decrement on release
        let before = gate.jobs.load(Ordering::Acquire);
        drop(ticket);
        assert_eq!(gate.jobs.load(Ordering::Acquire), before);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_shutdown_waits_for_live_tickets() {
        let gate = Arc::new(Gatekeeper::new());

        let tickets: Vec<_> = (0..3).map(|_| gate.acquire()).collect();
        assert!(tickets.iter().all(Ticket::is_valid));

        let shutdown_gate = gate.clone();
        let shutdown = tokio::spawn(async move {
            shutdown_gate.shutdown().await;
        });

        // Shutdown must not complete while tickets are outstanding
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!shutdown.is_finished());
        assert!(gate.is_shutting_down());

        drop(tickets);
        tokio::time::timeout(Duration::from_secs(5), shutdown)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_shutdown_calls_share_gate() {
        let gate = Arc::new(Gatekeeper::new());
        let ticket = gate.acquire();

        let first = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.shutdown().await })
        };
        let second = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.shutdown().await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!first.is_finished());
        assert!(!second.is_finished());

        drop(ticket);
        tokio::time::timeout(Duration::from_secs(5), async {
            first.await.unwrap();
            second.await.unwrap();
        })
        .await
        .unwrap();
    }
}
