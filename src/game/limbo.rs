//! Exclusive control over a game connection.
//!
//! Multi-step operations that move the bot around must not interleave with
//! each other nor with the idle routine that parks the bot in limbo after
//! every world join. All of them go through one FIFO gate: callers queue
//! with [`LimboHandler::acquire`] and hold a [`LimboLock`] until they release
//! it. A lock that outlives its hold timeout is considered abandoned and the
//! gate passes to the next waiter.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::common::error::LimboError;
use crate::common::{bounded, Bounded};

/// Action run on world join when nobody holds the gate.
pub type IdleAction = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

type PermitSlot = Arc<Mutex<Option<OwnedSemaphorePermit>>>;

pub struct LimboHandler {
    instance: String,
    gate: Arc<Semaphore>,
    acquire_timeout: Duration,
    hold_timeout: Duration,
    idle_action: IdleAction,
}

impl LimboHandler {
    pub fn new(
        instance: impl Into<String>,
        acquire_timeout: Duration,
        hold_timeout: Duration,
        idle_action: IdleAction,
    ) -> Self {
        Self {
            instance: instance.into(),
            // tokio's semaphore queues waiters fairly, which gives FIFO grants.
            gate: Arc::new(Semaphore::new(1)),
            acquire_timeout,
            hold_timeout,
            idle_action,
        }
    }

    /// Queue for the gate with the configured timeouts.
    pub async fn acquire(&self) -> Result<LimboLock, LimboError> {
        self.acquire_with(self.acquire_timeout, self.hold_timeout)
            .await
    }

    pub async fn acquire_with(
        &self,
        acquire_timeout: Duration,
        hold_timeout: Duration,
    ) -> Result<LimboLock, LimboError> {
        let permit = match bounded(acquire_timeout, Arc::clone(&self.gate).acquire_owned()).await
        {
            Bounded::Completed(Ok(permit)) => permit,
            Bounded::Completed(Err(_)) => return Err(LimboError::Closed),
            Bounded::TimedOut => {
                warn!(instance = %self.instance, "Limbo acquire timed out");
                return Err(LimboError::AcquireTimedOut {
                    waited_ms: acquire_timeout.as_millis(),
                });
            }
        };

        debug!(instance = %self.instance, "Limbo lock granted");

        let slot: PermitSlot = Arc::new(Mutex::new(Some(permit)));
        let watchdog = {
            let slot = Arc::clone(&slot);
            let instance = self.instance.clone();
            tokio::spawn(async move {
                tokio::time::sleep(hold_timeout).await;
                let abandoned = slot
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                if abandoned.is_some() {
                    warn!(
                        instance = %instance,
                        "Limbo lock not released within {:?}, passing the gate on",
                        hold_timeout
                    );
                }
            })
        };

        Ok(LimboLock { slot, watchdog })
    }

    /// Run the idle action unless someone holds or waits for the gate.
    ///
    /// Returns whether the idle action was started.
    pub fn on_world_join(&self) -> bool {
        let permit = match Arc::clone(&self.gate).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                debug!(instance = %self.instance, "Limbo gate busy, skipping idle action");
                return false;
            }
        };

        let action = Arc::clone(&self.idle_action);
        let hold_timeout = self.hold_timeout;
        let instance = self.instance.clone();
        tokio::spawn(async move {
            if bounded(hold_timeout, action()).await.is_timed_out() {
                warn!(instance = %instance, "Idle action did not finish in time");
            }
            drop(permit);
        });
        true
    }

    /// Fail all pending and future acquires.
    pub fn close(&self) {
        self.gate.close();
    }
}

/// Exclusive ticket on a connection. Released on drop.
pub struct LimboLock {
    slot: PermitSlot,
    watchdog: JoinHandle<()>,
}

impl LimboLock {
    /// Whether this lock still owns the gate.
    pub fn is_held(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Give the gate back. A no-op once the hold timeout already did.
    pub fn release(self) {}
}

impl Drop for LimboLock {
    fn drop(&mut self) {
        self.watchdog.abort();
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::FutureExt;
    use tokio::time::Instant;

    use super::*;

    fn handler(counter: Arc<AtomicUsize>) -> LimboHandler {
        let idle: IdleAction = Arc::new(move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            .boxed()
        });
        LimboHandler::new(
            "miner1",
            Duration::from_secs(30),
            Duration::from_secs(60),
            idle,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_grants_in_call_order() {
        let limbo = Arc::new(handler(Arc::default()));
        let order = Arc::new(Mutex::new(Vec::new()));
        let started = Instant::now();

        let mut tasks = Vec::new();
        for id in 0..3 {
            let limbo = Arc::clone(&limbo);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let lock = limbo.acquire().await.unwrap();
                order.lock().unwrap().push((id, started.elapsed()));
                tokio::time::sleep(Duration::from_secs(1)).await;
                lock.release();
            }));
            tokio::task::yield_now().await;
        }
        for task in tasks {
            task.await.unwrap();
        }

        let order = order.lock().unwrap();
        assert_eq!(
            order.iter().map(|(id, _)| *id).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert!(order[1].1 >= Duration::from_secs(1));
        assert!(order[2].1 >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_acquire_waits_for_holder() {
        let limbo = handler(Arc::default());
        let first = limbo.acquire().await.unwrap();

        let second = limbo
            .acquire_with(Duration::from_secs(5), Duration::from_secs(60))
            .await;
        assert!(matches!(
            second,
            Err(LimboError::AcquireTimedOut { waited_ms: 5000 })
        ));
        assert!(first.is_held());

        first.release();
        tokio_test::assert_ok!(limbo.acquire().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hold_timeout_passes_gate_on() {
        let limbo = handler(Arc::default());
        let started = Instant::now();
        let abandoned = limbo
            .acquire_with(Duration::from_secs(1), Duration::from_secs(2))
            .await
            .unwrap();

        let next = limbo.acquire().await.unwrap();
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        assert!(!abandoned.is_held());

        // Late release of the abandoned ticket must not free the new holder's gate.
        abandoned.release();
        assert!(next.is_held());
        assert!(!limbo.on_world_join());
    }

    #[tokio::test(start_paused = true)]
    async fn test_world_join_runs_idle_action_only_when_free() {
        let runs = Arc::new(AtomicUsize::new(0));
        let limbo = handler(Arc::clone(&runs));

        assert!(limbo.on_world_join());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let lock = limbo.acquire().await.unwrap();
        assert!(!limbo.on_world_join());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        drop(lock);

        assert!(limbo.on_world_join());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_fails_waiters() {
        let limbo = handler(Arc::default());
        limbo.close();
        assert!(matches!(limbo.acquire().await, Err(LimboError::Closed)));
    }
}
