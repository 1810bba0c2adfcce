//! Renewable distributed leases.
//!
//! A [`LeaseManager`] owns a background task that takes a named lock and
//! keeps renewing it. Status changes are published on a watch channel; a
//! failed renewal is terminal and carries the error that ended it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Result, SyncError};

const COOKIE_LEN: usize = 16;

/// Storage for timed exclusive locks.
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// Takes or renews `name` for `cookie`. Fails with [`SyncError::Busy`] if another cookie holds it.
    async fn lock(&self, name: &str, cookie: &str, ttl: Duration) -> Result<()>;

    /// Releases `name` if `cookie` still holds it.
    async fn unlock(&self, name: &str, cookie: &str) -> Result<()>;
}

/// In-process [`LeaseBackend`] with expiry driven by tokio time.
#[derive(Default)]
pub struct MemoryLeaseBackend {
    locks: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryLeaseBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `name`, ignoring expired locks.
    pub fn holder(&self, name: &str) -> Option<String> {
        let locks = self.locks.lock().ok()?;
        locks
            .get(name)
            .filter(|(_, expiry)| *expiry > Instant::now())
            .map(|(cookie, _)| cookie.clone())
    }
}

#[async_trait]
impl LeaseBackend for MemoryLeaseBackend {
    async fn lock(&self, name: &str, cookie: &str, ttl: Duration) -> Result<()> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| SyncError::storage(e.to_string()))?;
        let now = Instant::now();
        if let Some((holder, expiry)) = locks.get(name) {
            if holder != cookie && *expiry > now {
                return Err(SyncError::Busy {
                    name: name.to_string(),
                });
            }
        }
        locks.insert(name.to_string(), (cookie.to_string(), now + ttl));
        Ok(())
    }

    async fn unlock(&self, name: &str, cookie: &str) -> Result<()> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| SyncError::storage(e.to_string()))?;
        if matches!(locks.get(name), Some((holder, _)) if holder == cookie) {
            locks.remove(name);
        }
        Ok(())
    }
}

/// Observable lease state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseStatus {
    /// First lock attempt in flight.
    Acquiring,
    /// Held and being renewed.
    Locked,
    /// Renewal stopped because of an error.
    Done(SyncError),
    /// Released by [`LeaseManager::go_down`].
    Released,
}

/// Holder of one named lease.
pub struct LeaseManager {
    name: String,
    cookie: String,
    status: watch::Receiver<LeaseStatus>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl LeaseManager {
    /// Starts taking and renewing `name`.
    ///
    /// The lock is re-taken every `renew_interval`, which must be shorter
    /// than `ttl` for the lease to stay continuous.
    pub fn acquire(
        backend: Arc<dyn LeaseBackend>,
        name: impl Into<String>,
        ttl: Duration,
        renew_interval: Duration,
    ) -> Self {
        let name = name.into();
        let cookie = gen_cookie();
        let (tx, rx) = watch::channel(LeaseStatus::Acquiring);
        let stop = CancellationToken::new();
        let task = tokio::spawn(renew_loop(
            backend,
            name.clone(),
            cookie.clone(),
            ttl,
            renew_interval,
            tx,
            stop.clone(),
        ));
        Self {
            name,
            cookie,
            status: rx,
            stop,
            task: Some(task),
        }
    }

    /// Lease name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owner cookie presented to the backend.
    pub fn cookie(&self) -> &str {
        &self.cookie
    }

    /// Current status.
    pub fn status(&self) -> LeaseStatus {
        self.status.borrow().clone()
    }

    /// True while the lease is held.
    pub fn is_locked(&self) -> bool {
        matches!(*self.status.borrow(), LeaseStatus::Locked)
    }

    /// Ok while locked, otherwise the error dependent work should stop with.
    pub fn check(&self) -> Result<()> {
        match &*self.status.borrow() {
            LeaseStatus::Locked => Ok(()),
            LeaseStatus::Done(e) => Err(e.clone()),
            LeaseStatus::Acquiring => Err(SyncError::Busy {
                name: self.name.clone(),
            }),
            LeaseStatus::Released => Err(SyncError::LeaseLost {
                name: self.name.clone(),
                reason: "released".to_string(),
            }),
        }
    }

    /// Waits until the lease is locked or has failed.
    pub async fn wait_locked(&mut self) -> Result<()> {
        loop {
            match &*self.status.borrow_and_update() {
                LeaseStatus::Acquiring => {}
                _ => break,
            }
            if self.status.changed().await.is_err() {
                break;
            }
        }
        self.check()
    }

    /// Waits for the lease to leave the locked state.
    pub async fn lost(&mut self) -> SyncError {
        loop {
            if let Err(e) = self.check() {
                if !matches!(*self.status.borrow(), LeaseStatus::Acquiring) {
                    return e;
                }
            }
            if self.status.changed().await.is_err() {
                return self.check().err().unwrap_or(SyncError::Shutdown);
            }
        }
    }

    /// Stops renewal and releases the lock.
    pub async fn go_down(mut self) {
        self.stop.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!(lease = %self.name, error = %e, "lease task did not finish cleanly");
            }
        }
    }

    /// Stops renewal without releasing; the lock lapses after its TTL.
    pub fn abort(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for LeaseManager {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

fn gen_cookie() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(COOKIE_LEN)
        .map(char::from)
        .collect()
}

async fn renew_loop(
    backend: Arc<dyn LeaseBackend>,
    name: String,
    cookie: String,
    ttl: Duration,
    renew_interval: Duration,
    tx: watch::Sender<LeaseStatus>,
    stop: CancellationToken,
) {
    let mut locked = false;
    loop {
        match backend.lock(&name, &cookie, ttl).await {
            Ok(()) => {
                if !locked {
                    info!(lease = %name, "lease acquired");
                    locked = true;
                    tx.send_replace(LeaseStatus::Locked);
                } else {
                    debug!(lease = %name, "lease renewed");
                }
            }
            Err(e) => {
                let err = if locked {
                    SyncError::LeaseLost {
                        name: name.clone(),
                        reason: e.to_string(),
                    }
                } else {
                    e
                };
                warn!(lease = %name, error = %err, "lease failed");
                tx.send_replace(LeaseStatus::Done(err));
                return;
            }
        }

        tokio::select! {
            _ = stop.cancelled() => break,
            _ = tokio::time::sleep(renew_interval) => {}
        }
    }

    if let Err(e) = backend.unlock(&name, &cookie).await {
        warn!(lease = %name, error = %e, "lease unlock failed");
    }
    info!(lease = %name, "lease released");
    tx.send_replace(LeaseStatus::Released);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> Arc<MemoryLeaseBackend> {
        Arc::new(MemoryLeaseBackend::new())
    }

    mod backend {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_lock_is_exclusive_until_expiry() {
            let b = MemoryLeaseBackend::new();
            let ttl = Duration::from_secs(30);
            b.lock("shardA", "one", ttl).await.unwrap();
            assert!(matches!(
                b.lock("shardA", "two", ttl).await,
                Err(SyncError::Busy { .. })
            ));
            tokio::time::advance(Duration::from_secs(31)).await;
            b.lock("shardA", "two", ttl).await.unwrap();
            assert_eq!(b.holder("shardA").as_deref(), Some("two"));
        }

        #[tokio::test]
        async fn test_unlock_requires_cookie() {
            let b = MemoryLeaseBackend::new();
            b.lock("l", "one", Duration::from_secs(5)).await.unwrap();
            b.unlock("l", "two").await.unwrap();
            assert_eq!(b.holder("l").as_deref(), Some("one"));
            b.unlock("l", "one").await.unwrap();
            assert!(b.holder("l").is_none());
        }
    }

    mod manager {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn test_acquire_and_go_down() {
            let b = backend();
            let mut lease = LeaseManager::acquire(
                b.clone(),
                "shard.0",
                Duration::from_secs(30),
                Duration::from_secs(15),
            );
            lease.wait_locked().await.unwrap();
            assert!(lease.is_locked());
            assert_eq!(lease.cookie().len(), COOKIE_LEN);
            assert_eq!(b.holder("shard.0").as_deref(), Some(lease.cookie()));

            lease.go_down().await;
            assert!(b.holder("shard.0").is_none());
        }

        #[tokio::test(start_paused = true)]
        async fn test_renewal_keeps_lock_past_ttl() {
            let b = backend();
            let mut lease = LeaseManager::acquire(
                b.clone(),
                "shard.0",
                Duration::from_secs(30),
                Duration::from_secs(15),
            );
            lease.wait_locked().await.unwrap();
            tokio::time::sleep(Duration::from_secs(120)).await;
            assert!(lease.is_locked());
            assert!(matches!(
                b.lock("shard.0", "intruder", Duration::from_secs(30)).await,
                Err(SyncError::Busy { .. })
            ));
        }

        #[tokio::test(start_paused = true)]
        async fn test_busy_lease_is_done() {
            let b = backend();
            b.lock("shard.0", "other", Duration::from_secs(30))
                .await
                .unwrap();
            let mut lease = LeaseManager::acquire(
                b.clone(),
                "shard.0",
                Duration::from_secs(30),
                Duration::from_secs(15),
            );
            let err = lease.wait_locked().await.unwrap_err();
            assert!(matches!(err, SyncError::Busy { .. }));
            assert!(matches!(lease.status(), LeaseStatus::Done(_)));
        }

        #[tokio::test(start_paused = true)]
        async fn test_takeover_reports_lease_lost() {
            let b = backend();
            let mut lease = LeaseManager::acquire(
                b.clone(),
                "shard.0",
                Duration::from_secs(30),
                Duration::from_secs(15),
            );
            lease.wait_locked().await.unwrap();
            // Simulate a competitor stealing the lock after a partition.
            b.unlock("shard.0", lease.cookie()).await.unwrap();
            b.lock("shard.0", "thief", Duration::from_secs(300))
                .await
                .unwrap();

            let err = lease.lost().await;
            assert!(matches!(err, SyncError::LeaseLost { .. }));
            assert!(!lease.is_locked());
            assert!(lease.check().is_err());
        }

        #[tokio::test(start_paused = true)]
        async fn test_abort_leaves_lock_to_expire() {
            let b = backend();
            let mut lease = LeaseManager::acquire(
                b.clone(),
                "shard.0",
                Duration::from_secs(30),
                Duration::from_secs(15),
            );
            lease.wait_locked().await.unwrap();
            lease.abort();
            assert!(b.holder("shard.0").is_some());
            tokio::time::advance(Duration::from_secs(31)).await;
            assert!(b.holder("shard.0").is_none());
        }
    }
}
