#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **aeon-locks** – Named advisory locks for the aeon command pipeline.
//!
//! A command declares the lock names it needs; the command consumer acquires
//! them in sorted-ascending order before invoking `execute` (§4.5/§4.7) to
//! avoid deadlock between commands that share more than one lock name.
//!
//! [`LockProvider`] is dyn-compatible so the same trait object boundary
//! admits both the in-process [`LocalLockProvider`] shipped here and a
//! future out-of-process implementation (e.g. backed by a distributed lock
//! service) without the consumer knowing which one it was handed — mirrors
//! the teacher's `EventBus`/`TokenValidator` trait-object seams.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

/// Errors raised while acquiring a named lock.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    /// The lock was not acquired within the caller's timeout.
    #[error("timed out acquiring lock {0:?}")]
    Timeout(String),
    /// The backing lock service rejected the request.
    #[error("lock backend error: {0}")]
    Backend(String),
}

/// A held lock, released on drop regardless of which exit path (success,
/// error, panic unwind) the holder takes — "scoped; released on all exit
/// paths" per spec §4.5.
pub struct LockGuard {
    name: String,
    // Type-erased so every provider implementation — in-process mutex guard
    // or a distributed lock's release handle — can return the same concrete
    // `LockGuard` type from the shared trait.
    _release: Box<dyn Any + Send>,
}

impl LockGuard {
    /// The lock name this guard holds.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard").field("name", &self.name).finish()
    }
}

/// Provider of named advisory locks.
///
/// Locks are keyed by opaque strings chosen by the command; implementations
/// must support both in-process and out-of-process acquisition behind this
/// one contract.
#[async_trait]
pub trait LockProvider: Send + Sync {
    /// Acquire the named lock, waiting indefinitely.
    async fn acquire(&self, name: &str) -> Result<LockGuard, LockError>;

    /// Attempt to acquire the named lock within `timeout`, returning `None`
    /// on timeout rather than an error — the caller decides whether that is
    /// fatal (the consumer turns it into `Failed(LockTimeout)`).
    async fn try_acquire(&self, name: &str, timeout: Duration) -> Result<Option<LockGuard>, LockError>;

    /// Acquire every name in `names`, sorted ascending and deduplicated
    /// first, releasing whatever was already acquired if any later
    /// acquisition times out. This is the ordering contract of §4.5/§4.7:
    /// "acquisition order inside a single command is sorted ascending by
    /// name to prevent deadlock between commands."
    async fn acquire_sorted(
        &self,
        names: &[String],
        timeout: Duration,
    ) -> Result<Vec<LockGuard>, LockError> {
        let mut sorted: Vec<&String> = names.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut held = Vec::with_capacity(sorted.len());
        for name in sorted {
            match self.try_acquire(name, timeout).await? {
                Some(guard) => held.push(guard),
                None => return Err(LockError::Timeout(name.clone())),
            }
        }
        Ok(held)
    }
}

/// In-process lock provider: one `tokio::sync::Mutex<()>` per name, created
/// lazily on first use and kept for the life of the provider.
#[derive(Default)]
pub struct LocalLockProvider {
    locks: RwLock<HashMap<String, Arc<Mutex<()>>>>,
}

impl LocalLockProvider {
    /// Construct an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_for(&self, name: &str) -> Arc<Mutex<()>> {
        if let Some(existing) = self.locks.read().await.get(name) {
            return existing.clone();
        }
        let mut guard = self.locks.write().await;
        guard.entry(name.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

#[async_trait]
impl LockProvider for LocalLockProvider {
    async fn acquire(&self, name: &str) -> Result<LockGuard, LockError> {
        let mutex = self.lock_for(name).await;
        let owned: OwnedMutexGuard<()> = mutex.lock_owned().await;
        Ok(LockGuard { name: name.to_string(), _release: Box::new(owned) })
    }

    async fn try_acquire(&self, name: &str, timeout: Duration) -> Result<Option<LockGuard>, LockError> {
        let mutex = self.lock_for(name).await;
        match tokio::time::timeout(timeout, mutex.lock_owned()).await {
            Ok(owned) => Ok(Some(LockGuard { name: name.to_string(), _release: Box::new(owned) })),
            Err(_elapsed) => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn distinct_names_do_not_contend() {
        let provider = LocalLockProvider::new();
        let a = provider.acquire("a").await.unwrap();
        let b = provider.acquire("b").await.unwrap();
        assert_eq!(a.name(), "a");
        assert_eq!(b.name(), "b");
    }

    #[tokio::test]
    async fn second_acquire_of_same_name_blocks_until_released() {
        let provider = Arc::new(LocalLockProvider::new());
        let first = provider.acquire("x").await.unwrap();

        let counter = Arc::new(AtomicUsize::new(0));
        let provider2 = provider.clone();
        let counter2 = counter.clone();
        let handle = tokio::spawn(async move {
            let _second = provider2.acquire("x").await.unwrap();
            counter2.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0, "second waiter should still be blocked");

        drop(first);
        handle.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn try_acquire_times_out_when_contended() {
        let provider = LocalLockProvider::new();
        let _held = provider.acquire("x").await.unwrap();
        let result = provider.try_acquire("x", Duration::from_millis(5)).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn acquire_sorted_dedups_and_orders() {
        let provider = LocalLockProvider::new();
        let guards = provider
            .acquire_sorted(
                &["b".to_string(), "a".to_string(), "b".to_string()],
                Duration::from_millis(100),
            )
            .await
            .unwrap();
        assert_eq!(guards.len(), 2);
        assert_eq!(guards[0].name(), "a");
        assert_eq!(guards[1].name(), "b");
    }
}
