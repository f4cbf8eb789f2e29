// Copyright 2024 Matthew Ingwersen.
//
// Licensed under the Apache License, Version 2.0 (the "License"); you
// may not use this file except in compliance with the License. You may
// obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or
// implied. See the License for the specific language governing
// permissions and limitations under the License.

//! A cooperative advisory lock on a KV store key.
//!
//! A [`KeyLock`] is held by creating the key with a short TTL and a
//! value unique to the lock instance. Waiters watch the key and retry
//! when it changes. While held, a heartbeat task refreshes the TTL, so
//! the lock outlives any single TTL window but is released
//! automatically (by expiry) if its holder dies. Releasing is a
//! compare-and-delete against the unique value, so a lock instance can
//! only ever release its own ownership.
//!
//! The heartbeat and the releasing task observe a single cancellation
//! signal, triggered by [`KeyLock::abandon`] (or by dropping the
//! lock). Once the signal fires, the TTL is never extended again.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::watch;
use uuid::Uuid;

use crate::store::{KvError, KvStore};

/// The TTL given to the lock key. A dead holder releases the lock
/// after at most this long.
const LOCK_TTL: Duration = Duration::from_secs(10);

/// How often the holder refreshes the lock key's TTL.
const LOCK_HEARTBEAT: Duration = Duration::from_secs(5);

/// How long to pause before retrying when neither the create nor the
/// watch worked (e.g. the store is unreachable).
const RETRY_PAUSE: Duration = Duration::from_secs(1);

////////////////////////////////////////////////////////////////////////
// THE LOCK                                                           //
////////////////////////////////////////////////////////////////////////

/// A cooperative lock on a single KV store key.
pub struct KeyLock {
    store: Arc<dyn KvStore>,
    key: String,
    uuid: String,
    kill: watch::Sender<bool>,
}

impl KeyLock {
    pub fn new(store: Arc<dyn KvStore>, key: impl Into<String>) -> Self {
        let (kill, _) = watch::channel(false);
        Self {
            store,
            key: key.into(),
            uuid: Uuid::new_v4().to_string(),
            kill,
        }
    }

    /// Acquires the lock, waiting as long as it takes. On success the
    /// heartbeat and releaser tasks are running and the lock is held
    /// until [`KeyLock::abandon`] (or drop). Fails only if the lock is
    /// abandoned while still waiting.
    pub async fn acquire(&self) -> Result<(), LockError> {
        let mut kill = self.kill.subscribe();
        loop {
            if *kill.borrow() {
                return Err(LockError::Abandoned);
            }
            match self
                .store
                .create(&self.key, &self.uuid, Some(LOCK_TTL))
                .await
            {
                Ok(_) => {
                    debug!("acquired lock {}", self.key);
                    self.spawn_keepers();
                    return Ok(());
                }
                Err(KvError::NodeExist { index, .. }) => {
                    // Somebody holds it. Watch until the key changes;
                    // starting from the returned index + 1 makes sure
                    // no change in between is missed.
                    tokio::select! {
                        watched = self.store.watch(&self.key, index + 1) => {
                            if watched.is_err() {
                                tokio::time::sleep(RETRY_PAUSE).await;
                            }
                        }
                        _ = kill.changed() => {}
                    }
                }
                Err(error) => {
                    debug!("lock create for {} failed: {error}", self.key);
                    tokio::time::sleep(RETRY_PAUSE).await;
                }
            }
        }
    }

    /// The blocking wrapper around [`KeyLock::acquire`] for callers
    /// that just want to wait, but not forever.
    pub async fn wait_for_acquire(&self, timeout: Duration) -> Result<(), LockError> {
        match tokio::time::timeout(timeout, self.acquire()).await {
            Ok(result) => result,
            Err(_) => {
                self.abandon();
                Err(LockError::Timeout)
            }
        }
    }

    /// Abandons the lock: signals the heartbeat to stop and the
    /// releaser to delete our ownership. Idempotent, and also invoked
    /// on drop.
    pub fn abandon(&self) {
        self.kill.send_replace(true);
    }

    /// Spawns the two tasks that tend a held lock: the heartbeat that
    /// refreshes the TTL, and the releaser that deletes the key once
    /// the lock is abandoned.
    fn spawn_keepers(&self) {
        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        let uuid = self.uuid.clone();
        let mut kill = self.kill.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(LOCK_HEARTBEAT) => {
                        if *kill.borrow() {
                            return;
                        }
                        if let Err(error) = store.set(&key, &uuid, Some(LOCK_TTL)).await {
                            debug!("lock heartbeat for {key} failed: {error}");
                        }
                    }
                    changed = kill.changed() => {
                        if changed.is_err() || *kill.borrow() {
                            return;
                        }
                    }
                }
            }
        });

        let store = Arc::clone(&self.store);
        let key = self.key.clone();
        let uuid = self.uuid.clone();
        let mut kill = self.kill.subscribe();
        tokio::spawn(async move {
            while !*kill.borrow() {
                if kill.changed().await.is_err() {
                    break;
                }
            }
            if let Err(error) = store.compare_and_delete(&key, &uuid).await {
                if !error.is_key_not_found() {
                    debug!("failed to release lock {key}: {error}");
                }
            }
        });
    }
}

impl Drop for KeyLock {
    fn drop(&mut self) {
        self.abandon();
    }
}

////////////////////////////////////////////////////////////////////////
// ERRORS                                                             //
////////////////////////////////////////////////////////////////////////

/// Errors that arise while acquiring a [`KeyLock`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LockError {
    /// The lock was not acquired within the caller's deadline.
    Timeout,
    /// The lock was abandoned while still waiting to acquire it.
    Abandoned,
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::Timeout => f.write_str("could not acquire the lock in time"),
            Self::Abandoned => f.write_str("the lock was abandoned while acquiring it"),
        }
    }
}

impl std::error::Error for LockError {}

////////////////////////////////////////////////////////////////////////
// TESTS                                                              //
////////////////////////////////////////////////////////////////////////

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn a_free_lock_is_acquired_immediately() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let lock = KeyLock::new(Arc::clone(&store), "dns/_UPDATE_LOCK");
        lock.wait_for_acquire(Duration::from_secs(5)).await.unwrap();
        let node = store.get("dns/_UPDATE_LOCK", false, false).await.unwrap();
        assert_eq!(node.value, lock.uuid);
    }

    #[tokio::test]
    async fn abandoning_releases_the_key() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let lock = KeyLock::new(Arc::clone(&store), "dns/_UPDATE_LOCK");
        lock.wait_for_acquire(Duration::from_secs(5)).await.unwrap();
        lock.abandon();

        // The releaser runs as its own task; give it a chance.
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let err = store.get("dns/_UPDATE_LOCK", false, false).await.unwrap_err();
        assert!(err.is_key_not_found());
    }

    #[tokio::test]
    async fn a_second_holder_waits_for_the_first() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let first = KeyLock::new(Arc::clone(&store), "dns/_UPDATE_LOCK");
        first.wait_for_acquire(Duration::from_secs(5)).await.unwrap();

        let second = Arc::new(KeyLock::new(Arc::clone(&store), "dns/_UPDATE_LOCK"));
        let waiter = {
            let second = Arc::clone(&second);
            tokio::spawn(async move { second.wait_for_acquire(Duration::from_secs(30)).await })
        };
        tokio::task::yield_now().await;
        first.abandon();

        waiter.await.unwrap().unwrap();
        let node = store.get("dns/_UPDATE_LOCK", false, false).await.unwrap();
        assert_eq!(node.value, second.uuid);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_times_out_when_the_lock_is_kept() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let first = KeyLock::new(Arc::clone(&store), "dns/_UPDATE_LOCK");
        first.wait_for_acquire(Duration::from_secs(5)).await.unwrap();

        let second = KeyLock::new(Arc::clone(&store), "dns/_UPDATE_LOCK");
        let result = second.wait_for_acquire(Duration::from_secs(3)).await;
        assert_eq!(result, Err(LockError::Timeout));

        // The first holder is untouched.
        let node = store.get("dns/_UPDATE_LOCK", false, false).await.unwrap();
        assert_eq!(node.value, first.uuid);
    }

    #[tokio::test(start_paused = true)]
    async fn the_heartbeat_outlives_the_ttl() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let lock = KeyLock::new(Arc::clone(&store), "dns/_UPDATE_LOCK");
        lock.wait_for_acquire(Duration::from_secs(5)).await.unwrap();

        // Well past the 10-second TTL, the heartbeat has kept the key
        // alive.
        tokio::time::sleep(Duration::from_secs(25)).await;
        let node = store.get("dns/_UPDATE_LOCK", false, false).await.unwrap();
        assert_eq!(node.value, lock.uuid);
    }

    #[tokio::test(start_paused = true)]
    async fn a_dead_holder_releases_by_expiry() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        // Simulate another process that took the lock and died: the
        // key exists but nothing refreshes it.
        store
            .set("dns/_UPDATE_LOCK", "dead-owner", Some(Duration::from_secs(10)))
            .await
            .unwrap();

        let lock = KeyLock::new(Arc::clone(&store), "dns/_UPDATE_LOCK");
        lock.wait_for_acquire(Duration::from_secs(30)).await.unwrap();
        let node = store.get("dns/_UPDATE_LOCK", false, false).await.unwrap();
        assert_eq!(node.value, lock.uuid);
    }
}
