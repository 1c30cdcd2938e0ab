use crate::errors::{CacheError, LockTimeoutWarning, Result};
use dashmap::DashMap;
use parking_lot::{ReentrantMutex, ReentrantMutexGuard};
use std::cell::RefCell;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// An object that can live in a [`KeyedStore`].
///
/// `deep_copy` must be total: the copy shares no mutable state with the original, so it can be
/// handed to listeners while the cached object keeps changing.
pub trait CacheObject: Send + Sync + 'static {
    fn id(&self) -> u64;

    fn deep_copy(&self) -> Self
    where
        Self: Sized;
}

/// Lock wait policy. Waits are retried forever; every `warn_after_retries` failed attempts a
/// [`LockTimeoutWarning`] is logged.
#[derive(Debug, Clone, Copy)]
pub struct LockPolicy {
    pub retry_interval: Duration,
    pub warn_after_retries: u32,
}

impl Default for LockPolicy {
    fn default() -> Self {
        LockPolicy {
            retry_interval: Duration::from_millis(100),
            warn_after_retries: 10,
        }
    }
}

/// Per-key lock. The thread holding it may lock it again; the object inside is borrowed through
/// the `RefCell`, so overlapping access from nested calls fails with
/// [`CacheError::LockConflict`] instead of blocking forever.
type ObjectLock<T> = ReentrantMutex<RefCell<T>>;

/// Held per-key lock. Released when dropped, on every exit path.
pub type ObjectGuard<'a, T> = ReentrantMutexGuard<'a, RefCell<T>>;

/// Live reference to a cached object and its per-key lock.
pub struct ObjectHandle<T> {
    store: &'static str,
    id: u64,
    lock: Arc<ObjectLock<T>>,
    policy: LockPolicy,
    warnings: Arc<AtomicU64>,
}

impl<T> Clone for ObjectHandle<T> {
    fn clone(&self) -> Self {
        ObjectHandle {
            store: self.store,
            id: self.id,
            lock: Arc::clone(&self.lock),
            policy: self.policy,
            warnings: Arc::clone(&self.warnings),
        }
    }
}

impl<T> ObjectHandle<T> {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Blocks until the lock is held. Returns at once if this thread already holds it.
    pub fn lock(&self) -> ObjectGuard<'_, T> {
        let started = Instant::now();
        let mut attempts = 0u32;
        loop {
            if let Some(guard) = self.lock.try_lock_for(self.policy.retry_interval) {
                return guard;
            }
            attempts += 1;
            self.report_wait(attempts, started);
        }
    }

    pub fn try_lock(&self, timeout: Duration) -> Option<ObjectGuard<'_, T>> {
        self.lock.try_lock_for(timeout)
    }

    /// Runs `f` on the object under the lock.
    pub fn read<R>(&self, f: impl FnOnce(&T) -> R) -> Result<R> {
        let guard = self.lock();
        let object = guard.try_borrow().map_err(|_| self.conflict())?;
        Ok(f(&object))
    }

    /// Runs `f` on the object under the lock, with mutable access.
    pub fn write<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        let guard = self.lock();
        let mut object = guard.try_borrow_mut().map_err(|_| self.conflict())?;
        Ok(f(&mut object))
    }

    fn conflict(&self) -> CacheError {
        CacheError::LockConflict {
            store: self.store,
            id: self.id,
        }
    }

    fn report_wait(&self, attempts: u32, started: Instant) {
        let every = self.policy.warn_after_retries.max(1);
        if attempts % every == 0 {
            self.warnings.fetch_add(1, Ordering::Relaxed);
            let warning = LockTimeoutWarning {
                store: self.store,
                id: self.id,
                attempts,
                waited: started.elapsed(),
            };
            warn!(store = self.store, id = self.id, attempts, "{}", warning);
        }
    }
}

impl<T: CacheObject> ObjectHandle<T> {
    /// Deep copy taken under the lock.
    pub fn snapshot(&self) -> Result<T> {
        self.read(|object| object.deep_copy())
    }
}

/// Concurrent map from numeric id to cache object with one re-entrant lock per key.
///
/// The map itself is sharded (`DashMap`); the per-key lock lives in the value so that holding an
/// object lock never blocks access to other keys of the same shard.
pub struct KeyedStore<T> {
    name: &'static str,
    entries: DashMap<u64, Arc<ObjectLock<T>>>,
    policy: LockPolicy,
    warnings: Arc<AtomicU64>,
}

impl<T: CacheObject> KeyedStore<T> {
    pub fn new(name: &'static str) -> Self {
        Self::with_policy(name, LockPolicy::default())
    }

    pub fn with_policy(name: &'static str, policy: LockPolicy) -> Self {
        KeyedStore {
            name,
            entries: DashMap::new(),
            policy,
            warnings: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Live reference to the object with `id`, or `NotFound`.
    pub fn get(&self, id: u64) -> Result<ObjectHandle<T>> {
        self.entries
            .get(&id)
            .map(|entry| self.handle(id, Arc::clone(entry.value())))
            .ok_or_else(|| CacheError::not_found(self.name, id))
    }

    /// Deep copy of the object, consistent across all its fields.
    pub fn get_copy(&self, id: u64) -> Result<T> {
        self.get(id)?.snapshot()
    }

    /// Insert or replace. A replaced object keeps no lock holders: waiters on the old entry
    /// finish against the old value.
    pub fn put(&self, object: T) {
        let id = object.id();
        self.entries.insert(id, Arc::new(ReentrantMutex::new(RefCell::new(object))));
    }

    /// Insert only if the key is absent. Returns `false` when it already existed.
    pub fn put_if_absent(&self, object: T) -> bool {
        let id = object.id();
        match self.entries.entry(id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(Arc::new(ReentrantMutex::new(RefCell::new(object))));
                true
            }
        }
    }

    pub fn remove(&self, id: u64) -> bool {
        self.entries.remove(&id).is_some()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ids(&self) -> Vec<u64> {
        self.entries.iter().map(|entry| *entry.key()).collect()
    }

    /// Handles to every object. Collected up front so no shard lock is held while callers take
    /// object locks.
    pub fn handles(&self) -> Vec<ObjectHandle<T>> {
        let collected: Vec<(u64, Arc<ObjectLock<T>>)> = self
            .entries
            .iter()
            .map(|entry| (*entry.key(), Arc::clone(entry.value())))
            .collect();
        collected
            .into_iter()
            .map(|(id, lock)| self.handle(id, lock))
            .collect()
    }

    pub fn with_read<R>(&self, id: u64, f: impl FnOnce(&T) -> R) -> Result<R> {
        self.get(id)?.read(f)
    }

    pub fn with_write<R>(&self, id: u64, f: impl FnOnce(&mut T) -> R) -> Result<R> {
        self.get(id)?.write(f)
    }

    /// Number of lock wait warnings logged so far.
    pub fn lock_warnings(&self) -> u64 {
        self.warnings.load(Ordering::Relaxed)
    }

    fn handle(&self, id: u64, lock: Arc<ObjectLock<T>>) -> ObjectHandle<T> {
        ObjectHandle {
            store: self.name,
            id,
            lock,
            policy: self.policy,
            warnings: Arc::clone(&self.warnings),
        }
    }
}
