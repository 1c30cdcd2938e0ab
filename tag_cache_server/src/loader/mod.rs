//! Boundary to the backing store the cache is populated from and persisted to.
//!
//! The cache never holds an object lock while calling a loader.

use crate::errors::LoaderError;
use crate::store::CacheObject;
use async_trait::async_trait;
use dashmap::DashMap;

pub type LoaderResult<T> = Result<T, LoaderError>;

/// Bulk loader and persister for one cache object type.
#[async_trait]
pub trait CacheLoader<T>: Send + Sync {
    async fn load_all(&self) -> LoaderResult<Vec<T>>;

    async fn load_by_id(&self, id: u64) -> LoaderResult<T>;

    async fn persist(&self, object: &T) -> LoaderResult<()>;

    async fn delete(&self, id: u64) -> LoaderResult<()>;
}

/// Loader backed by a concurrent map. Seeded from settings by the server binary and used as the
/// backing store in tests.
pub struct InMemoryLoader<T> {
    objects: DashMap<u64, T>,
}

impl<T: CacheObject> InMemoryLoader<T> {
    pub fn new() -> Self {
        InMemoryLoader {
            objects: DashMap::new(),
        }
    }

    pub fn with_objects(objects: impl IntoIterator<Item = T>) -> Self {
        let loader = Self::new();
        for object in objects {
            loader.objects.insert(object.id(), object);
        }
        loader
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, id: u64) -> bool {
        self.objects.contains_key(&id)
    }
}

impl<T: CacheObject> Default for InMemoryLoader<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: CacheObject> CacheLoader<T> for InMemoryLoader<T> {
    async fn load_all(&self) -> LoaderResult<Vec<T>> {
        let mut objects: Vec<T> = self
            .objects
            .iter()
            .map(|entry| entry.value().deep_copy())
            .collect();
        objects.sort_by_key(|object| object.id());
        Ok(objects)
    }

    async fn load_by_id(&self, id: u64) -> LoaderResult<T> {
        self.objects
            .get(&id)
            .map(|entry| entry.value().deep_copy())
            .ok_or(LoaderError::NotFound { id })
    }

    async fn persist(&self, object: &T) -> LoaderResult<()> {
        self.objects.insert(object.id(), object.deep_copy());
        Ok(())
    }

    async fn delete(&self, id: u64) -> LoaderResult<()> {
        self.objects.remove(&id);
        Ok(())
    }
}
