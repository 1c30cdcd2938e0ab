use crate::clock::Timestamp;
use crate::errors::{CacheError, ListenerError, Result};
use crate::listeners::CacheListener;
use crate::store::{CacheObject, KeyedStore};
use crate::supervision::NewestWinsFilter;
use crate::tags::structures::Tag;
use dashmap::{DashMap, DashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

pub type SubscriberId = u64;

/// Tags somebody is currently subscribed to.
///
/// A tag enters the view with its first subscriber and leaves it with its last. Notifications
/// from the cache are forwarded to the subscribers of the tag, each with its own copy, after the
/// newest-wins ordering filter.
pub struct LiveTagView {
    tags: Arc<KeyedStore<Tag>>,
    live: DashSet<u64>,
    subscribers: DashMap<SubscriberId, Arc<dyn CacheListener<Tag>>>,
    filter: NewestWinsFilter,
    next_id: AtomicU64,
}

impl LiveTagView {
    pub fn new(tags: Arc<KeyedStore<Tag>>) -> Self {
        LiveTagView {
            tags,
            live: DashSet::new(),
            subscribers: DashMap::new(),
            filter: NewestWinsFilter::new(),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add_subscriber(&self, listener: Arc<dyn CacheListener<Tag>>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, listener);
        id
    }

    /// Drops a subscriber and its interest in every tag.
    pub fn remove_subscriber(&self, subscriber: SubscriberId) -> bool {
        if self.subscribers.remove(&subscriber).is_none() {
            return false;
        }
        for tag_id in self.live_ids() {
            if let Err(e) = self.unsubscribe(tag_id, subscriber) {
                debug!(tag_id, subscriber, "Unsubscribe during removal failed: {}", e);
            }
        }
        true
    }

    /// Registers interest of `subscriber` in a tag and returns a copy of the tag.
    ///
    /// Membership in the view changes under the tag's write lock, together with the subscriber
    /// set, so a concurrent last unsubscribe cannot evict a tag that just gained a subscriber.
    pub fn subscribe(&self, tag_id: u64, subscriber: SubscriberId) -> Result<Tag> {
        let copy = self.tags.with_write(tag_id, |tag| {
            tag.core.update_listeners.insert(subscriber);
            if self.live.insert(tag_id) {
                self.filter.accept_value(tag_id, tag.core.cache_timestamp);
            }
            tag.deep_copy()
        })?;
        debug!(tag_id, subscriber, "Tag subscribed");
        Ok(copy)
    }

    /// Removes interest; the tag leaves the view when nobody is left. Returns whether it left.
    pub fn unsubscribe(&self, tag_id: u64, subscriber: SubscriberId) -> Result<bool> {
        match self.tags.with_write(tag_id, |tag| {
            tag.core.update_listeners.remove(&subscriber);
            if tag.core.update_listeners.is_empty() {
                self.evict(tag_id);
                true
            } else {
                false
            }
        }) {
            Ok(evicted) => Ok(evicted),
            // Deleted from the cache meanwhile.
            Err(CacheError::NotFound { .. }) => {
                self.evict(tag_id);
                Ok(true)
            }
            Err(e) => Err(e),
        }
    }

    /// Live copy of a tag, `NotFound` unless somebody is subscribed to it.
    pub fn get(&self, tag_id: u64) -> Result<Tag> {
        if !self.live.contains(&tag_id) {
            return Err(CacheError::not_found("live tag", tag_id));
        }
        self.tags.get_copy(tag_id)
    }

    pub fn contains(&self, tag_id: u64) -> bool {
        self.live.contains(&tag_id)
    }

    pub fn live_ids(&self) -> Vec<u64> {
        self.live.iter().map(|id| *id).collect()
    }

    pub(crate) fn evict(&self, tag_id: u64) {
        if self.live.remove(&tag_id).is_some() {
            self.filter.forget(tag_id);
            debug!(tag_id, "Tag evicted from live view");
        }
    }

    fn forward(&self, tag: &Tag, send: impl Fn(&dyn CacheListener<Tag>, Tag) -> std::result::Result<(), ListenerError>) {
        for subscriber in &tag.core.update_listeners {
            let listener = match self.subscribers.get(subscriber) {
                Some(listener) => Arc::clone(listener.value()),
                None => continue,
            };
            if let Err(e) = send(listener.as_ref(), tag.deep_copy()) {
                error!(tag_id = tag.core.id, subscriber, "Live subscriber failed: {}", e);
            }
        }
    }
}

impl CacheListener<Tag> for LiveTagView {
    fn on_value_updated(&self, tag: Tag) -> std::result::Result<(), ListenerError> {
        if self.live.contains(&tag.core.id) && self.filter.accept_value(tag.core.id, tag.core.cache_timestamp) {
            self.forward(&tag, |listener, copy| listener.on_value_updated(copy));
        }
        Ok(())
    }

    fn on_supervision_changed(&self, tag: Tag) -> std::result::Result<(), ListenerError> {
        if self.live.contains(&tag.core.id)
            && self.filter.accept_supervision(tag.core.id, tag.core.cache_timestamp)
        {
            self.forward(&tag, |listener, copy| listener.on_supervision_changed(copy));
        }
        Ok(())
    }

    fn on_status_confirmation(&self, tag: Tag, timestamp: Timestamp) -> std::result::Result<(), ListenerError> {
        if self.live.contains(&tag.core.id) {
            self.forward(&tag, |listener, copy| listener.on_status_confirmation(copy, timestamp));
        }
        Ok(())
    }
}
