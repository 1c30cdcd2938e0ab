use crate::clock::Timestamp;
use dashmap::DashMap;

/// Consumer-side ordering filter for tag notifications.
///
/// Value and supervision notifications travel on independent channels, so a consumer decides
/// "newest wins" from the embedded cache timestamp rather than receipt order:
/// - a value notification is accepted if it is the first one or strictly newer than the last
///   accepted timestamp;
/// - a supervision notification keeps the tag's old timestamp, so it is accepted when its
///   timestamp is equal to or newer than the last seen one and rejected only when strictly older,
///   i.e. when a newer value has already overtaken it.
#[derive(Debug, Default)]
pub struct NewestWinsFilter {
    last_seen: DashMap<u64, Timestamp>,
}

impl NewestWinsFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn accept_value(&self, tag_id: u64, cache_timestamp: Timestamp) -> bool {
        let mut entry = self.last_seen.entry(tag_id).or_insert(0);
        if *entry == 0 || cache_timestamp > *entry {
            *entry = cache_timestamp;
            true
        } else {
            false
        }
    }

    pub fn accept_supervision(&self, tag_id: u64, cache_timestamp: Timestamp) -> bool {
        let mut entry = self.last_seen.entry(tag_id).or_insert(cache_timestamp);
        if cache_timestamp < *entry {
            return false;
        }
        *entry = cache_timestamp;
        true
    }

    pub fn last_seen(&self, tag_id: u64) -> Option<Timestamp> {
        self.last_seen.get(&tag_id).map(|entry| *entry)
    }

    pub fn forget(&self, tag_id: u64) {
        self.last_seen.remove(&tag_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervision_with_same_timestamp_is_accepted() {
        let filter = NewestWinsFilter::new();
        assert!(filter.accept_value(1, 100));
        assert!(filter.accept_supervision(1, 100));
        assert!(!filter.accept_value(1, 100));
    }

    #[test]
    fn supervision_overtaken_by_newer_value_is_rejected() {
        let filter = NewestWinsFilter::new();
        assert!(filter.accept_value(1, 100));
        assert!(filter.accept_value(1, 120));
        assert!(!filter.accept_supervision(1, 100));
        assert_eq!(filter.last_seen(1), Some(120));
    }
}
