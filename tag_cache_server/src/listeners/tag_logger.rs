use crate::clock::Timestamp;
use crate::errors::ListenerError;
use crate::listeners::registry::CacheListener;
use crate::tags::structures::Tag;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::info;

/// Equipment id -> log target name. Built once at startup and handed to whoever logs per
/// equipment.
#[derive(Debug, Default)]
pub struct EquipmentLogTargets {
    targets: DashMap<u64, String>,
}

impl EquipmentLogTargets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, equipment_id: u64, name: impl Into<String>) {
        self.targets.insert(equipment_id, name.into());
    }

    pub fn remove(&self, equipment_id: u64) {
        self.targets.remove(&equipment_id);
    }

    /// Name for the first equipment of a tag, or `"unassigned"`.
    pub fn target_for(&self, tag: &Tag) -> String {
        tag.core
            .dependencies
            .equipment_ids
            .iter()
            .find_map(|id| self.targets.get(id).map(|name| name.clone()))
            .unwrap_or_else(|| "unassigned".to_string())
    }
}

/// Logs every tag notification with its equipment as a structured field.
pub struct TagUpdateLogger {
    targets: Arc<EquipmentLogTargets>,
    logged: AtomicU64,
}

impl TagUpdateLogger {
    pub fn new(targets: Arc<EquipmentLogTargets>) -> Self {
        TagUpdateLogger {
            targets,
            logged: AtomicU64::new(0),
        }
    }

    pub fn logged(&self) -> u64 {
        self.logged.load(Ordering::Relaxed)
    }
}

impl CacheListener<Tag> for TagUpdateLogger {
    fn on_value_updated(&self, tag: Tag) -> Result<(), ListenerError> {
        self.logged.fetch_add(1, Ordering::Relaxed);
        info!(
            equipment = %self.targets.target_for(&tag),
            tag_id = tag.core.id,
            tag = %tag.core.name,
            value = %tag.core.value,
            quality = %tag.core.quality,
            cache_timestamp = tag.core.cache_timestamp,
            "Tag value updated"
        );
        Ok(())
    }

    fn on_supervision_changed(&self, tag: Tag) -> Result<(), ListenerError> {
        self.logged.fetch_add(1, Ordering::Relaxed);
        info!(
            equipment = %self.targets.target_for(&tag),
            tag_id = tag.core.id,
            quality = %tag.core.quality,
            "Tag supervision changed"
        );
        Ok(())
    }

    fn on_status_confirmation(&self, tag: Tag, timestamp: Timestamp) -> Result<(), ListenerError> {
        tracing::trace!(tag_id = tag.core.id, timestamp, "Tag status confirmed");
        Ok(())
    }
}
