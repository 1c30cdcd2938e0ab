use crate::clock::Timestamp;
use crate::errors::{CacheError, Result, SupervisionError};
use crate::listeners::ListenerRegistry;
use crate::store::{CacheObject, KeyedStore, LockPolicy};
use crate::supervision::status::{SupervisionEntity, SupervisionStateTag, SupervisionStatus};
use crate::tags::structures::Tag;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of a supervision status change.
#[derive(Debug, Clone, PartialEq)]
pub struct SupervisionChange {
    pub state: SupervisionStateTag,
    pub status_changed: bool,
    /// Tags whose quality changed and were re-published on the supervision channel.
    pub affected_tags: Vec<u64>,
}

/// Keeps process/equipment/sub-equipment states and stamps them onto dependent tags.
///
/// Lock order: a tag write lock may be held while reading state tags, never the reverse.
pub struct SupervisionEvaluator {
    processes: KeyedStore<SupervisionStateTag>,
    equipment: KeyedStore<SupervisionStateTag>,
    sub_equipment: KeyedStore<SupervisionStateTag>,
    tags: Arc<KeyedStore<Tag>>,
    tag_listeners: Arc<ListenerRegistry<Tag>>,
    state_listeners: Arc<ListenerRegistry<SupervisionStateTag>>,
}

impl SupervisionEvaluator {
    pub fn new(
        tags: Arc<KeyedStore<Tag>>,
        tag_listeners: Arc<ListenerRegistry<Tag>>,
        state_listeners: Arc<ListenerRegistry<SupervisionStateTag>>,
        policy: LockPolicy,
    ) -> Self {
        SupervisionEvaluator {
            processes: KeyedStore::with_policy("process", policy),
            equipment: KeyedStore::with_policy("equipment", policy),
            sub_equipment: KeyedStore::with_policy("sub-equipment", policy),
            tags,
            tag_listeners,
            state_listeners,
        }
    }

    pub fn store(&self, entity: SupervisionEntity) -> &KeyedStore<SupervisionStateTag> {
        match entity {
            SupervisionEntity::Process => &self.processes,
            SupervisionEntity::Equipment => &self.equipment,
            SupervisionEntity::SubEquipment => &self.sub_equipment,
        }
    }

    pub fn state_listeners(&self) -> &Arc<ListenerRegistry<SupervisionStateTag>> {
        &self.state_listeners
    }

    /// Adds or replaces a state and re-stamps the tags already depending on it. Returns the tags
    /// whose quality changed.
    pub fn register(&self, state: SupervisionStateTag) -> Vec<u64> {
        let (entity, id) = (state.entity, state.id);
        debug!(%entity, id, status = %state.status, "Supervision state registered");
        self.store(entity).put(state);
        self.propagate(entity, id)
    }

    /// Removes a state. Tags depending on it drop the flags it caused.
    pub fn remove(&self, entity: SupervisionEntity, id: u64) -> bool {
        if !self.store(entity).remove(id) {
            return false;
        }
        let affected = self.propagate(entity, id);
        debug!(%entity, id, affected = affected.len(), "Supervision state removed");
        true
    }

    pub fn get(&self, entity: SupervisionEntity, id: u64) -> Result<SupervisionStateTag> {
        self.store(entity).get_copy(id)
    }

    pub fn status(&self, entity: SupervisionEntity, id: u64) -> Result<SupervisionStatus> {
        self.store(entity).with_read(id, |state| state.status)
    }

    /// True only for STARTUP, RUNNING_LOCAL and RUNNING.
    pub fn is_running(&self, entity: SupervisionEntity, id: u64) -> Result<bool> {
        Ok(self.status(entity, id)?.is_running())
    }

    /// Applies a status event to one entity and propagates it into the quality of every tag that
    /// depends on it. Tag cache timestamps are left untouched.
    pub fn change_status(
        &self,
        entity: SupervisionEntity,
        id: u64,
        status: SupervisionStatus,
        time: Timestamp,
        message: &str,
    ) -> Result<SupervisionChange> {
        let (state, status_changed) = self.store(entity).with_write(id, |state| {
            let changed = state.transition(status, time, message)?;
            Ok::<_, SupervisionError>((state.deep_copy(), changed))
        })??;

        if status_changed {
            info!(%entity, id, status = %status, message, "Supervision status changed");
        } else {
            debug!(%entity, id, status = %status, "Supervision status refreshed");
        }
        self.state_listeners.notify_supervision_changed(&state);

        let affected_tags = if status_changed {
            self.propagate(entity, id)
        } else {
            Vec::new()
        };

        Ok(SupervisionChange {
            state,
            status_changed,
            affected_tags,
        })
    }

    /// Stamps `status` of one `entity` onto a locked tag. Sets the entity's inaccessible flag
    /// when it is not running, clears it when running unless another dependency of the same kind
    /// is still down. Never touches `cache_timestamp`. Returns whether the quality changed.
    pub fn apply_to_tag(
        &self,
        tag: &mut Tag,
        entity: SupervisionEntity,
        status: SupervisionStatus,
        message: &str,
        time: Timestamp,
    ) -> bool {
        let flag = entity.inaccessible_flag();
        let changed = if !status.is_running() {
            tag.core
                .quality
                .add(flag, describe(entity, status, message))
        } else {
            match self.first_down(entity, ids_of(tag, entity)) {
                Some(down) => tag
                    .core
                    .quality
                    .add(flag, describe(entity, down.status, &down.status_message)),
                None => tag.core.quality.remove(flag),
            }
        };
        if changed {
            debug!(tag_id = tag.core.id, %entity, status = %status, time, "Supervision applied to tag");
        }
        changed
    }

    /// Re-derives every supervision flag of a tag from the current states. Used when a tag is
    /// loaded, created or its dependencies change.
    pub fn apply_current_supervision(&self, tag: &mut Tag) -> bool {
        let mut changed = false;
        for entity in [
            SupervisionEntity::Process,
            SupervisionEntity::Equipment,
            SupervisionEntity::SubEquipment,
        ] {
            let flag = entity.inaccessible_flag();
            changed |= match self.first_down(entity, ids_of(tag, entity)) {
                Some(down) => tag
                    .core
                    .quality
                    .add(flag, describe(entity, down.status, &down.status_message)),
                None => tag.core.quality.remove(flag),
            };
        }
        changed
    }

    /// Stamps the state of one entity onto every tag depending on it and publishes the tags whose
    /// quality changed on the supervision channel.
    ///
    /// The state is re-read under each tag's lock, so a tag pass that finishes after a newer event
    /// still leaves the tag matching the newest state. Independent tags are only looked at, never
    /// modified or copied.
    fn propagate(&self, entity: SupervisionEntity, id: u64) -> Vec<u64> {
        let mut affected = Vec::new();
        for handle in self.tags.handles() {
            if !handle.read(|tag| depends_on(tag, entity, id)).unwrap_or(false) {
                continue;
            }
            let stamped = handle.write(|tag| {
                if !depends_on(tag, entity, id) {
                    return None;
                }
                let changed = match self.store(entity).get_copy(id) {
                    Ok(state) => self.apply_to_tag(
                        tag,
                        entity,
                        state.status,
                        &state.status_message,
                        state.status_time,
                    ),
                    // Removed: whatever other entities of this kind say.
                    Err(_) => self.apply_current_supervision(tag),
                };
                changed.then(|| tag.deep_copy())
            });
            let copy = match stamped {
                Ok(Some(copy)) => copy,
                Ok(None) => continue,
                Err(e) => {
                    warn!(tag_id = handle.id(), %entity, id, "Supervision not applied: {}", e);
                    continue;
                }
            };
            self.tag_listeners.notify_supervision_changed(&copy);
            affected.push(copy.core.id);
        }
        affected
    }

    fn first_down(
        &self,
        entity: SupervisionEntity,
        ids: &BTreeSet<u64>,
    ) -> Option<SupervisionStateTag> {
        let store = self.store(entity);
        ids.iter().find_map(|id| match store.get_copy(*id) {
            Ok(state) if !state.status.is_running() => Some(state),
            Ok(_) => None,
            Err(CacheError::NotFound { .. }) => {
                warn!(%entity, id, "Tag depends on unknown supervision entity");
                None
            }
            Err(_) => None,
        })
    }
}

fn ids_of(tag: &Tag, entity: SupervisionEntity) -> &BTreeSet<u64> {
    match entity {
        SupervisionEntity::Process => &tag.core.dependencies.process_ids,
        SupervisionEntity::Equipment => &tag.core.dependencies.equipment_ids,
        SupervisionEntity::SubEquipment => &tag.core.dependencies.sub_equipment_ids,
    }
}

fn depends_on(tag: &Tag, entity: SupervisionEntity, id: u64) -> bool {
    ids_of(tag, entity).contains(&id)
}

fn describe(entity: SupervisionEntity, status: SupervisionStatus, message: &str) -> String {
    if message.is_empty() {
        format!("{} is {}", entity, status)
    } else {
        format!("{} is {}: {}", entity, status, message)
    }
}
