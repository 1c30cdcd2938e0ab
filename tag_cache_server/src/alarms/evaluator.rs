use crate::alarms::structures::{Alarm, AlarmPublication, AlarmState};
use crate::clock::Timestamp;
use crate::errors::{AlarmError, CacheError, ConfigurationError, ListenerError, Result};
use crate::listeners::{CacheListener, ListenerRegistry};
use crate::store::{CacheObject, KeyedStore};
use crate::tags::structures::Tag;
use std::sync::Arc;
use tracing::{debug, error, info, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlarmOutcome {
    /// State changed; the alarm must be (re)published.
    StateChanged,
    /// Same state as before, only the timestamp moved.
    Unchanged,
    /// The condition asked for activation but the tag is invalid. The state is kept; timestamp
    /// and published flag still move.
    Suppressed,
    /// Tag event older than the one the alarm already reflects. Nothing changed.
    Stale,
    /// Tag has no value yet. Only the timestamp moved.
    NoValue,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AlarmUpdate {
    pub outcome: AlarmOutcome,
    pub alarm: Alarm,
}

/// Derives alarm states from tag events and tracks what was published downstream.
pub struct AlarmEvaluator {
    alarms: Arc<KeyedStore<Alarm>>,
    listeners: Arc<ListenerRegistry<Alarm>>,
}

impl AlarmEvaluator {
    pub fn new(alarms: Arc<KeyedStore<Alarm>>, listeners: Arc<ListenerRegistry<Alarm>>) -> Self {
        AlarmEvaluator { alarms, listeners }
    }

    pub fn store(&self) -> &Arc<KeyedStore<Alarm>> {
        &self.alarms
    }

    pub fn listeners(&self) -> &Arc<ListenerRegistry<Alarm>> {
        &self.listeners
    }

    /// Evaluates alarm `alarm_id` against a copy of its tag.
    ///
    /// The alarm timestamp always becomes the tag's cache timestamp, so a transition can be traced
    /// back to the tag event that caused it. Listeners hear about state changes only.
    pub fn update(&self, alarm_id: u64, tag: &Tag) -> Result<AlarmUpdate> {
        let (outcome, alarm) = self.alarms.with_write(alarm_id, |alarm| {
            if alarm.tag_id != tag.id() {
                return Err(CacheError::from(AlarmError::WrongTag {
                    alarm_id,
                    expected: alarm.tag_id,
                    actual: tag.id(),
                }));
            }
            let outcome = apply_tag_event(alarm, tag)?;
            Ok((outcome, alarm.deep_copy()))
        })??;

        match outcome {
            AlarmOutcome::StateChanged => {
                info!(alarm_id, tag_id = tag.id(), state = %alarm.state, timestamp = alarm.timestamp, "Alarm state changed");
                self.listeners.notify_value_updated(&alarm);
            }
            AlarmOutcome::Suppressed => {
                debug!(alarm_id, tag_id = tag.id(), quality = %tag.core.quality, "Alarm activation suppressed, tag is invalid");
            }
            _ => trace!(alarm_id, ?outcome, "Alarm evaluated"),
        }
        Ok(AlarmUpdate { outcome, alarm })
    }

    /// Records that the current state of `alarm_id` went out downstream.
    pub fn mark_published(&self, alarm_id: u64, time: Timestamp) -> Result<Alarm> {
        self.alarms.with_write(alarm_id, |alarm| {
            alarm.published = true;
            alarm.last_publication = Some(AlarmPublication {
                state: alarm.state,
                info: alarm.info.clone(),
                time,
            });
            alarm.deep_copy()
        })
    }

    /// Alarms whose state was never published or changed since the last publication.
    pub fn unpublished(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .alarms
            .handles()
            .into_iter()
            .filter(|handle| handle.read(Alarm::needs_publication).unwrap_or(false))
            .map(|handle| handle.id())
            .collect();
        ids.sort_unstable();
        ids
    }
}

fn apply_tag_event(alarm: &mut Alarm, tag: &Tag) -> Result<AlarmOutcome> {
    let timestamp = tag.core.cache_timestamp;
    if timestamp < alarm.timestamp {
        return Ok(AlarmOutcome::Stale);
    }
    if tag.core.value.is_null() {
        alarm.timestamp = timestamp;
        return Ok(AlarmOutcome::NoValue);
    }

    let new_state = match alarm.condition.evaluate(&tag.core.value) {
        Ok(state) => state,
        Err(mismatch) => {
            let err = ConfigurationError::TypeMismatch {
                alarm_id: alarm.id,
                expected: mismatch.expected.to_string(),
                actual: mismatch.actual.to_string(),
            };
            error!(alarm_id = alarm.id, tag_id = tag.id(), "Alarm evaluation rejected: {}", err);
            return Err(err.into());
        }
    };

    alarm.timestamp = timestamp;
    if !tag.is_valid() && alarm.state == AlarmState::Terminate && new_state == AlarmState::Active {
        // State kept, but the event is acknowledged: the unchanged state goes out again with the
        // new timestamp.
        alarm.published = false;
        return Ok(AlarmOutcome::Suppressed);
    }
    if new_state == alarm.state {
        return Ok(AlarmOutcome::Unchanged);
    }
    alarm.state = new_state;
    alarm.info = match new_state {
        AlarmState::Active => tag.core.value_description.clone(),
        AlarmState::Terminate => String::new(),
    };
    alarm.published = false;
    Ok(AlarmOutcome::StateChanged)
}

/// Synchronous tag listener that re-evaluates the alarms attached to each updated tag.
pub struct AlarmUpdateListener {
    evaluator: Arc<AlarmEvaluator>,
}

impl AlarmUpdateListener {
    pub fn new(evaluator: Arc<AlarmEvaluator>) -> Self {
        AlarmUpdateListener { evaluator }
    }
}

impl CacheListener<Tag> for AlarmUpdateListener {
    fn on_value_updated(&self, tag: Tag) -> std::result::Result<(), ListenerError> {
        // One broken alarm must not stop the others.
        for alarm_id in &tag.core.alarm_ids {
            if let Err(e) = self.evaluator.update(*alarm_id, &tag) {
                error!(alarm_id, tag_id = tag.id(), "Alarm update failed: {}", e);
            }
        }
        Ok(())
    }
}
