//! Error hierarchy for the tag cache.
//!
//! Per-object failures are isolated: a `CacheError` returned for one Tag or Alarm never
//! affects processing of the others.

use std::fmt;
use std::time::Duration;

use crate::supervision::status::{SupervisionEntity, SupervisionStatus};

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Key absent from the store. Always recoverable, the caller decides to load or fail.
    #[error("{store} {id} not found in cache")]
    NotFound { store: &'static str, id: u64 },

    /// DAQ value updates are only accepted by data and control tags.
    #[error("Tag {id} is a {kind} tag and cannot receive DAQ updates")]
    NotUpdatable { id: u64, kind: &'static str },

    /// The locking thread re-entered an object it is already modifying.
    #[error("{store} {id} is already borrowed by the thread holding its lock")]
    LockConflict { store: &'static str, id: u64 },

    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error(transparent)]
    Loader(#[from] LoaderError),

    #[error(transparent)]
    Supervision(#[from] SupervisionError),

    #[error(transparent)]
    Alarm(#[from] AlarmError),
}

impl CacheError {
    pub fn not_found(store: &'static str, id: u64) -> Self {
        CacheError::NotFound { store, id }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound { .. })
    }
}

/// Rejects a single configuration change. Never fatal to the process.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("Cyclic rule dependency detected for rule {rule_id} (chain: {chain:?})")]
    CyclicRuleDependency { rule_id: u64, chain: Vec<u64> },

    #[error("Rule {rule_id} reads tag {input_id} which is not configured")]
    MissingDependency { rule_id: u64, input_id: u64 },

    #[error("Alarm {alarm_id} expects a {expected} value but the tag delivered {actual}")]
    TypeMismatch {
        alarm_id: u64,
        expected: String,
        actual: String,
    },

    #[error("Tag {0} is not a rule tag")]
    NotARuleTag(u64),

    #[error("Missing property '{name}' for {entity}")]
    MissingProperty { entity: &'static str, name: String },

    #[error("Invalid value '{value}' for property '{name}': {reason}")]
    InvalidProperty {
        name: String,
        value: String,
        reason: String,
    },

    #[error("Tag {tag_id} is still read by rules {rules:?}")]
    ReferencedByRules { tag_id: u64, rules: Vec<u64> },

    #[error("{entity} {id} already exists")]
    AlreadyExists { entity: &'static str, id: u64 },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum LoaderError {
    #[error("Object {id} not found in backing store")]
    NotFound { id: u64 },

    #[error("Backing store failure: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SupervisionError {
    #[error("Illegal {entity} {id} status transition {from} -> {to}")]
    InvalidTransition {
        entity: SupervisionEntity,
        id: u64,
        from: SupervisionStatus,
        to: SupervisionStatus,
    },
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AlarmError {
    #[error("Alarm {alarm_id} is attached to tag {expected} but was evaluated against tag {actual}")]
    WrongTag {
        alarm_id: u64,
        expected: u64,
        actual: u64,
    },
}

/// Returned by listener callbacks. Logged by the dispatcher, never unregisters the listener.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ListenerError {
    #[error("Listener failed: {0}")]
    Failed(String),

    #[error("Could not start dispatch thread: {0}")]
    Spawn(String),
}

/// Lock wait diagnostic. Not an error: the waiting operation keeps blocking.
#[derive(Debug, Clone)]
pub struct LockTimeoutWarning {
    pub store: &'static str,
    pub id: u64,
    pub attempts: u32,
    pub waited: Duration,
}

impl fmt::Display for LockTimeoutWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "still waiting for {} lock on id {} after {} attempts ({:?}), possible deadlock",
            self.store, self.id, self.attempts, self.waited
        )
    }
}
