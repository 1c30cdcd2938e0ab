use crate::clock::Timestamp;
use crate::store::CacheObject;
use crate::tags::structures::{DataType, ValueVariant};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlarmState {
    Active,
    Terminate,
}

impl fmt::Display for AlarmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlarmState::Active => f.write_str("ACTIVE"),
            AlarmState::Terminate => f.write_str("TERMINATE"),
        }
    }
}

/// Why a condition could not be evaluated against a value.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionTypeMismatch {
    pub expected: DataType,
    pub actual: DataType,
}

/// Predicate deciding the alarm state from a tag value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AlarmCondition {
    /// ACTIVE while the value equals `value`.
    ValueEquals { value: ValueVariant },
    /// ACTIVE while the value is outside `[min, max]` (or inside, if `active_outside` is false).
    Range {
        min: Option<f64>,
        max: Option<f64>,
        active_outside: bool,
    },
}

impl AlarmCondition {
    /// Value type this condition is configured for.
    pub fn value_type(&self) -> DataType {
        match self {
            AlarmCondition::ValueEquals { value } => value.data_type().unwrap_or(DataType::String),
            AlarmCondition::Range { .. } => DataType::Float,
        }
    }

    pub fn evaluate(&self, value: &ValueVariant) -> Result<AlarmState, ConditionTypeMismatch> {
        let expected = self.value_type();
        let actual = match value.data_type() {
            Some(actual) => actual,
            None => {
                return Err(ConditionTypeMismatch {
                    expected,
                    actual: DataType::String,
                })
            }
        };
        if !expected.is_compatible_with(actual) {
            return Err(ConditionTypeMismatch { expected, actual });
        }

        let active = match self {
            AlarmCondition::ValueEquals { value: expected } => match (expected.as_f64(), value.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => expected == value,
            },
            AlarmCondition::Range {
                min,
                max,
                active_outside,
            } => {
                let numeric = value.as_f64().unwrap_or_default();
                let inside = min.map_or(true, |min| numeric >= min)
                    && max.map_or(true, |max| numeric <= max);
                inside != *active_outside
            }
        };
        Ok(if active {
            AlarmState::Active
        } else {
            AlarmState::Terminate
        })
    }
}

/// What was last sent downstream for an alarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmPublication {
    pub state: AlarmState,
    pub info: String,
    pub time: Timestamp,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub id: u64,
    pub tag_id: u64,
    pub name: String,
    pub condition: AlarmCondition,
    pub state: AlarmState,
    pub info: String,
    /// Cache timestamp of the tag event that last touched this alarm. Never wall-clock.
    pub timestamp: Timestamp,
    pub published: bool,
    pub last_publication: Option<AlarmPublication>,
}

impl Alarm {
    pub fn new(id: u64, tag_id: u64, name: impl Into<String>, condition: AlarmCondition) -> Self {
        Alarm {
            id,
            tag_id,
            name: name.into(),
            condition,
            state: AlarmState::Terminate,
            info: String::new(),
            timestamp: 0,
            published: false,
            last_publication: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == AlarmState::Active
    }

    /// Whether the current state differs from what was last published.
    pub fn needs_publication(&self) -> bool {
        match &self.last_publication {
            None => true,
            Some(last) => !self.published || last.state != self.state || last.info != self.info,
        }
    }
}

impl CacheObject for Alarm {
    fn id(&self) -> u64 {
        self.id
    }

    fn deep_copy(&self) -> Self {
        Alarm {
            id: self.id,
            tag_id: self.tag_id,
            name: self.name.clone(),
            condition: match &self.condition {
                AlarmCondition::ValueEquals { value } => AlarmCondition::ValueEquals {
                    value: value.clone(),
                },
                AlarmCondition::Range {
                    min,
                    max,
                    active_outside,
                } => AlarmCondition::Range {
                    min: *min,
                    max: *max,
                    active_outside: *active_outside,
                },
            },
            state: self.state,
            info: self.info.clone(),
            timestamp: self.timestamp,
            published: self.published,
            last_publication: self.last_publication.as_ref().map(|last| AlarmPublication {
                state: last.state,
                info: last.info.clone(),
                time: last.time,
            }),
        }
    }
}
