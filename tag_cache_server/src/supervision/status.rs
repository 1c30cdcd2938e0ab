use crate::clock::Timestamp;
use crate::errors::SupervisionError;
use crate::store::CacheObject;
use crate::tags::quality::QualityFlag;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Status of a supervised process, equipment or sub-equipment. The wire names are the
/// SCREAMING_SNAKE_CASE variant names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupervisionStatus {
    Startup,
    RunningLocal,
    Running,
    Stopped,
    Down,
    Uncertain,
}

impl SupervisionStatus {
    pub fn is_running(self) -> bool {
        matches!(
            self,
            SupervisionStatus::Startup | SupervisionStatus::RunningLocal | SupervisionStatus::Running
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SupervisionStatus::Startup => "STARTUP",
            SupervisionStatus::RunningLocal => "RUNNING_LOCAL",
            SupervisionStatus::Running => "RUNNING",
            SupervisionStatus::Stopped => "STOPPED",
            SupervisionStatus::Down => "DOWN",
            SupervisionStatus::Uncertain => "UNCERTAIN",
        }
    }

    /// Legal moves of the supervision state machine. Staying in the same state is a refresh.
    pub fn can_transition_to(self, next: SupervisionStatus) -> bool {
        use SupervisionStatus::*;
        if self == next || next == Down {
            return true;
        }
        matches!(
            (self, next),
            (Startup, RunningLocal)
                | (RunningLocal, Running)
                | (Running, Uncertain)
                | (Uncertain, Running)
                | (Down, Startup)
                | (Stopped, Startup)
                | (Startup, Stopped)
                | (RunningLocal, Stopped)
                | (Running, Stopped)
                | (Uncertain, Stopped)
        )
    }
}

impl fmt::Display for SupervisionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SupervisionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "STARTUP" => Ok(SupervisionStatus::Startup),
            "RUNNING_LOCAL" => Ok(SupervisionStatus::RunningLocal),
            "RUNNING" => Ok(SupervisionStatus::Running),
            "STOPPED" => Ok(SupervisionStatus::Stopped),
            "DOWN" => Ok(SupervisionStatus::Down),
            "UNCERTAIN" => Ok(SupervisionStatus::Uncertain),
            other => Err(format!("unknown supervision status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SupervisionEntity {
    Process,
    Equipment,
    SubEquipment,
}

impl SupervisionEntity {
    /// Quality flag stamped on dependent tags while this kind of entity is not running.
    pub fn inaccessible_flag(self) -> QualityFlag {
        match self {
            SupervisionEntity::Process => QualityFlag::ProcessInaccessible,
            SupervisionEntity::Equipment => QualityFlag::EquipmentInaccessible,
            SupervisionEntity::SubEquipment => QualityFlag::SubequipmentInaccessible,
        }
    }
}

impl fmt::Display for SupervisionEntity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SupervisionEntity::Process => "process",
            SupervisionEntity::Equipment => "equipment",
            SupervisionEntity::SubEquipment => "sub-equipment",
        };
        f.write_str(name)
    }
}

/// Status holder of one process, equipment or sub-equipment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisionStateTag {
    pub id: u64,
    pub entity: SupervisionEntity,
    pub name: String,
    pub status: SupervisionStatus,
    pub status_time: Timestamp,
    pub status_message: String,
}

impl SupervisionStateTag {
    /// New entities start DOWN until their first connection event.
    pub fn new(id: u64, entity: SupervisionEntity, name: impl Into<String>) -> Self {
        SupervisionStateTag {
            id,
            entity,
            name: name.into(),
            status: SupervisionStatus::Down,
            status_time: 0,
            status_message: String::new(),
        }
    }

    /// Moves to `next`. Returns whether the status itself changed; a same-state call only
    /// refreshes time and message.
    pub fn transition(
        &mut self,
        next: SupervisionStatus,
        time: Timestamp,
        message: impl Into<String>,
    ) -> Result<bool, SupervisionError> {
        if !self.status.can_transition_to(next) {
            return Err(SupervisionError::InvalidTransition {
                entity: self.entity,
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        let changed = self.status != next;
        self.status = next;
        self.status_time = time;
        self.status_message = message.into();
        Ok(changed)
    }
}

impl CacheObject for SupervisionStateTag {
    fn id(&self) -> u64 {
        self.id
    }

    fn deep_copy(&self) -> Self {
        SupervisionStateTag {
            id: self.id,
            entity: self.entity,
            name: self.name.clone(),
            status: self.status,
            status_time: self.status_time,
            status_message: self.status_message.clone(),
        }
    }
}
