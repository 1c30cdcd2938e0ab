//! Runtime configuration changes: creating, updating and removing tags, alarms and supervised
//! entities while the cache is live.
//!
//! Each change is applied in isolation. A rejected change leaves the cache as it was and never
//! prevents the remaining changes of a batch from being applied.

use crate::alarms::{Alarm, AlarmCondition};
use crate::errors::{CacheError, ConfigurationError, Result};
use crate::loader::CacheLoader;
use crate::supervision::{SupervisionEntity, SupervisionStateTag, SupervisionStatus};
use crate::tags::engine::TagEngine;
use crate::tags::structures::{
    ControlPurpose, DataTagFields, DataType, DependencySets, Tag, TagCore, TagKind, ValueVariant,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeAction {
    Create,
    Update,
    Remove,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityKind {
    Tag,
    Alarm,
    Supervision,
}

impl EntityKind {
    fn as_str(self) -> &'static str {
        match self {
            EntityKind::Tag => "tag",
            EntityKind::Alarm => "alarm",
            EntityKind::Supervision => "supervision",
        }
    }
}

/// String keyed property bag of a change, with typed getters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    pub fn new() -> Self {
        Properties(BTreeMap::new())
    }

    pub fn with(mut self, name: &str, value: impl fmt::Display) -> Self {
        self.0.insert(name.to_string(), value.to_string());
        self
    }

    pub fn insert(&mut self, name: &str, value: impl fmt::Display) {
        self.0.insert(name.to_string(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0.get(name).map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    pub fn require(&self, entity: &'static str, name: &str) -> std::result::Result<&str, ConfigurationError> {
        self.get(name).ok_or_else(|| ConfigurationError::MissingProperty {
            entity,
            name: name.to_string(),
        })
    }

    /// Parses an optional property, `None` if absent.
    pub fn parse<T>(&self, name: &str) -> std::result::Result<Option<T>, ConfigurationError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        match self.get(name) {
            None => Ok(None),
            Some(text) => text
                .trim()
                .parse()
                .map(Some)
                .map_err(|e: T::Err| invalid(name, text, e.to_string())),
        }
    }

    /// Comma separated id list. An empty string is an empty set.
    pub fn ids(&self, name: &str) -> std::result::Result<Option<BTreeSet<u64>>, ConfigurationError> {
        let text = match self.get(name) {
            None => return Ok(None),
            Some(text) => text,
        };
        text.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(|part| {
                part.parse::<u64>()
                    .map_err(|e| invalid(name, text, e.to_string()))
            })
            .collect::<std::result::Result<BTreeSet<u64>, _>>()
            .map(Some)
    }

    fn data_type(&self, name: &str) -> std::result::Result<Option<DataType>, ConfigurationError> {
        match self.get(name) {
            None => Ok(None),
            Some(text) => DataType::parse(text)
                .map(Some)
                .ok_or_else(|| invalid(name, text, "unknown data type")),
        }
    }
}

fn invalid(name: &str, value: &str, reason: impl Into<String>) -> ConfigurationError {
    ConfigurationError::InvalidProperty {
        name: name.to_string(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// One requested change to the cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationChange {
    pub action: ChangeAction,
    pub entity: EntityKind,
    pub id: u64,
    #[serde(default)]
    pub properties: Properties,
}

impl ConfigurationChange {
    pub fn new(action: ChangeAction, entity: EntityKind, id: u64, properties: Properties) -> Self {
        ConfigurationChange {
            action,
            entity,
            id,
            properties,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeStatus {
    Success,
    Failure,
}

/// Outcome of one change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeReport {
    pub id: u64,
    pub entity: EntityKind,
    pub action: ChangeAction,
    pub status: ChangeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// DAQ processes that must reload their configuration because of this change.
    pub daq_processes: BTreeSet<u64>,
}

impl ChangeReport {
    pub fn is_success(&self) -> bool {
        self.status == ChangeStatus::Success
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConfigurationReport {
    pub results: Vec<ChangeReport>,
}

impl ConfigurationReport {
    pub fn is_success(&self) -> bool {
        self.results.iter().all(ChangeReport::is_success)
    }

    pub fn failures(&self) -> impl Iterator<Item = &ChangeReport> {
        self.results.iter().filter(|report| !report.is_success())
    }

    /// Union of the DAQ processes touched by successful changes.
    pub fn daq_processes(&self) -> BTreeSet<u64> {
        self.results
            .iter()
            .filter(|report| report.is_success())
            .flat_map(|report| report.daq_processes.iter().copied())
            .collect()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Applies configuration changes to a [`TagEngine`] and persists the result.
pub struct ConfigurationHandler {
    engine: TagEngine,
    tag_loader: Arc<dyn CacheLoader<Tag>>,
    alarm_loader: Arc<dyn CacheLoader<Alarm>>,
    supervision_loader: Arc<dyn CacheLoader<SupervisionStateTag>>,
}

impl ConfigurationHandler {
    pub fn new(
        engine: TagEngine,
        tag_loader: Arc<dyn CacheLoader<Tag>>,
        alarm_loader: Arc<dyn CacheLoader<Alarm>>,
        supervision_loader: Arc<dyn CacheLoader<SupervisionStateTag>>,
    ) -> Self {
        ConfigurationHandler {
            engine,
            tag_loader,
            alarm_loader,
            supervision_loader,
        }
    }

    pub fn engine(&self) -> &TagEngine {
        &self.engine
    }

    pub async fn apply(&self, change: &ConfigurationChange) -> ChangeReport {
        let result = match change.entity {
            EntityKind::Tag => self.apply_tag(change).await,
            EntityKind::Alarm => self.apply_alarm(change).await,
            EntityKind::Supervision => self.apply_supervision(change).await,
        };
        let (status, message, daq_processes) = match result {
            Ok(daq_processes) => {
                info!(
                    entity = change.entity.as_str(),
                    id = change.id,
                    action = ?change.action,
                    "Configuration change applied"
                );
                (ChangeStatus::Success, None, daq_processes)
            }
            Err(e) => {
                warn!(
                    entity = change.entity.as_str(),
                    id = change.id,
                    action = ?change.action,
                    "Configuration change rejected: {}",
                    e
                );
                (ChangeStatus::Failure, Some(e.to_string()), BTreeSet::new())
            }
        };
        ChangeReport {
            id: change.id,
            entity: change.entity,
            action: change.action,
            status,
            message,
            daq_processes,
        }
    }

    /// Applies the changes in order. A failed change does not stop the others.
    pub async fn apply_all(&self, changes: &[ConfigurationChange]) -> ConfigurationReport {
        let mut report = ConfigurationReport::default();
        for change in changes {
            report.results.push(self.apply(change).await);
        }
        report
    }

    // --- Tags ---

    async fn apply_tag(&self, change: &ConfigurationChange) -> Result<BTreeSet<u64>> {
        match change.action {
            ChangeAction::Create => {
                let tag = tag_from_properties(change.id, &change.properties)?;
                let created = self.engine.create_tag(tag)?;
                if let Err(e) = self.tag_loader.persist(&created).await {
                    undo("tag", change.id, self.engine.remove_tag(change.id).map(drop));
                    return Err(e.into());
                }
                Ok(daq_processes_of(&created))
            }
            ChangeAction::Update => {
                let previous = self.engine.read_tag(change.id)?;
                let updated = self.update_tag(change.id, &change.properties)?;
                if let Err(e) = self.tag_loader.persist(&updated).await {
                    undo("tag", change.id, self.restore_tag_definition(&previous));
                    return Err(e.into());
                }
                Ok(daq_processes_of(&updated))
            }
            ChangeAction::Remove => {
                let tag = self.engine.read_tag(change.id)?;
                let alarms: Vec<Alarm> = tag
                    .core
                    .alarm_ids
                    .iter()
                    .filter_map(|alarm_id| self.engine.read_alarm(*alarm_id).ok())
                    .collect();
                self.engine.remove_tag(change.id)?;
                if let Err(e) = self.delete_tag_and_alarms(&tag).await {
                    undo("tag", change.id, self.restore_removed_tag(tag, alarms));
                    return Err(e);
                }
                Ok(daq_processes_of(&tag))
            }
        }
    }

    async fn delete_tag_and_alarms(&self, tag: &Tag) -> Result<()> {
        for alarm_id in &tag.core.alarm_ids {
            self.alarm_loader.delete(*alarm_id).await?;
        }
        self.tag_loader.delete(tag.core.id).await?;
        Ok(())
    }

    /// Puts back the configured part of a tag: name, variant fields and dependencies.
    fn restore_tag_definition(&self, previous: &Tag) -> Result<()> {
        let tag_id = previous.core.id;
        if let TagKind::Rule(fields) = &previous.kind {
            self.engine.update_rule_definition(
                tag_id,
                fields.input_tag_ids.clone(),
                Some(fields.expression.clone()),
            )?;
        } else {
            self.engine.tag_store().with_write(tag_id, |tag| {
                tag.kind = previous.kind.clone();
            })?;
            self.engine
                .update_tag_dependencies(tag_id, previous.core.dependencies.clone())?;
        }
        self.engine
            .tag_store()
            .with_write(tag_id, |tag| tag.core.name = previous.core.name.clone())
    }

    fn restore_removed_tag(&self, tag: Tag, alarms: Vec<Alarm>) -> Result<()> {
        self.engine.register_tag(tag)?;
        for alarm in alarms {
            self.engine.register_alarm(alarm)?;
        }
        Ok(())
    }

    fn update_tag(&self, tag_id: u64, properties: &Properties) -> Result<Tag> {
        let current = self.engine.read_tag(tag_id)?;

        if let TagKind::Rule(fields) = &current.kind {
            let inputs = properties.ids("input_tag_ids")?;
            let expression = properties.get("expression").map(str::to_string);
            if inputs.is_some() || expression.is_some() {
                let inputs = inputs.unwrap_or_else(|| fields.input_tag_ids.clone());
                self.engine.update_rule_definition(tag_id, inputs, expression)?;
            }
            self.rename_tag(tag_id, properties)?;
            return self.engine.read_tag(tag_id);
        }

        // Validate everything before touching the tag.
        let address = properties.get("address").map(str::to_string);
        let min_value = properties.parse::<f64>("min_value")?;
        let max_value = properties.parse::<f64>("max_value")?;
        let process_ids = properties.ids("process_ids")?;
        let equipment_ids = properties.ids("equipment_ids")?;
        let sub_equipment_ids = properties.ids("sub_equipment_ids")?;

        self.rename_tag(tag_id, properties)?;
        self.engine.tag_store().with_write(tag_id, |tag| {
            if let TagKind::Data(fields) = &mut tag.kind {
                if let Some(address) = address {
                    fields.address = address;
                }
                if min_value.is_some() {
                    fields.min_value = min_value;
                }
                if max_value.is_some() {
                    fields.max_value = max_value;
                }
            }
        })?;

        if process_ids.is_some() || equipment_ids.is_some() || sub_equipment_ids.is_some() {
            let current = current.core.dependencies;
            let dependencies = DependencySets {
                process_ids: process_ids.unwrap_or(current.process_ids),
                equipment_ids: equipment_ids.unwrap_or(current.equipment_ids),
                sub_equipment_ids: sub_equipment_ids.unwrap_or(current.sub_equipment_ids),
            };
            return self.engine.update_tag_dependencies(tag_id, dependencies);
        }
        self.engine.read_tag(tag_id)
    }

    fn rename_tag(&self, tag_id: u64, properties: &Properties) -> Result<()> {
        if let Some(name) = properties.get("name") {
            self.engine
                .tag_store()
                .with_write(tag_id, |tag| tag.core.name = name.to_string())?;
        }
        Ok(())
    }

    // --- Alarms ---

    async fn apply_alarm(&self, change: &ConfigurationChange) -> Result<BTreeSet<u64>> {
        match change.action {
            ChangeAction::Create => {
                let properties = &change.properties;
                let tag_id = properties
                    .parse::<u64>("tag_id")?
                    .ok_or_else(|| ConfigurationError::MissingProperty {
                        entity: "alarm",
                        name: "tag_id".to_string(),
                    })?;
                if self.engine.alarms().store().contains(change.id) {
                    return Err(ConfigurationError::AlreadyExists {
                        entity: "alarm",
                        id: change.id,
                    }
                    .into());
                }
                let name = properties.get("name").unwrap_or_default().to_string();
                let alarm = Alarm::new(change.id, tag_id, name, condition_from_properties(properties)?);
                let registered = self.engine.register_alarm(alarm)?;
                if let Err(e) = self.alarm_loader.persist(&registered).await {
                    undo("alarm", change.id, self.engine.remove_alarm(change.id).map(drop));
                    return Err(e.into());
                }
                Ok(BTreeSet::new())
            }
            ChangeAction::Update => {
                let properties = &change.properties;
                let store = self.engine.alarms().store();
                let condition = if properties.contains("condition") {
                    Some(condition_from_properties(properties)?)
                } else {
                    None
                };
                let (tag_id, previous) = store.with_write(change.id, |alarm| {
                    let previous = alarm.clone();
                    if let Some(name) = properties.get("name") {
                        alarm.name = name.to_string();
                    }
                    if let Some(condition) = condition {
                        alarm.condition = condition;
                        // Re-evaluated from scratch below.
                        alarm.timestamp = 0;
                    }
                    (alarm.tag_id, previous)
                })?;
                let evaluated = self
                    .engine
                    .read_tag(tag_id)
                    .and_then(|tag| self.engine.alarms().update(change.id, &tag));
                if let Err(e) = evaluated {
                    store.with_write(change.id, |alarm| *alarm = previous)?;
                    return Err(e);
                }
                let updated = store.get_copy(change.id)?;
                if let Err(e) = self.alarm_loader.persist(&updated).await {
                    undo("alarm", change.id, store.with_write(change.id, |alarm| *alarm = previous));
                    return Err(e.into());
                }
                Ok(BTreeSet::new())
            }
            ChangeAction::Remove => {
                let alarm = self.engine.read_alarm(change.id)?;
                if !self.engine.remove_alarm(change.id)? {
                    return Err(CacheError::not_found("alarm", change.id));
                }
                if let Err(e) = self.alarm_loader.delete(change.id).await {
                    undo("alarm", change.id, self.engine.register_alarm(alarm).map(drop));
                    return Err(e.into());
                }
                Ok(BTreeSet::new())
            }
        }
    }

    // --- Supervision ---

    async fn apply_supervision(&self, change: &ConfigurationChange) -> Result<BTreeSet<u64>> {
        let properties = &change.properties;
        let entity = entity_from_properties(properties)?;
        let affected = match entity {
            SupervisionEntity::Process => BTreeSet::from([change.id]),
            _ => BTreeSet::new(),
        };
        let supervision = self.engine.supervision();
        match change.action {
            ChangeAction::Create => {
                if supervision.store(entity).contains(change.id) {
                    return Err(ConfigurationError::AlreadyExists {
                        entity: "supervision state",
                        id: change.id,
                    }
                    .into());
                }
                let name = properties.require("supervision", "name")?;
                let mut state = SupervisionStateTag::new(change.id, entity, name);
                if let Some(status) = properties.parse::<SupervisionStatus>("status")? {
                    state.status = status;
                }
                self.supervision_loader.persist(&state).await?;
                self.engine.register_supervision(state);
                Ok(affected)
            }
            ChangeAction::Update => {
                let status = properties.parse::<SupervisionStatus>("status")?;
                let previous = supervision.get(entity, change.id)?;
                if let Some(name) = properties.get("name") {
                    supervision
                        .store(entity)
                        .with_write(change.id, |state| state.name = name.to_string())?;
                }
                if let Some(status) = status {
                    let message = properties.get("message").unwrap_or("configuration update");
                    self.engine
                        .change_supervision_status(entity, change.id, status, message)?;
                }
                let state = supervision.get(entity, change.id)?;
                if let Err(e) = self.supervision_loader.persist(&state).await {
                    self.engine.register_supervision(previous);
                    return Err(e.into());
                }
                Ok(affected)
            }
            ChangeAction::Remove => {
                let state = supervision.get(entity, change.id)?;
                if !supervision.remove(entity, change.id) {
                    return Err(CacheError::not_found("supervision state", change.id));
                }
                if let Err(e) = self.supervision_loader.delete(change.id).await {
                    self.engine.register_supervision(state);
                    return Err(e.into());
                }
                Ok(affected)
            }
        }
    }
}

/// Logs a rollback that could not be completed. The original failure is what gets reported.
fn undo(entity: &'static str, id: u64, outcome: Result<()>) {
    if let Err(e) = outcome {
        error!(entity, id, "Could not roll back rejected change: {}", e);
    }
}

/// DAQ processes feeding a tag. Rule tags are computed in the cache and involve none.
fn daq_processes_of(tag: &Tag) -> BTreeSet<u64> {
    if tag.is_rule() {
        return BTreeSet::new();
    }
    tag.core.dependencies.process_ids.clone()
}

fn tag_from_properties(tag_id: u64, properties: &Properties) -> Result<Tag> {
    let name = properties.require("tag", "name")?;
    let data_type = properties
        .data_type("data_type")?
        .ok_or_else(|| ConfigurationError::MissingProperty {
            entity: "tag",
            name: "data_type".to_string(),
        })?;
    let mut core = TagCore::new(tag_id, name, data_type);
    let kind = properties.get("kind").unwrap_or("data");

    if kind == "rule" {
        let inputs = properties.ids("input_tag_ids")?.unwrap_or_default();
        let expression = properties.get("expression").unwrap_or_default();
        return Ok(Tag::rule(core, inputs, expression));
    }

    core.dependencies = DependencySets {
        process_ids: properties.ids("process_ids")?.unwrap_or_default(),
        equipment_ids: properties.ids("equipment_ids")?.unwrap_or_default(),
        sub_equipment_ids: properties.ids("sub_equipment_ids")?.unwrap_or_default(),
    };
    match kind {
        "data" => Ok(Tag::data(
            core,
            DataTagFields {
                address: properties.get("address").unwrap_or_default().to_string(),
                min_value: properties.parse("min_value")?,
                max_value: properties.parse("max_value")?,
            },
        )),
        "control" => {
            let purpose = match properties.get("purpose").unwrap_or("status") {
                "alive_timer" => ControlPurpose::AliveTimer,
                "comm_fault" => ControlPurpose::CommFault,
                "status" => ControlPurpose::Status,
                other => return Err(invalid("purpose", other, "unknown control purpose").into()),
            };
            Ok(Tag::control(core, purpose))
        }
        other => Err(invalid("kind", other, "expected data, rule or control").into()),
    }
}

fn condition_from_properties(properties: &Properties) -> Result<AlarmCondition> {
    match properties.require("alarm", "condition")? {
        "value_equals" => {
            let data_type = properties.data_type("value_type")?.unwrap_or(DataType::String);
            let text = properties.require("alarm", "value")?;
            let value = ValueVariant::parse(data_type, text)
                .ok_or_else(|| invalid("value", text, format!("not a {} value", data_type)))?;
            Ok(AlarmCondition::ValueEquals { value })
        }
        "range" => Ok(AlarmCondition::Range {
            min: properties.parse("min")?,
            max: properties.parse("max")?,
            active_outside: properties.parse("active_outside")?.unwrap_or(true),
        }),
        other => Err(invalid("condition", other, "expected value_equals or range").into()),
    }
}

fn entity_from_properties(properties: &Properties) -> Result<SupervisionEntity> {
    match properties.require("supervision", "entity")? {
        "process" => Ok(SupervisionEntity::Process),
        "equipment" => Ok(SupervisionEntity::Equipment),
        "sub_equipment" => Ok(SupervisionEntity::SubEquipment),
        other => Err(invalid("entity", other, "expected process, equipment or sub_equipment").into()),
    }
}
