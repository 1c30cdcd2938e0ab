use crate::clock::Timestamp;
use crate::store::CacheObject;
use crate::tags::quality::TagQuality;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Possible data types for a tag's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Bool,
    Int,
    UInt,
    Float,
    String,
}

impl DataType {
    pub fn is_numeric(self) -> bool {
        matches!(self, DataType::Int | DataType::UInt | DataType::Float)
    }

    /// Numeric types compare with each other, the rest only with themselves.
    pub fn is_compatible_with(self, other: DataType) -> bool {
        self == other || (self.is_numeric() && other.is_numeric())
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Some(DataType::Bool),
            "int" | "integer" | "long" => Some(DataType::Int),
            "uint" => Some(DataType::UInt),
            "float" | "double" => Some(DataType::Float),
            "string" => Some(DataType::String),
            _ => None,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DataType::Bool => "bool",
            DataType::Int => "int",
            DataType::UInt => "uint",
            DataType::Float => "float",
            DataType::String => "string",
        };
        f.write_str(name)
    }
}

/// A tag value.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValueVariant {
    #[default]
    Null, // No value received yet
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
}

impl ValueVariant {
    pub fn data_type(&self) -> Option<DataType> {
        match self {
            ValueVariant::Null => None,
            ValueVariant::Bool(_) => Some(DataType::Bool),
            ValueVariant::Int(_) => Some(DataType::Int),
            ValueVariant::UInt(_) => Some(DataType::UInt),
            ValueVariant::Float(_) => Some(DataType::Float),
            ValueVariant::String(_) => Some(DataType::String),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ValueVariant::Null)
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ValueVariant::Int(i) => Some(*i as f64),
            ValueVariant::UInt(u) => Some(*u as f64),
            ValueVariant::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Parse `text` as a value of `data_type`.
    pub fn parse(data_type: DataType, text: &str) -> Option<Self> {
        let text = text.trim();
        match data_type {
            DataType::Bool => text.parse().ok().map(ValueVariant::Bool),
            DataType::Int => text.parse().ok().map(ValueVariant::Int),
            DataType::UInt => text.parse().ok().map(ValueVariant::UInt),
            DataType::Float => text.parse().ok().map(ValueVariant::Float),
            DataType::String => Some(ValueVariant::String(text.to_string())),
        }
    }
}

impl fmt::Display for ValueVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueVariant::Null => f.write_str("null"),
            ValueVariant::Bool(b) => write!(f, "{}", b),
            ValueVariant::Int(i) => write!(f, "{}", i),
            ValueVariant::UInt(u) => write!(f, "{}", u),
            ValueVariant::Float(v) => write!(f, "{}", v),
            ValueVariant::String(s) => f.write_str(s),
        }
    }
}

/// Process, equipment and sub-equipment ids a tag's validity depends on.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySets {
    pub process_ids: BTreeSet<u64>,
    pub equipment_ids: BTreeSet<u64>,
    pub sub_equipment_ids: BTreeSet<u64>,
}

impl DependencySets {
    pub fn is_empty(&self) -> bool {
        self.process_ids.is_empty()
            && self.equipment_ids.is_empty()
            && self.sub_equipment_ids.is_empty()
    }

    pub fn union_with(&mut self, other: &DependencySets) {
        self.process_ids.extend(other.process_ids.iter().copied());
        self.equipment_ids.extend(other.equipment_ids.iter().copied());
        self.sub_equipment_ids
            .extend(other.sub_equipment_ids.iter().copied());
    }
}

/// Fields shared by every tag variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagCore {
    pub id: u64,
    pub name: String,
    pub value: ValueVariant,
    pub value_description: String,
    pub data_type: DataType,
    pub quality: TagQuality,
    pub source_timestamp: Option<Timestamp>,
    pub daq_timestamp: Option<Timestamp>,
    /// Server time of the last value change. Strictly increasing.
    pub cache_timestamp: Timestamp,
    /// Direct for data and control tags, resolved for rule tags.
    pub dependencies: DependencySets,
    pub alarm_ids: BTreeSet<u64>,
    /// Subscribers of the live view currently interested in this tag.
    pub update_listeners: BTreeSet<u64>,
}

impl TagCore {
    pub fn new(id: u64, name: impl Into<String>, data_type: DataType) -> Self {
        TagCore {
            id,
            name: name.into(),
            value: ValueVariant::Null,
            value_description: String::new(),
            data_type,
            quality: TagQuality::uninitialised(),
            source_timestamp: None,
            daq_timestamp: None,
            cache_timestamp: 0,
            dependencies: DependencySets::default(),
            alarm_ids: BTreeSet::new(),
            update_listeners: BTreeSet::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DataTagFields {
    pub address: String,
    pub min_value: Option<f64>,
    pub max_value: Option<f64>,
}

impl DataTagFields {
    /// Describes why `value` lies outside `[min_value, max_value]`, if it does.
    pub fn out_of_bounds(&self, value: &ValueVariant) -> Option<String> {
        let numeric = value.as_f64()?;
        if let Some(min) = self.min_value {
            if numeric < min {
                return Some(format!("value {} is below minimum {}", value, min));
            }
        }
        if let Some(max) = self.max_value {
            if numeric > max {
                return Some(format!("value {} is above maximum {}", value, max));
            }
        }
        None
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuleTagFields {
    /// Sorted by id and duplicate free; the configured order is not kept. Expressions receive
    /// their inputs keyed by id, so the order carries no meaning.
    pub input_tag_ids: BTreeSet<u64>,
    pub expression: String,
    /// Set once the dependency sets have been computed from the inputs.
    pub resolved: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlPurpose {
    AliveTimer,
    CommFault,
    Status,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TagKind {
    Data(DataTagFields),
    Rule(RuleTagFields),
    Control { purpose: ControlPurpose },
}

/// A cached tag: shared quality/timestamp/listener base plus variant specific fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    pub core: TagCore,
    pub kind: TagKind,
}

impl Tag {
    pub fn data(core: TagCore, fields: DataTagFields) -> Self {
        Tag {
            core,
            kind: TagKind::Data(fields),
        }
    }

    pub fn rule(
        mut core: TagCore,
        input_tag_ids: impl IntoIterator<Item = u64>,
        expression: impl Into<String>,
    ) -> Self {
        core.dependencies = DependencySets::default();
        Tag {
            core,
            kind: TagKind::Rule(RuleTagFields {
                input_tag_ids: input_tag_ids.into_iter().collect(),
                expression: expression.into(),
                resolved: false,
            }),
        }
    }

    pub fn control(core: TagCore, purpose: ControlPurpose) -> Self {
        Tag {
            core,
            kind: TagKind::Control { purpose },
        }
    }

    pub fn id(&self) -> u64 {
        self.core.id
    }

    pub fn kind_name(&self) -> &'static str {
        match self.kind {
            TagKind::Data(_) => "data",
            TagKind::Rule(_) => "rule",
            TagKind::Control { .. } => "control",
        }
    }

    pub fn is_rule(&self) -> bool {
        matches!(self.kind, TagKind::Rule(_))
    }

    pub fn rule_fields(&self) -> Option<&RuleTagFields> {
        match &self.kind {
            TagKind::Rule(fields) => Some(fields),
            _ => None,
        }
    }

    /// `false` only for rule tags whose dependency sets were never computed.
    pub fn dependencies_resolved(&self) -> bool {
        match &self.kind {
            TagKind::Rule(fields) => fields.resolved,
            _ => true,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.core.quality.is_valid()
    }
}

impl CacheObject for Tag {
    fn id(&self) -> u64 {
        self.core.id
    }

    fn deep_copy(&self) -> Self {
        let kind = match &self.kind {
            TagKind::Data(fields) => TagKind::Data(DataTagFields {
                address: fields.address.clone(),
                min_value: fields.min_value,
                max_value: fields.max_value,
            }),
            TagKind::Rule(fields) => TagKind::Rule(RuleTagFields {
                input_tag_ids: fields.input_tag_ids.clone(),
                expression: fields.expression.clone(),
                resolved: fields.resolved,
            }),
            TagKind::Control { purpose } => TagKind::Control { purpose: *purpose },
        };
        Tag {
            core: TagCore {
                id: self.core.id,
                name: self.core.name.clone(),
                value: self.core.value.clone(),
                value_description: self.core.value_description.clone(),
                data_type: self.core.data_type,
                quality: self.core.quality.clone(),
                source_timestamp: self.core.source_timestamp,
                daq_timestamp: self.core.daq_timestamp,
                cache_timestamp: self.core.cache_timestamp,
                dependencies: self.core.dependencies.clone(),
                alarm_ids: self.core.alarm_ids.clone(),
                update_listeners: self.core.update_listeners.clone(),
            },
            kind,
        }
    }
}

/// A value reported by data acquisition for one tag.
#[derive(Debug, Clone, PartialEq)]
pub struct TagValueUpdate {
    pub tag_id: u64,
    pub value: ValueVariant,
    pub value_description: String,
    pub source_timestamp: Option<Timestamp>,
    pub daq_timestamp: Option<Timestamp>,
    /// DAQ quality code (0 = OK) and its description.
    pub daq_quality: Option<(u8, String)>,
}

impl TagValueUpdate {
    pub fn new(tag_id: u64, value: ValueVariant) -> Self {
        TagValueUpdate {
            tag_id,
            value,
            value_description: String::new(),
            source_timestamp: None,
            daq_timestamp: None,
            daq_quality: None,
        }
    }

    pub fn with_source_timestamp(mut self, timestamp: Timestamp) -> Self {
        self.source_timestamp = Some(timestamp);
        self
    }

    pub fn with_daq_quality(mut self, code: u8, description: impl Into<String>) -> Self {
        self.daq_quality = Some((code, description.into()));
        self
    }
}
