use crate::alarms::{Alarm, AlarmCondition};
use crate::listeners::DeliveryPolicy;
use crate::store::LockPolicy;
use crate::supervision::{SupervisionEntity, SupervisionStateTag, SupervisionStatus};
use crate::tags::structures::{
    ControlPurpose, DataTagFields, DataType, DependencySets, Tag, TagCore,
};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct CacheSettings {
    #[serde(default = "default_lock_retry_interval_ms")]
    pub lock_retry_interval_ms: u64,
    /// Failed lock attempts between two deadlock warnings.
    #[serde(default = "default_lock_warn_after_retries")]
    pub lock_warn_after_retries: u32,
}

impl CacheSettings {
    pub fn lock_policy(&self) -> LockPolicy {
        LockPolicy {
            retry_interval: Duration::from_millis(self.lock_retry_interval_ms),
            warn_after_retries: self.lock_warn_after_retries,
        }
    }
}

impl Default for CacheSettings {
    fn default() -> Self {
        CacheSettings {
            lock_retry_interval_ms: default_lock_retry_interval_ms(),
            lock_warn_after_retries: default_lock_warn_after_retries(),
        }
    }
}

fn default_lock_retry_interval_ms() -> u64 {
    100
}

fn default_lock_warn_after_retries() -> u32 {
    10
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DispatchSettings {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_buffer_flush_ms")]
    pub buffer_flush_ms: u64,
    #[serde(default = "default_buffer_capacity")]
    pub buffer_capacity: usize,
}

impl DispatchSettings {
    pub fn worker_pool(&self) -> DeliveryPolicy {
        DeliveryPolicy::WorkerPool {
            workers: self.worker_threads,
            queue_capacity: self.queue_capacity,
        }
    }

    pub fn buffered(&self) -> DeliveryPolicy {
        DeliveryPolicy::Buffered {
            flush_period: Duration::from_millis(self.buffer_flush_ms),
            capacity: self.buffer_capacity,
        }
    }
}

impl Default for DispatchSettings {
    fn default() -> Self {
        DispatchSettings {
            worker_threads: default_worker_threads(),
            queue_capacity: default_queue_capacity(),
            buffer_flush_ms: default_buffer_flush_ms(),
            buffer_capacity: default_buffer_capacity(),
        }
    }
}

fn default_worker_threads() -> usize {
    4
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_buffer_flush_ms() -> u64 {
    100
}

fn default_buffer_capacity() -> usize {
    4096
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct LoggingSettings {
    /// `tracing` filter directive, overridden by `RUST_LOG`.
    #[serde(default = "default_log_directive")]
    pub directive: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        LoggingSettings {
            directive: default_log_directive(),
        }
    }
}

fn default_log_directive() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct SupervisionConfig {
    pub id: u64,
    pub entity: SupervisionEntity,
    pub name: String,
    #[serde(default)]
    pub status: Option<SupervisionStatus>, // Initial status, DOWN if absent
}

impl SupervisionConfig {
    pub fn to_state(&self) -> SupervisionStateTag {
        let mut state = SupervisionStateTag::new(self.id, self.entity, self.name.clone());
        if let Some(status) = self.status {
            state.status = status;
        }
        state
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TagConfigKind {
    #[default]
    Data,
    Rule,
    Control,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TagConfig {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub kind: TagConfigKind,
    pub data_type: DataType,
    #[serde(default)]
    pub address: String, // Driver-specific address, data tags only
    #[serde(default)]
    pub min_value: Option<f64>,
    #[serde(default)]
    pub max_value: Option<f64>,
    #[serde(default)]
    pub process_ids: Vec<u64>,
    #[serde(default)]
    pub equipment_ids: Vec<u64>,
    #[serde(default)]
    pub sub_equipment_ids: Vec<u64>,
    #[serde(default)]
    pub input_tag_ids: Vec<u64>,
    #[serde(default)]
    pub expression: String,
    #[serde(default)]
    pub purpose: Option<ControlPurpose>,
}

impl TagConfig {
    pub fn to_tag(&self) -> Tag {
        let mut core = TagCore::new(self.id, self.name.clone(), self.data_type);
        match self.kind {
            TagConfigKind::Rule => Tag::rule(core, self.input_tag_ids.iter().copied(), self.expression.clone()),
            kind => {
                core.dependencies = DependencySets {
                    process_ids: self.process_ids.iter().copied().collect(),
                    equipment_ids: self.equipment_ids.iter().copied().collect(),
                    sub_equipment_ids: self.sub_equipment_ids.iter().copied().collect(),
                };
                if kind == TagConfigKind::Control {
                    Tag::control(core, self.purpose.unwrap_or(ControlPurpose::Status))
                } else {
                    Tag::data(
                        core,
                        DataTagFields {
                            address: self.address.clone(),
                            min_value: self.min_value,
                            max_value: self.max_value,
                        },
                    )
                }
            }
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct AlarmConfig {
    pub id: u64,
    pub tag_id: u64,
    pub name: String,
    pub condition: AlarmCondition,
}

impl AlarmConfig {
    pub fn to_alarm(&self) -> Alarm {
        Alarm::new(self.id, self.tag_id, self.name.clone(), self.condition.clone())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub cache: CacheSettings,
    #[serde(default)]
    pub dispatch: DispatchSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    #[serde(default = "default_status_confirmation_interval_ms")]
    pub status_confirmation_interval_ms: u64,
    #[serde(default)]
    pub supervision: Vec<SupervisionConfig>,
    #[serde(default)] // Make tags optional in the config file
    pub tags: Vec<TagConfig>,
    #[serde(default)]
    pub alarms: Vec<AlarmConfig>,
}

fn default_status_confirmation_interval_ms() -> u64 {
    60_000
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            cache: CacheSettings::default(),
            dispatch: DispatchSettings::default(),
            logging: LoggingSettings::default(),
            status_confirmation_interval_ms: default_status_confirmation_interval_ms(),
            supervision: Vec::new(),
            tags: Vec::new(),
            alarms: Vec::new(),
        }
    }
}

impl Settings {
    /// Loads the TOML file at `config_path`, then applies `TAG_CACHE__SECTION__KEY` environment
    /// overrides.
    pub fn load(config_path: &Path) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::from(config_path))
            .add_source(
                Environment::with_prefix("TAG_CACHE")
                    .separator("__")
                    .ignore_empty(true)
                    .try_parsing(true),
            )
            .build()?;

        s.try_deserialize()
    }

    pub fn save(&self, config_path: &Path) -> io::Result<()> {
        let toml_string = toml::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        fs::write(config_path, toml_string)
    }
}
