use std::fs;
use std::time::Duration;
use tag_cache_server::alarms::AlarmCondition;
use tag_cache_server::config::settings::{Settings, TagConfigKind};
use tag_cache_server::listeners::DeliveryPolicy;
use tag_cache_server::supervision::{SupervisionEntity, SupervisionStatus};
use tag_cache_server::tags::structures::{ControlPurpose, DataType, TagKind};

const CONFIG: &str = r#"
status_confirmation_interval_ms = 30000

[cache]
lock_retry_interval_ms = 20

[dispatch]
worker_threads = 2

[[supervision]]
id = 1
entity = "process"
name = "P_BOILER"
status = "RUNNING"

[[supervision]]
id = 50
entity = "equipment"
name = "E_BOILER"

[[tags]]
id = 1
name = "BOILER_TEMP"
data_type = "float"
address = "ns=2;s=Temp"
max_value = 120.0
process_ids = [1]
equipment_ids = [50]

[[tags]]
id = 2
name = "BOILER_ALIVE"
kind = "control"
data_type = "int"
purpose = "alive_timer"
process_ids = [1]

[[tags]]
id = 10
name = "BOILER_TEMP_AVG"
kind = "rule"
data_type = "float"
input_tag_ids = [1]
expression = "avg"

[[alarms]]
id = 100
tag_id = 1
name = "BOILER_TEMP_HIGH"

[alarms.condition]
type = "range"
max = 100.0
active_outside = true
"#;

#[test]
fn loads_values_and_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, CONFIG).unwrap();

    let settings = Settings::load(&path).unwrap();
    assert_eq!(settings.status_confirmation_interval_ms, 30_000);
    assert_eq!(settings.cache.lock_retry_interval_ms, 20);
    assert_eq!(settings.cache.lock_warn_after_retries, 10);
    assert_eq!(settings.cache.lock_policy().retry_interval, Duration::from_millis(20));
    assert_eq!(settings.logging.directive, "info");
    assert!(matches!(
        settings.dispatch.worker_pool(),
        DeliveryPolicy::WorkerPool {
            workers: 2,
            queue_capacity: 1024
        }
    ));

    assert_eq!(settings.supervision.len(), 2);
    let process = settings.supervision[0].to_state();
    assert_eq!(process.entity, SupervisionEntity::Process);
    assert_eq!(process.status, SupervisionStatus::Running);
    // Entities start DOWN unless configured otherwise.
    assert_eq!(settings.supervision[1].to_state().status, SupervisionStatus::Down);

    assert_eq!(settings.tags.len(), 3);
    assert_eq!(settings.tags[0].kind, TagConfigKind::Data);
    let temp = settings.tags[0].to_tag();
    assert_eq!(temp.core.data_type, DataType::Float);
    assert!(temp.core.dependencies.equipment_ids.contains(&50));
    match &temp.kind {
        TagKind::Data(fields) => {
            assert_eq!(fields.address, "ns=2;s=Temp");
            assert_eq!(fields.max_value, Some(120.0));
            assert_eq!(fields.min_value, None);
        }
        other => panic!("expected a data tag, got {:?}", other),
    }
    assert!(matches!(
        settings.tags[1].to_tag().kind,
        TagKind::Control {
            purpose: ControlPurpose::AliveTimer
        }
    ));
    let rule = settings.tags[2].to_tag();
    assert!(rule.is_rule());
    assert!(!rule.dependencies_resolved());

    let alarm = settings.alarms[0].to_alarm();
    assert_eq!(alarm.tag_id, 1);
    assert_eq!(
        alarm.condition,
        AlarmCondition::Range {
            min: None,
            max: Some(100.0),
            active_outside: true
        }
    );
}

#[test]
fn saved_settings_load_back() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("config.toml");
    fs::write(&source, CONFIG).unwrap();
    let settings = Settings::load(&source).unwrap();

    let copy = dir.path().join("saved.toml");
    settings.save(&copy).unwrap();
    assert_eq!(Settings::load(&copy).unwrap(), settings);
}

#[test]
fn empty_file_gives_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, "").unwrap();

    let settings = Settings::load(&path).unwrap();
    assert_eq!(settings, Settings::default());
    assert_eq!(settings.status_confirmation_interval_ms, 60_000);
    assert!(settings.tags.is_empty());
}
