
use std::sync::Arc;
use std::thread;
use tag_cache_server::alarms::{Alarm, AlarmCondition, AlarmState};
use tag_cache_server::errors::{CacheError, ConfigurationError};
use tag_cache_server::listeners::{Channels, DeliveryPolicy};
use tag_cache_server::loader::{CacheLoader, InMemoryLoader};
use tag_cache_server::supervision::{SupervisionEntity, SupervisionStateTag, SupervisionStatus};
use tag_cache_server::tags::engine::TagEngine;
use tag_cache_server::tags::quality::QualityFlag;
use tag_cache_server::tags::structures::{DataType, Tag, TagValueUpdate, ValueVariant};
use test_utils::{data_tag, rule_tag, supervised_tag, RecordingListener, TagEngineFixture};

#[test]
fn test_duplicate_tag_registration() {
    let engine = TagEngine::new();
    let mut replacement = data_tag(1, DataType::Int);
    replacement.core.name = "RENAMED".to_string();

    engine.register_tag(data_tag(1, DataType::Int)).unwrap();
    engine.register_tag(replacement).unwrap(); // Should overwrite the first one

    assert_eq!(engine.read_tag(1).unwrap().core.name, "RENAMED");

    let err = engine.create_tag(data_tag(1, DataType::Int)).unwrap_err();
    assert!(matches!(
        err,
        CacheError::Configuration(ConfigurationError::AlreadyExists { entity: "tag", id: 1 })
    ));
}

#[test]
fn test_tag_value_types() {
    let engine = TagEngine::new();
    let cases = [
        (1, DataType::Bool, ValueVariant::Bool(true)),
        (2, DataType::Float, ValueVariant::Float(3.14159)),
        (3, DataType::String, ValueVariant::String("Hello World".to_string())),
        (4, DataType::UInt, ValueVariant::UInt(7)),
    ];

    for (id, data_type, value) in &cases {
        engine.register_tag(data_tag(*id, *data_type)).unwrap();
        engine
            .update_tag_value(TagValueUpdate::new(*id, value.clone()))
            .unwrap();
    }

    for (id, _, value) in &cases {
        let read = engine.read_tag(*id).unwrap();
        assert_eq!(&read.core.value, value);
        assert!(read.is_valid());
    }
}

#[test]
fn test_concurrent_access() {
    let engine = Arc::new(TagEngine::new());
    let mut handles = vec![];

    for i in 0..10 {
        engine.register_tag(data_tag(i, DataType::Int)).unwrap();
    }

    // Spawn multiple threads that read and write concurrently
    for t in 0..8u64 {
        let engine = Arc::clone(&engine);
        handles.push(thread::spawn(move || {
            for round in 0..200u64 {
                let id = (t + round) % 10;
                engine
                    .update_tag_value(TagValueUpdate::new(id, ValueVariant::Int(round as i64)))
                    .unwrap();
                let read = engine.read_tag(id).unwrap();
                assert!(read.core.cache_timestamp > 0);
            }
        }));
    }

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(engine.get_all_tag_ids().len(), 10);
    assert_eq!(engine.tag_store().lock_warnings(), 0);
}

#[test]
fn test_listener_copy_is_independent_of_cache() {
    let engine = TagEngine::new();
    let listener = RecordingListener::<Tag>::new();
    engine
        .tag_listeners()
        .register(listener.clone(), Channels::VALUE, DeliveryPolicy::Synchronous)
        .unwrap();
    engine.register_tag(data_tag(1, DataType::Int)).unwrap();

    engine
        .update_tag_value(TagValueUpdate::new(1, ValueVariant::Int(1)))
        .unwrap();
    engine
        .update_tag_value(TagValueUpdate::new(1, ValueVariant::Int(2)))
        .unwrap();

    let values = listener.values();
    assert_eq!(values.len(), 2);
    assert_eq!(values[0].core.value, ValueVariant::Int(1));
    assert_eq!(values[1].core.value, ValueVariant::Int(2));
}

#[test]
fn test_invalidate_and_confirm() {
    let fixture = TagEngineFixture::new();
    let engine = &fixture.engine;
    let listener = RecordingListener::<Tag>::new();
    engine
        .tag_listeners()
        .register(listener.clone(), Channels::ALL, DeliveryPolicy::Synchronous)
        .unwrap();

    for id in 1..=3 {
        engine.register_tag(data_tag(id, DataType::Int)).unwrap();
        engine
            .update_tag_value(TagValueUpdate::new(id, ValueVariant::Int(id as i64)))
            .unwrap();
    }
    let invalid = engine
        .invalidate(2, QualityFlag::DataUnavailable, "link down")
        .unwrap();
    assert!(!invalid.is_valid());
    assert_eq!(invalid.core.value, ValueVariant::Int(2));

    fixture.tick(60_000);
    assert_eq!(engine.confirm_all(), 2);
    let confirmations = listener.confirmations();
    assert_eq!(confirmations.len(), 2);
    assert!(confirmations.iter().all(|(tag, at)| tag.core.id != 2 && *at == 61_000));
    assert!(!engine.confirm_status(2).unwrap());
}

#[test]
fn test_remove_tag_rules_and_alarms() {
    let engine = TagEngine::new();
    engine.register_tag(data_tag(1, DataType::Float)).unwrap();
    engine.register_tag(rule_tag(10, &[1])).unwrap();
    engine
        .register_alarm(Alarm::new(
            100,
            1,
            "HIGH",
            AlarmCondition::Range {
                min: None,
                max: Some(10.0),
                active_outside: true,
            },
        ))
        .unwrap();

    let err = engine.remove_tag(1).unwrap_err();
    assert!(matches!(
        err,
        CacheError::Configuration(ConfigurationError::ReferencedByRules { tag_id: 1, .. })
    ));

    assert!(engine.remove_tag(10).unwrap());
    assert!(engine.remove_tag(1).unwrap());
    assert!(engine.read_alarm(100).unwrap_err().is_not_found());
    assert!(!engine.remove_tag(1).unwrap());
}

#[tokio::test]
async fn test_get_or_load_on_cache_miss() {
    let engine = TagEngine::new();
    let loader = InMemoryLoader::with_objects(vec![data_tag(5, DataType::Int)]);

    let loaded = engine.get_or_load(5, &loader).await.unwrap();
    assert_eq!(loaded.core.id, 5);
    assert!(engine.tag_store().contains(5));

    let err = engine.get_or_load(6, &loader).await.unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_loaded_rule_is_resolved() {
    let fixture = TagEngineFixture::new();
    let engine = &fixture.engine;
    engine.register_tag(supervised_tag(1, &[1], &[50])).unwrap();
    let loader = InMemoryLoader::with_objects(vec![rule_tag(10, &[1])]);

    let rule = futures::executor::block_on(engine.get_or_load(10, &loader)).unwrap();
    assert!(rule.dependencies_resolved());
    assert!(rule.core.dependencies.equipment_ids.contains(&50));
    assert_eq!(engine.resolver().dependents_of(1), vec![10]);
}

#[tokio::test]
async fn test_populate_from_loaders() {
    let fixture = TagEngineFixture::new();
    let engine = &fixture.engine;

    let mut running = SupervisionStateTag::new(1, SupervisionEntity::Process, "P1");
    running.status = SupervisionStatus::Running;
    let supervision = InMemoryLoader::with_objects(vec![
        running,
        SupervisionStateTag::new(2, SupervisionEntity::Process, "P2"),
    ]);
    let tags = InMemoryLoader::with_objects(vec![
        supervised_tag(1, &[1], &[]),
        supervised_tag(2, &[2], &[]),
        rule_tag(10, &[1, 2]),
        rule_tag(11, &[10]),
        rule_tag(12, &[99]),
    ]);
    let alarms = InMemoryLoader::with_objects(vec![
        Alarm::new(
            100,
            1,
            "EQ_5",
            AlarmCondition::ValueEquals {
                value: ValueVariant::Float(5.0),
            },
        ),
        Alarm::new(
            101,
            404,
            "ORPHAN",
            AlarmCondition::ValueEquals {
                value: ValueVariant::Bool(true),
            },
        ),
    ]);

    let report = engine.populate(&supervision, &tags, &alarms).await.unwrap();
    assert_eq!(report.supervision, 2);
    assert_eq!(report.tags, 5);
    assert_eq!(report.alarms, 1);
    let failed: Vec<u64> = report.failures.iter().map(|(id, _)| *id).collect();
    assert!(failed.contains(&12));
    assert!(failed.contains(&101));

    // Process 2 starts DOWN: its tag and every rule above it are stamped inaccessible.
    let tag1 = engine.read_tag(1).unwrap();
    assert!(!tag1.core.quality.is_set(QualityFlag::ProcessInaccessible));
    let tag2 = engine.read_tag(2).unwrap();
    assert!(tag2.core.quality.is_set(QualityFlag::ProcessInaccessible));
    let rule11 = engine.read_tag(11).unwrap();
    assert_eq!(
        rule11.core.dependencies.process_ids.iter().copied().collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert!(rule11.core.quality.is_set(QualityFlag::ProcessInaccessible));

    let alarm = engine.read_alarm(100).unwrap();
    assert_eq!(alarm.state, AlarmState::Terminate);
    assert!(engine.read_tag(1).unwrap().core.alarm_ids.contains(&100));

    // The loader remains the backing store.
    assert_eq!(tags.load_all().await.unwrap().len(), 5);
}
