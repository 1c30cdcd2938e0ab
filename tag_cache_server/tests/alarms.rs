
use tag_cache_server::alarms::{Alarm, AlarmCondition, AlarmOutcome, AlarmState};
use tag_cache_server::errors::{AlarmError, CacheError, ConfigurationError};
use tag_cache_server::listeners::{Channels, DeliveryPolicy};
use tag_cache_server::supervision::{SupervisionEntity, SupervisionStatus};
use tag_cache_server::tags::structures::{DataType, TagValueUpdate, ValueVariant};
use test_utils::{data_tag, supervised_tag, RecordingListener, TagEngineFixture};

fn high_limit(id: u64, tag_id: u64, max: f64) -> Alarm {
    Alarm::new(
        id,
        tag_id,
        "HIGH",
        AlarmCondition::Range {
            min: None,
            max: Some(max),
            active_outside: true,
        },
    )
}

fn equals_true(id: u64, tag_id: u64) -> Alarm {
    Alarm::new(
        id,
        tag_id,
        "TRIPPED",
        AlarmCondition::ValueEquals {
            value: ValueVariant::Bool(true),
        },
    )
}

#[test]
fn only_state_changes_are_published() {
    let fixture = TagEngineFixture::new();
    let engine = &fixture.engine;
    engine.register_tag(data_tag(1, DataType::Bool)).unwrap();
    engine.register_alarm(equals_true(100, 1)).unwrap();
    let listener = RecordingListener::<Alarm>::new();
    engine
        .alarm_listeners()
        .register(listener.clone(), Channels::VALUE, DeliveryPolicy::Synchronous)
        .unwrap();

    engine
        .update_tag_value(TagValueUpdate::new(1, ValueVariant::Bool(true)))
        .unwrap();
    assert_eq!(listener.values().len(), 1);
    assert_eq!(listener.values()[0].state, AlarmState::Active);

    let tag = engine
        .update_tag_value(TagValueUpdate::new(1, ValueVariant::Bool(true)))
        .unwrap();
    assert_eq!(listener.values().len(), 1);
    let alarm = engine.read_alarm(100).unwrap();
    assert_eq!(alarm.state, AlarmState::Active);
    assert_eq!(alarm.timestamp, tag.core.cache_timestamp);

    engine
        .update_tag_value(TagValueUpdate::new(1, ValueVariant::Bool(false)))
        .unwrap();
    let values = listener.values();
    assert_eq!(values.len(), 2);
    assert_eq!(values[1].state, AlarmState::Terminate);
}

#[test]
fn activation_on_invalid_tag_is_suppressed() {
    let fixture = TagEngineFixture::new();
    let engine = &fixture.engine;
    fixture.supervise(SupervisionEntity::Process, 1, SupervisionStatus::Down);
    engine.register_tag(supervised_tag(1, &[1], &[])).unwrap();
    engine.register_alarm(high_limit(100, 1, 10.0)).unwrap();
    engine.alarms().mark_published(100, engine.now()).unwrap();
    assert!(engine.alarms().unpublished().is_empty());

    let tag = engine
        .update_tag_value(TagValueUpdate::new(1, ValueVariant::Float(50.0)))
        .unwrap();
    assert!(!tag.is_valid());
    let alarm = engine.read_alarm(100).unwrap();
    assert_eq!(alarm.state, AlarmState::Terminate);
    assert!(!alarm.published);
    assert_eq!(alarm.timestamp, tag.core.cache_timestamp);
    assert_eq!(engine.alarms().unpublished(), vec![100]);

    engine
        .change_supervision_status(SupervisionEntity::Process, 1, SupervisionStatus::Startup, "")
        .unwrap();
    engine
        .update_tag_value(TagValueUpdate::new(1, ValueVariant::Float(60.0)))
        .unwrap();
    assert!(engine.read_alarm(100).unwrap().is_active());

    // Terminating is allowed on an invalid tag.
    engine
        .change_supervision_status(SupervisionEntity::Process, 1, SupervisionStatus::Down, "")
        .unwrap();
    engine
        .update_tag_value(TagValueUpdate::new(1, ValueVariant::Float(5.0)))
        .unwrap();
    assert_eq!(engine.read_alarm(100).unwrap().state, AlarmState::Terminate);
}

#[test]
fn mismatched_condition_type_is_a_configuration_error() {
    let fixture = TagEngineFixture::new();
    let engine = &fixture.engine;
    engine.register_tag(data_tag(1, DataType::Float)).unwrap();
    engine.register_alarm(equals_true(100, 1)).unwrap();

    // Logged and swallowed on the listener path.
    let tag = engine
        .update_tag_value(TagValueUpdate::new(1, ValueVariant::Float(1.0)))
        .unwrap();
    assert_eq!(engine.read_alarm(100).unwrap().state, AlarmState::Terminate);

    let err = engine.alarms().update(100, &tag).unwrap_err();
    match err {
        CacheError::Configuration(ConfigurationError::TypeMismatch {
            alarm_id,
            expected,
            actual,
        }) => {
            assert_eq!(alarm_id, 100);
            assert_eq!(expected, "bool");
            assert_eq!(actual, "float");
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn stale_and_foreign_tag_events_are_ignored() {
    let fixture = TagEngineFixture::new();
    let engine = &fixture.engine;
    engine.register_tag(data_tag(1, DataType::Float)).unwrap();
    engine.register_tag(data_tag(2, DataType::Float)).unwrap();
    engine.register_alarm(high_limit(100, 1, 10.0)).unwrap();

    let old = engine
        .update_tag_value(TagValueUpdate::new(1, ValueVariant::Float(50.0)))
        .unwrap();
    engine
        .update_tag_value(TagValueUpdate::new(1, ValueVariant::Float(1.0)))
        .unwrap();
    assert!(!engine.read_alarm(100).unwrap().is_active());

    let update = engine.alarms().update(100, &old).unwrap();
    assert_eq!(update.outcome, AlarmOutcome::Stale);
    assert_eq!(update.alarm.state, AlarmState::Terminate);

    let foreign = engine.read_tag(2).unwrap();
    let err = engine.alarms().update(100, &foreign).unwrap_err();
    assert!(matches!(
        err,
        CacheError::Alarm(AlarmError::WrongTag {
            expected: 1,
            actual: 2,
            ..
        })
    ));
}

#[test]
fn publication_tracking() {
    let fixture = TagEngineFixture::new();
    let engine = &fixture.engine;
    engine.register_tag(data_tag(1, DataType::Float)).unwrap();
    engine.register_alarm(high_limit(100, 1, 10.0)).unwrap();
    engine.register_alarm(high_limit(101, 1, 100.0)).unwrap();
    assert_eq!(engine.alarms().unpublished(), vec![100, 101]);

    let now = engine.now();
    for id in engine.alarms().unpublished() {
        engine.alarms().mark_published(id, now).unwrap();
    }
    assert!(engine.alarms().unpublished().is_empty());

    engine
        .update_tag_value(TagValueUpdate::new(1, ValueVariant::Float(20.0)))
        .unwrap();
    assert_eq!(engine.alarms().unpublished(), vec![100]);

    let published = engine.alarms().mark_published(100, engine.now()).unwrap();
    assert!(published.published);
    assert_eq!(
        published.last_publication.map(|p| p.state),
        Some(AlarmState::Active)
    );
}

#[test]
fn alarm_removal_detaches_from_tag() {
    let engine = TagEngineFixture::new().engine;
    engine.register_tag(data_tag(1, DataType::Float)).unwrap();
    engine.register_alarm(high_limit(100, 1, 10.0)).unwrap();
    assert!(engine.read_tag(1).unwrap().core.alarm_ids.contains(&100));

    assert!(engine.remove_alarm(100).unwrap());
    assert!(!engine.read_tag(1).unwrap().core.alarm_ids.contains(&100));
    assert!(!engine.remove_alarm(100).unwrap());

    let err = engine.register_alarm(high_limit(101, 9, 1.0)).unwrap_err();
    assert!(err.is_not_found());
}
