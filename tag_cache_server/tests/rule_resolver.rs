
use std::collections::BTreeSet;
use tag_cache_server::errors::{CacheError, ConfigurationError};
use tag_cache_server::listeners::{Channels, DeliveryPolicy};
use tag_cache_server::tags::quality::QualityFlag;
use tag_cache_server::tags::structures::{DependencySets, Tag, TagValueUpdate, ValueVariant};
use test_utils::{rule_tag, supervised_tag, RecordingListener, TagEngineFixture};

fn ids(values: &[u64]) -> BTreeSet<u64> {
    values.iter().copied().collect()
}

/// T1 (P1, E50), T2 (P2), T3 (sub-equipment 70), R10 = f(T1, T2), R11 = f(R10, T3).
fn rule_fixture(fixture: &TagEngineFixture) {
    let engine = &fixture.engine;
    engine.register_tag(supervised_tag(1, &[1], &[50])).unwrap();
    engine.register_tag(supervised_tag(2, &[2], &[])).unwrap();
    let mut t3 = supervised_tag(3, &[], &[]);
    t3.core.dependencies.sub_equipment_ids.insert(70);
    engine.register_tag(t3).unwrap();
    engine.create_tag(rule_tag(10, &[1, 2])).unwrap();
    engine.create_tag(rule_tag(11, &[10, 3])).unwrap();
}

#[test]
fn rule_dependencies_are_union_of_inputs() {
    let fixture = TagEngineFixture::new();
    rule_fixture(&fixture);
    let engine = &fixture.engine;

    let r10 = engine.read_tag(10).unwrap();
    assert!(r10.dependencies_resolved());
    assert_eq!(r10.core.dependencies.process_ids, ids(&[1, 2]));
    assert_eq!(r10.core.dependencies.equipment_ids, ids(&[50]));

    let r11 = engine.read_tag(11).unwrap();
    assert_eq!(
        r11.core.dependencies,
        DependencySets {
            process_ids: ids(&[1, 2]),
            equipment_ids: ids(&[50]),
            sub_equipment_ids: ids(&[70]),
        }
    );
    assert_eq!(engine.resolver().dependents_of(10), vec![11]);
    assert!(engine.resolver().unresolved_rules().is_empty());
}

#[test]
fn cyclic_update_is_rolled_back() {
    let fixture = TagEngineFixture::new();
    rule_fixture(&fixture);
    let engine = &fixture.engine;
    let before = engine.read_tag(10).unwrap();

    let err = engine
        .update_rule_definition(10, ids(&[11]), Some("loop".into()))
        .unwrap_err();
    match err {
        CacheError::Configuration(ConfigurationError::CyclicRuleDependency { chain, .. }) => {
            assert_eq!(chain.first(), chain.last());
            assert!(chain.contains(&10) && chain.contains(&11));
        }
        other => panic!("unexpected error: {}", other),
    }

    let after = engine.read_tag(10).unwrap();
    assert_eq!(after.rule_fields(), before.rule_fields());
    assert_eq!(after.core.dependencies, before.core.dependencies);
    assert_eq!(engine.resolver().dependents_of(11), Vec::<u64>::new());
    assert_eq!(engine.resolver().dependents_of(1), vec![10]);
}

#[test]
fn registered_cycle_is_reported_not_hung() {
    let fixture = TagEngineFixture::new();
    let engine = &fixture.engine;

    let first = engine.register_tag(rule_tag(20, &[21])).unwrap_err();
    assert!(matches!(
        first,
        CacheError::Configuration(ConfigurationError::MissingDependency {
            rule_id: 20,
            input_id: 21
        })
    ));

    let second = engine.register_tag(rule_tag(21, &[20])).unwrap_err();
    assert!(matches!(
        second,
        CacheError::Configuration(ConfigurationError::CyclicRuleDependency { .. })
    ));

    let mut unresolved = engine.resolver().unresolved_rules();
    unresolved.sort_unstable();
    assert_eq!(unresolved, vec![20, 21]);
    assert_eq!(engine.resolver().resolve_all().len(), 2);
}

#[test]
fn created_rule_with_missing_input_is_rolled_back() {
    let fixture = TagEngineFixture::new();
    let engine = &fixture.engine;
    engine.register_tag(supervised_tag(1, &[1], &[])).unwrap();

    let err = engine.create_tag(rule_tag(10, &[1, 404])).unwrap_err();
    assert!(matches!(
        err,
        CacheError::Configuration(ConfigurationError::MissingDependency { input_id: 404, .. })
    ));
    assert!(!engine.tag_store().contains(10));
    assert!(engine.resolver().dependents_of(1).is_empty());
}

#[test]
fn input_dependency_change_refreshes_rules_transitively() {
    let fixture = TagEngineFixture::new();
    rule_fixture(&fixture);
    let engine = &fixture.engine;

    engine
        .update_tag_dependencies(
            2,
            DependencySets {
                process_ids: ids(&[2, 5]),
                ..DependencySets::default()
            },
        )
        .unwrap();

    assert_eq!(engine.read_tag(10).unwrap().core.dependencies.process_ids, ids(&[1, 2, 5]));
    assert_eq!(engine.read_tag(11).unwrap().core.dependencies.process_ids, ids(&[1, 2, 5]));
}

#[test]
fn rule_values_follow_their_inputs() {
    let fixture = TagEngineFixture::with_sum_rules();
    rule_fixture(&fixture);
    let engine = &fixture.engine;
    let listener = RecordingListener::<Tag>::new();
    engine
        .tag_listeners()
        .register(listener.clone(), Channels::VALUE, DeliveryPolicy::Synchronous)
        .unwrap();

    // T2 has no value yet: the rule cannot be computed.
    engine
        .update_tag_value(TagValueUpdate::new(1, ValueVariant::Float(2.0)))
        .unwrap();
    let r10 = engine.read_tag(10).unwrap();
    assert!(r10.core.quality.is_set(QualityFlag::Unknown));

    engine
        .update_tag_value(TagValueUpdate::new(2, ValueVariant::Int(3)))
        .unwrap();
    engine
        .update_tag_value(TagValueUpdate::new(3, ValueVariant::Float(0.5)))
        .unwrap();

    let r10 = engine.read_tag(10).unwrap();
    assert_eq!(r10.core.value, ValueVariant::Float(5.0));
    assert!(r10.is_valid());
    let r11 = engine.read_tag(11).unwrap();
    assert_eq!(r11.core.value, ValueVariant::Float(5.5));

    let rule_updates = listener
        .values()
        .iter()
        .filter(|tag| tag.core.id == 11)
        .count();
    assert_eq!(rule_updates, 3);
}
