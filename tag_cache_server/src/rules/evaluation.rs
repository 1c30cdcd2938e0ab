use crate::clock::{next_cache_timestamp, Clock};
use crate::errors::{ConfigurationError, Result};
use crate::store::{CacheObject, KeyedStore};
use crate::tags::quality::QualityFlag;
use crate::tags::structures::{Tag, ValueVariant};
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Computes a rule tag value from copies of its inputs. The expression language lives outside
/// the cache.
pub trait RuleEvaluator: Send + Sync {
    fn evaluate(
        &self,
        rule_id: u64,
        expression: &str,
        inputs: &BTreeMap<u64, Tag>,
    ) -> std::result::Result<ValueVariant, String>;
}

impl<F> RuleEvaluator for F
where
    F: Fn(u64, &str, &BTreeMap<u64, Tag>) -> std::result::Result<ValueVariant, String> + Send + Sync,
{
    fn evaluate(
        &self,
        rule_id: u64,
        expression: &str,
        inputs: &BTreeMap<u64, Tag>,
    ) -> std::result::Result<ValueVariant, String> {
        self(rule_id, expression, inputs)
    }
}

/// Re-evaluates one rule tag and returns a copy of it after the update.
///
/// Inputs are copied one lock at a time, the evaluator runs without any lock, and the rule's own
/// write lock is only taken to store the result.
pub fn recompute_rule(
    tags: &KeyedStore<Tag>,
    evaluator: &dyn RuleEvaluator,
    clock: &dyn Clock,
    rule_id: u64,
) -> Result<Tag> {
    let (expression, input_ids) = tags
        .with_read(rule_id, |tag| {
            tag.rule_fields()
                .map(|fields| (fields.expression.clone(), fields.input_tag_ids.clone()))
        })?
        .ok_or(ConfigurationError::NotARuleTag(rule_id))?;

    let mut inputs = BTreeMap::new();
    let mut missing = Vec::new();
    for input_id in input_ids {
        match tags.get_copy(input_id) {
            Ok(input) => {
                inputs.insert(input_id, input);
            }
            Err(e) if e.is_not_found() => missing.push(input_id),
            Err(e) => return Err(e),
        }
    }

    let outcome = if missing.is_empty() {
        Some(evaluator.evaluate(rule_id, &expression, &inputs))
    } else {
        None
    };

    tags.with_write(rule_id, |rule| {
        rule.core.quality.clear_value_flags();
        match outcome {
            None => {
                rule.core
                    .quality
                    .add(QualityFlag::UndefinedTag, format!("rule inputs {:?} are not configured", missing));
            }
            Some(Err(reason)) => {
                debug!(rule_id, "Rule evaluation failed: {}", reason);
                rule.core.quality.add(QualityFlag::Unknown, reason);
            }
            Some(Ok(value)) => match value.data_type() {
                Some(actual) if !actual.is_compatible_with(rule.core.data_type) => {
                    let expected = rule.core.data_type;
                    rule.core.quality.add(
                        QualityFlag::UnsupportedType,
                        format!("rule produced {} but tag is {}", actual, expected),
                    );
                }
                _ => rule.core.value = value,
            },
        }
        rule.core.cache_timestamp = next_cache_timestamp(clock, rule.core.cache_timestamp);
        trace!(rule_id, value = %rule.core.value, quality = %rule.core.quality, "Rule recomputed");
        rule.deep_copy()
    })
}
