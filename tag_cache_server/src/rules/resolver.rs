//! Transitive process/equipment dependencies of rule tags.
//!
//! Rules form an id-indexed graph: each rule names its input tag ids, and the resolver walks that
//! graph through the tag store one tag lock at a time. No two tag locks are ever held together,
//! so two rules referencing each other cannot deadlock the resolver; the cycle is reported
//! instead.

use crate::errors::{CacheError, ConfigurationError, Result};
use crate::store::KeyedStore;
use crate::tags::structures::{DependencySets, Tag, TagKind};
use dashmap::DashMap;
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, warn};

pub struct RuleDependencyResolver {
    tags: Arc<KeyedStore<Tag>>,
    /// Input tag id -> rules reading it.
    dependents: DashMap<u64, BTreeSet<u64>>,
}

impl RuleDependencyResolver {
    pub fn new(tags: Arc<KeyedStore<Tag>>) -> Self {
        RuleDependencyResolver {
            tags,
            dependents: DashMap::new(),
        }
    }

    pub fn index_rule(&self, rule_id: u64, inputs: &BTreeSet<u64>) {
        for input in inputs {
            self.dependents.entry(*input).or_default().insert(rule_id);
        }
    }

    pub fn unindex_rule(&self, rule_id: u64) {
        self.dependents.retain(|_, rules| {
            rules.remove(&rule_id);
            !rules.is_empty()
        });
    }

    /// Rebuilds the reverse index from every rule tag in the store.
    pub fn rebuild_index(&self) {
        self.dependents.clear();
        for handle in self.tags.handles() {
            let inputs = handle.read(|tag| tag.rule_fields().map(|fields| fields.input_tag_ids.clone()));
            if let Ok(Some(inputs)) = inputs {
                self.index_rule(handle.id(), &inputs);
            }
        }
    }

    /// Rules reading `tag_id` directly.
    pub fn dependents_of(&self, tag_id: u64) -> Vec<u64> {
        self.dependents
            .get(&tag_id)
            .map(|rules| rules.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Recomputes the dependency sets of `rule_id` as the union over its inputs, resolving any
    /// input rule that was never resolved first. The result is written back into the rule.
    ///
    /// On error the rule keeps its previous sets.
    pub fn resolve(&self, rule_id: u64) -> Result<DependencySets> {
        self.check_acyclic(rule_id)?;
        let mut chain = Vec::new();
        self.resolve_in_chain(rule_id, &mut chain)
    }

    /// Resolves every rule not yet resolved. Failures are returned, not fatal.
    pub fn resolve_all(&self) -> Vec<(u64, CacheError)> {
        let mut failures = Vec::new();
        for rule_id in self.unresolved_rules() {
            // An earlier rule may have resolved this one as an input.
            let still_unresolved = self
                .tags
                .with_read(rule_id, |tag| !tag.dependencies_resolved())
                .unwrap_or(false);
            if !still_unresolved {
                continue;
            }
            if let Err(e) = self.resolve(rule_id) {
                warn!(rule_id, "Rule dependency resolution failed: {}", e);
                failures.push((rule_id, e));
            }
        }
        failures
    }

    pub fn unresolved_rules(&self) -> Vec<u64> {
        self.tags
            .handles()
            .into_iter()
            .filter(|handle| {
                handle
                    .read(|tag| tag.is_rule() && !tag.dependencies_resolved())
                    .unwrap_or(false)
            })
            .map(|handle| handle.id())
            .collect()
    }

    /// Re-resolves every rule that reads `tag_id`, directly or through other rules, after the
    /// tag's own dependency sets changed. Propagation stops at rules whose sets did not change.
    /// Returns the rules that changed.
    pub fn refresh_dependents(&self, tag_id: u64) -> Vec<u64> {
        let mut queue: VecDeque<u64> = self.dependents_of(tag_id).into();
        let mut seen = HashSet::new();
        let mut changed = Vec::new();
        while let Some(rule_id) = queue.pop_front() {
            if !seen.insert(rule_id) {
                continue;
            }
            let before = match self.tags.with_read(rule_id, |tag| tag.core.dependencies.clone()) {
                Ok(before) => before,
                Err(_) => continue,
            };
            match self.resolve(rule_id) {
                Ok(after) if after != before => {
                    changed.push(rule_id);
                    queue.extend(self.dependents_of(rule_id));
                }
                Ok(_) => {}
                Err(e) => warn!(rule_id, "Could not refresh rule dependencies: {}", e),
            }
        }
        changed
    }

    /// Structural cycle check over rule inputs, independent of resolution state.
    pub fn check_acyclic(&self, rule_id: u64) -> Result<()> {
        let mut path = Vec::new();
        let mut done = HashSet::new();
        self.visit(rule_id, &mut path, &mut done)
    }

    fn visit(&self, id: u64, path: &mut Vec<u64>, done: &mut HashSet<u64>) -> Result<()> {
        if let Some(start) = path.iter().position(|seen| *seen == id) {
            let mut chain = path[start..].to_vec();
            chain.push(id);
            return Err(ConfigurationError::CyclicRuleDependency { rule_id: id, chain }.into());
        }
        if done.contains(&id) {
            return Ok(());
        }
        let inputs = match self.rule_inputs(id) {
            Ok(Some(inputs)) => inputs,
            // Data/control tags end the walk; missing inputs are reported by `resolve`.
            Ok(None) | Err(_) => {
                done.insert(id);
                return Ok(());
            }
        };
        path.push(id);
        for input in inputs {
            self.visit(input, path, done)?;
        }
        path.pop();
        done.insert(id);
        Ok(())
    }

    fn resolve_in_chain(&self, rule_id: u64, chain: &mut Vec<u64>) -> Result<DependencySets> {
        if chain.contains(&rule_id) {
            let mut cycle = chain.clone();
            cycle.push(rule_id);
            return Err(ConfigurationError::CyclicRuleDependency {
                rule_id,
                chain: cycle,
            }
            .into());
        }
        let inputs = self
            .rule_inputs(rule_id)?
            .ok_or(ConfigurationError::NotARuleTag(rule_id))?;

        chain.push(rule_id);
        let computed = self.union_of_inputs(rule_id, &inputs, chain);
        chain.pop();
        let sets = computed?;

        self.tags.with_write(rule_id, |tag| {
            if let TagKind::Rule(fields) = &mut tag.kind {
                fields.resolved = true;
            }
            tag.core.dependencies = sets.clone();
        })?;
        debug!(
            rule_id,
            processes = ?sets.process_ids,
            equipment = ?sets.equipment_ids,
            "Rule dependencies resolved"
        );
        Ok(sets)
    }

    fn union_of_inputs(
        &self,
        rule_id: u64,
        inputs: &BTreeSet<u64>,
        chain: &mut Vec<u64>,
    ) -> Result<DependencySets> {
        let mut sets = DependencySets::default();
        for input_id in inputs {
            let handle = match self.tags.get(*input_id) {
                Ok(handle) => handle,
                Err(e) if e.is_not_found() => {
                    return Err(ConfigurationError::MissingDependency {
                        rule_id,
                        input_id: *input_id,
                    }
                    .into())
                }
                Err(e) => return Err(e),
            };
            // Lock released before any recursion.
            let (needs_resolution, direct) = handle.read(|input| {
                (
                    !input.dependencies_resolved(),
                    input.core.dependencies.clone(),
                )
            })?;
            if needs_resolution {
                let resolved = self.resolve_in_chain(*input_id, chain)?;
                sets.union_with(&resolved);
            } else {
                sets.union_with(&direct);
            }
        }
        Ok(sets)
    }

    fn rule_inputs(&self, id: u64) -> Result<Option<BTreeSet<u64>>> {
        self.tags
            .with_read(id, |tag| tag.rule_fields().map(|fields| fields.input_tag_ids.clone()))
    }
}
