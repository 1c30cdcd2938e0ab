use crate::alarms::{Alarm, AlarmEvaluator, AlarmUpdateListener};
use crate::clock::{next_cache_timestamp, Clock, SystemClock, Timestamp};
use crate::errors::{CacheError, ConfigurationError, LoaderError, Result};
use crate::listeners::{CacheListener, Channels, DeliveryPolicy, ListenerRegistry};
use crate::loader::CacheLoader;
use crate::rules::{recompute_rule, RuleDependencyResolver, RuleEvaluator};
use crate::store::{CacheObject, KeyedStore, LockPolicy};
use crate::supervision::{
    SupervisionChange, SupervisionEntity, SupervisionEvaluator, SupervisionStateTag,
    SupervisionStatus,
};
use crate::tags::live_view::LiveTagView;
use crate::tags::quality::QualityFlag;
use crate::tags::structures::{DependencySets, Tag, TagKind, TagValueUpdate};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Construction options for a [`TagEngine`].
#[derive(Clone)]
pub struct EngineOptions {
    pub lock_policy: LockPolicy,
    pub clock: Arc<dyn Clock>,
    pub rule_evaluator: Option<Arc<dyn RuleEvaluator>>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        EngineOptions {
            lock_policy: LockPolicy::default(),
            clock: Arc::new(SystemClock),
            rule_evaluator: None,
        }
    }
}

/// Counts of a bulk population from the loaders.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct PopulateReport {
    pub supervision: usize,
    pub tags: usize,
    pub alarms: usize,
    /// Objects that could not be brought into a consistent state, with the reason.
    pub failures: Vec<(u64, String)>,
}

/// Manages the state of all tags, alarms and supervision states in the system.
///
/// Every mutation follows the same order: take the object's write lock, mutate, deep copy,
/// release, then notify. Listeners therefore never run under a cache lock.
#[derive(Clone)] // Clone provides cheap Arc clones
pub struct TagEngine {
    tags: Arc<KeyedStore<Tag>>,
    tag_listeners: Arc<ListenerRegistry<Tag>>,
    alarms: Arc<AlarmEvaluator>,
    supervision: Arc<SupervisionEvaluator>,
    resolver: Arc<RuleDependencyResolver>,
    live: Arc<LiveTagView>,
    rule_evaluator: Option<Arc<dyn RuleEvaluator>>,
    clock: Arc<dyn Clock>,
}

impl TagEngine {
    pub fn new() -> Self {
        Self::with_options(EngineOptions::default())
    }

    pub fn with_options(options: EngineOptions) -> Self {
        let tags = Arc::new(KeyedStore::with_policy("tag", options.lock_policy));
        let tag_listeners = Arc::new(ListenerRegistry::new("tag"));
        let alarms = Arc::new(AlarmEvaluator::new(
            Arc::new(KeyedStore::with_policy("alarm", options.lock_policy)),
            Arc::new(ListenerRegistry::new("alarm")),
        ));
        let supervision = Arc::new(SupervisionEvaluator::new(
            Arc::clone(&tags),
            Arc::clone(&tag_listeners),
            Arc::new(ListenerRegistry::new("supervision")),
            options.lock_policy,
        ));
        let resolver = Arc::new(RuleDependencyResolver::new(Arc::clone(&tags)));
        let live = Arc::new(LiveTagView::new(Arc::clone(&tags)));

        // Synchronous internal listeners: the live view sees every update in order and alarms
        // react to the same copy the other listeners get. Registration cannot fail for
        // synchronous delivery, no thread is started.
        for (listener, channels) in [
            (
                Arc::clone(&live) as Arc<dyn CacheListener<Tag>>,
                Channels::ALL,
            ),
            (
                Arc::new(AlarmUpdateListener::new(Arc::clone(&alarms))) as Arc<dyn CacheListener<Tag>>,
                Channels::VALUE,
            ),
        ] {
            if let Err(e) = tag_listeners.register(listener, channels, DeliveryPolicy::Synchronous) {
                warn!("Internal listener registration failed: {}", e);
            }
        }

        TagEngine {
            tags,
            tag_listeners,
            alarms,
            supervision,
            resolver,
            live,
            rule_evaluator: options.rule_evaluator,
            clock: options.clock,
        }
    }

    pub fn tag_store(&self) -> &Arc<KeyedStore<Tag>> {
        &self.tags
    }

    pub fn tag_listeners(&self) -> &Arc<ListenerRegistry<Tag>> {
        &self.tag_listeners
    }

    pub fn alarm_listeners(&self) -> &Arc<ListenerRegistry<Alarm>> {
        self.alarms.listeners()
    }

    pub fn supervision_listeners(&self) -> &Arc<ListenerRegistry<SupervisionStateTag>> {
        self.supervision.state_listeners()
    }

    pub fn alarms(&self) -> &Arc<AlarmEvaluator> {
        &self.alarms
    }

    pub fn supervision(&self) -> &Arc<SupervisionEvaluator> {
        &self.supervision
    }

    pub fn resolver(&self) -> &Arc<RuleDependencyResolver> {
        &self.resolver
    }

    pub fn live_view(&self) -> &Arc<LiveTagView> {
        &self.live
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now_millis()
    }

    // --- Tags ---

    /// Add or replace a tag definition. Supervision is stamped from the current states and rule
    /// dependencies are resolved; a resolution failure is returned but the tag stays registered,
    /// unresolved.
    pub fn register_tag(&self, mut tag: Tag) -> Result<()> {
        let tag_id = tag.id();
        let inputs = tag.rule_fields().map(|fields| fields.input_tag_ids.clone());
        self.supervision.apply_current_supervision(&mut tag);
        if self.tags.contains(tag_id) {
            self.resolver.unindex_rule(tag_id);
        }
        self.tags.put(tag);
        if let Some(inputs) = inputs {
            self.resolver.index_rule(tag_id, &inputs);
            self.resolve_rule(tag_id)?;
        }
        debug!(tag_id, "Tag registered");
        Ok(())
    }

    /// Adds a new tag. Fails if the id is taken; a rule that cannot be resolved is rolled back.
    pub fn create_tag(&self, mut tag: Tag) -> Result<Tag> {
        let tag_id = tag.id();
        let inputs = tag.rule_fields().map(|fields| fields.input_tag_ids.clone());
        self.supervision.apply_current_supervision(&mut tag);
        if !self.tags.put_if_absent(tag) {
            return Err(ConfigurationError::AlreadyExists { entity: "tag", id: tag_id }.into());
        }
        if let Some(inputs) = inputs {
            self.resolver.index_rule(tag_id, &inputs);
            if let Err(e) = self.resolve_rule(tag_id) {
                self.resolver.unindex_rule(tag_id);
                self.tags.remove(tag_id);
                return Err(e);
            }
        }
        info!(tag_id, "Tag created");
        self.tags.get_copy(tag_id)
    }

    /// Replaces the inputs and expression of a rule tag, restoring the old definition if the new
    /// one cannot be resolved.
    pub fn update_rule_definition(
        &self,
        rule_id: u64,
        inputs: BTreeSet<u64>,
        expression: Option<String>,
    ) -> Result<Tag> {
        let previous = self.tags.with_write(rule_id, |tag| {
            let previous = tag.deep_copy();
            if let TagKind::Rule(fields) = &mut tag.kind {
                fields.input_tag_ids = inputs.clone();
                if let Some(expression) = &expression {
                    fields.expression = expression.clone();
                }
                fields.resolved = false;
                Ok(previous)
            } else {
                Err(ConfigurationError::NotARuleTag(rule_id))
            }
        })??;

        self.resolver.unindex_rule(rule_id);
        self.resolver.index_rule(rule_id, &inputs);
        if let Err(e) = self.resolve_rule(rule_id) {
            warn!(rule_id, "Rule update rejected, restoring previous definition: {}", e);
            self.resolver.unindex_rule(rule_id);
            if let Some(fields) = previous.rule_fields() {
                self.resolver.index_rule(rule_id, &fields.input_tag_ids);
            }
            self.tags.with_write(rule_id, |tag| *tag = previous)?;
            return Err(e);
        }
        self.refresh_rule_dependents(rule_id);
        self.tags.get_copy(rule_id)
    }

    /// Changes the direct process/equipment dependencies of a data or control tag and refreshes
    /// every rule that reads it.
    pub fn update_tag_dependencies(&self, tag_id: u64, dependencies: DependencySets) -> Result<Tag> {
        let copy = self.tags.with_write(tag_id, |tag| {
            if tag.is_rule() {
                return Err(CacheError::NotUpdatable { id: tag_id, kind: "rule" });
            }
            tag.core.dependencies = dependencies;
            self.supervision.apply_current_supervision(tag);
            Ok(tag.deep_copy())
        })??;
        self.tag_listeners.notify_supervision_changed(&copy);
        self.refresh_rule_dependents(tag_id);
        Ok(copy)
    }

    /// Removes a tag and its alarms. Rejected while rules still read the tag.
    pub fn remove_tag(&self, tag_id: u64) -> Result<bool> {
        let readers = self.resolver.dependents_of(tag_id);
        if !readers.is_empty() {
            return Err(ConfigurationError::ReferencedByRules {
                tag_id,
                rules: readers,
            }
            .into());
        }
        let alarm_ids = match self.tags.with_read(tag_id, |tag| tag.core.alarm_ids.clone()) {
            Ok(ids) => ids,
            Err(CacheError::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        for alarm_id in alarm_ids {
            self.alarms.store().remove(alarm_id);
        }
        self.resolver.unindex_rule(tag_id);
        self.live.evict(tag_id);
        let removed = self.tags.remove(tag_id);
        if removed {
            info!(tag_id, "Tag removed");
        }
        Ok(removed)
    }

    /// Deep copy of a tag.
    pub fn read_tag(&self, tag_id: u64) -> Result<Tag> {
        self.tags.get_copy(tag_id)
    }

    /// Get a list of all registered tag ids.
    pub fn get_all_tag_ids(&self) -> Vec<u64> {
        let mut ids = self.tags.ids();
        ids.sort_unstable();
        ids
    }

    /// Copies of every tag, ordered by id.
    pub fn get_all_tags(&self) -> Vec<Tag> {
        let mut tags: Vec<Tag> = self
            .tags
            .handles()
            .into_iter()
            .filter_map(|handle| handle.snapshot().ok())
            .collect();
        tags.sort_by_key(|tag| tag.id());
        tags
    }

    /// Applies a DAQ value to a data or control tag, then notifies value listeners and
    /// re-evaluates the rules reading it.
    pub fn update_tag_value(&self, update: TagValueUpdate) -> Result<Tag> {
        let copy = self.tags.with_write(update.tag_id, |tag| {
            let bounds = match &tag.kind {
                TagKind::Rule(_) => {
                    return Err(CacheError::NotUpdatable {
                        id: update.tag_id,
                        kind: "rule",
                    })
                }
                TagKind::Data(fields) => Some(fields.clone()),
                TagKind::Control { .. } => None,
            };

            tag.core.quality.clear_value_flags();
            let daq_flag = update
                .daq_quality
                .as_ref()
                .and_then(|(code, text)| QualityFlag::from_daq_code(*code).map(|flag| (flag, text.clone())));

            if let Some((flag, text)) = daq_flag {
                tag.core.quality.add(flag, text);
            } else {
                match update.value.data_type() {
                    None => {
                        tag.core
                            .quality
                            .add(QualityFlag::DataUnavailable, "no value delivered");
                    }
                    Some(actual) if !actual.is_compatible_with(tag.core.data_type) => {
                        let expected = tag.core.data_type;
                        tag.core.quality.add(
                            QualityFlag::UnsupportedType,
                            format!("received {} for a {} tag", actual, expected),
                        );
                    }
                    Some(_) => {
                        if let Some(reason) = bounds
                            .as_ref()
                            .and_then(|fields| fields.out_of_bounds(&update.value))
                        {
                            tag.core.quality.add(QualityFlag::OutOfBounds, reason);
                        }
                        tag.core.value = update.value.clone();
                        tag.core.value_description = update.value_description.clone();
                    }
                }
            }
            if tag.core.value.is_null() {
                tag.core
                    .quality
                    .add(QualityFlag::Uninitialised, "Tag has not received a value yet");
            }
            tag.core.source_timestamp = update.source_timestamp.or(tag.core.source_timestamp);
            tag.core.daq_timestamp = update.daq_timestamp.or(tag.core.daq_timestamp);
            tag.core.cache_timestamp = next_cache_timestamp(self.clock.as_ref(), tag.core.cache_timestamp);
            Ok(tag.deep_copy())
        })??;

        self.tag_listeners.notify_value_updated(&copy);
        self.propagate_to_rules(copy.id());
        Ok(copy)
    }

    /// Marks a tag invalid on behalf of data acquisition.
    pub fn invalidate(&self, tag_id: u64, flag: QualityFlag, description: &str) -> Result<Tag> {
        let copy = self.tags.with_write(tag_id, |tag| {
            tag.core.quality.add(flag, description);
            tag.core.cache_timestamp = next_cache_timestamp(self.clock.as_ref(), tag.core.cache_timestamp);
            tag.deep_copy()
        })?;
        self.tag_listeners.notify_value_updated(&copy);
        self.propagate_to_rules(tag_id);
        Ok(copy)
    }

    /// Loads a tag from `loader` if it is not cached yet. The loader runs outside any lock.
    pub async fn get_or_load(&self, tag_id: u64, loader: &dyn CacheLoader<Tag>) -> Result<Tag> {
        match self.tags.get_copy(tag_id) {
            Err(CacheError::NotFound { .. }) => {}
            cached => return cached,
        }
        let mut loaded = loader.load_by_id(tag_id).await.map_err(|e| match e {
            LoaderError::NotFound { id } => CacheError::not_found("tag", id),
            other => CacheError::Loader(other),
        })?;
        let inputs = loaded.rule_fields().map(|fields| fields.input_tag_ids.clone());
        self.supervision.apply_current_supervision(&mut loaded);
        if self.tags.put_if_absent(loaded) {
            debug!(tag_id, "Tag loaded on cache miss");
            if let Some(inputs) = inputs {
                self.resolver.index_rule(tag_id, &inputs);
                if let Err(e) = self.resolve_rule(tag_id) {
                    warn!(tag_id, "Loaded rule left unresolved: {}", e);
                }
            }
        }
        self.tags.get_copy(tag_id)
    }

    /// Bulk population at startup. Supervision first, so tags are stamped as they come in, then
    /// tags, rule resolution and finally alarms.
    pub async fn populate(
        &self,
        supervision: &dyn CacheLoader<SupervisionStateTag>,
        tags: &dyn CacheLoader<Tag>,
        alarms: &dyn CacheLoader<Alarm>,
    ) -> Result<PopulateReport> {
        let mut report = PopulateReport::default();

        for state in supervision.load_all().await? {
            self.supervision.register(state);
            report.supervision += 1;
        }

        for mut tag in tags.load_all().await? {
            self.supervision.apply_current_supervision(&mut tag);
            self.tags.put(tag);
            report.tags += 1;
        }
        self.resolver.rebuild_index();
        for (rule_id, e) in self.resolver.resolve_all() {
            report.failures.push((rule_id, e.to_string()));
        }
        for rule_id in self.rule_ids() {
            self.restamp_supervision(rule_id);
        }

        for alarm in alarms.load_all().await? {
            let alarm_id = alarm.id;
            match self.register_alarm(alarm) {
                Ok(_) => report.alarms += 1,
                Err(e) => {
                    warn!(alarm_id, "Alarm not loaded: {}", e);
                    report.failures.push((alarm_id, e.to_string()));
                }
            }
        }

        info!(
            supervision = report.supervision,
            tags = report.tags,
            alarms = report.alarms,
            failures = report.failures.len(),
            "Cache populated"
        );
        Ok(report)
    }

    /// Sends a "still valid" confirmation for a tag. Invalid tags are skipped.
    pub fn confirm_status(&self, tag_id: u64) -> Result<bool> {
        let copy = self.tags.get_copy(tag_id)?;
        if !copy.is_valid() {
            return Ok(false);
        }
        self.tag_listeners
            .notify_status_confirmation(&copy, self.clock.now_millis());
        Ok(true)
    }

    /// Confirms every valid tag. Returns how many were confirmed.
    pub fn confirm_all(&self) -> usize {
        self.get_all_tag_ids()
            .into_iter()
            .filter(|tag_id| matches!(self.confirm_status(*tag_id), Ok(true)))
            .count()
    }

    // --- Alarms ---

    /// Attaches an alarm to its tag and evaluates it against the tag's current value.
    pub fn register_alarm(&self, alarm: Alarm) -> Result<Alarm> {
        let alarm_id = alarm.id;
        let tag_id = alarm.tag_id;
        if !self.tags.contains(tag_id) {
            return Err(CacheError::not_found("tag", tag_id));
        }
        self.alarms.store().put(alarm);
        let tag = self.tags.with_write(tag_id, |tag| {
            tag.core.alarm_ids.insert(alarm_id);
            tag.deep_copy()
        });
        let tag = match tag {
            Ok(tag) => tag,
            Err(e) => {
                self.alarms.store().remove(alarm_id);
                return Err(e);
            }
        };
        if let Err(e) = self.alarms.update(alarm_id, &tag) {
            warn!(alarm_id, "Initial alarm evaluation failed: {}", e);
        }
        self.alarms.store().get_copy(alarm_id)
    }

    pub fn remove_alarm(&self, alarm_id: u64) -> Result<bool> {
        let tag_id = match self.alarms.store().with_read(alarm_id, |alarm| alarm.tag_id) {
            Ok(tag_id) => tag_id,
            Err(CacheError::NotFound { .. }) => return Ok(false),
            Err(e) => return Err(e),
        };
        if let Err(e) = self.tags.with_write(tag_id, |tag| tag.core.alarm_ids.remove(&alarm_id)) {
            debug!(alarm_id, tag_id, "Alarm tag already gone: {}", e);
        }
        Ok(self.alarms.store().remove(alarm_id))
    }

    pub fn read_alarm(&self, alarm_id: u64) -> Result<Alarm> {
        self.alarms.store().get_copy(alarm_id)
    }

    // --- Supervision ---

    /// Adds or replaces a supervision state. Returns the tags it re-stamped.
    pub fn register_supervision(&self, state: SupervisionStateTag) -> Vec<u64> {
        self.supervision.register(state)
    }

    /// Applies a supervision event stamped with the current server time.
    pub fn change_supervision_status(
        &self,
        entity: SupervisionEntity,
        id: u64,
        status: SupervisionStatus,
        message: &str,
    ) -> Result<SupervisionChange> {
        self.supervision
            .change_status(entity, id, status, self.clock.now_millis(), message)
    }

    /// Stops every asynchronous dispatcher after draining its queue.
    pub fn shutdown(&self) {
        self.tag_listeners.shutdown();
        self.alarms.listeners().shutdown();
        self.supervision.state_listeners().shutdown();
    }

    // --- internals ---

    fn rule_ids(&self) -> Vec<u64> {
        self.tags
            .handles()
            .into_iter()
            .filter(|handle| handle.read(Tag::is_rule).unwrap_or(false))
            .map(|handle| handle.id())
            .collect()
    }

    fn resolve_rule(&self, rule_id: u64) -> Result<()> {
        self.resolver.resolve(rule_id)?;
        self.restamp_supervision(rule_id);
        Ok(())
    }

    fn refresh_rule_dependents(&self, tag_id: u64) {
        for rule_id in self.resolver.refresh_dependents(tag_id) {
            self.restamp_supervision(rule_id);
        }
    }

    /// Re-derives supervision flags of a tag after its dependency sets changed and publishes the
    /// change on the supervision channel.
    fn restamp_supervision(&self, tag_id: u64) {
        let copy = self.tags.with_write(tag_id, |tag| {
            if self.supervision.apply_current_supervision(tag) {
                Some(tag.deep_copy())
            } else {
                None
            }
        });
        if let Ok(Some(copy)) = copy {
            self.tag_listeners.notify_supervision_changed(&copy);
        }
    }

    /// Recomputes the rules reading `tag_id`, then the rules reading those, breadth first.
    fn propagate_to_rules(&self, tag_id: u64) {
        let evaluator = match &self.rule_evaluator {
            Some(evaluator) => Arc::clone(evaluator),
            None => return,
        };
        let mut queue: VecDeque<u64> = self.resolver.dependents_of(tag_id).into();
        let mut seen = HashSet::new();
        while let Some(rule_id) = queue.pop_front() {
            if !seen.insert(rule_id) {
                continue;
            }
            match recompute_rule(&self.tags, evaluator.as_ref(), self.clock.as_ref(), rule_id) {
                Ok(copy) => {
                    self.tag_listeners.notify_value_updated(&copy);
                    queue.extend(self.resolver.dependents_of(rule_id));
                }
                Err(e) => warn!(rule_id, "Rule evaluation skipped: {}", e),
            }
        }
    }
}

impl Default for TagEngine {
    fn default() -> Self {
        Self::new()
    }
}
