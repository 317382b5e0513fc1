//! State store - the key/value registry
//!
//! The store maps key names to property cells. Plain string keys and typed
//! `StateKey<T>` keys with the same name resolve to the same cell, so a typed
//! writer is visible to an untyped reader and the other way round.
//!
//! Alongside the values it keeps a schema registry and the owner-scoped
//! listener registry used by `listen`/`unlisten`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, OnceLock};

use keystate_core::{
    assign, require_name, AsStateKey, NestedPath, OwnerId, StateError, StateResult, StateValue,
    Value,
};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use crate::property::{erase_listener, CasOutcome, PropertyCell};
use crate::schema::SchemaCheck;
use crate::{NestedProperty, Property, StateSchema, Subscription, ValidationResult};

static GLOBAL: OnceLock<StateStore> = OnceLock::new();

/// Store configuration
#[derive(Clone, Debug)]
pub struct StoreConfig {
    /// Label attached to log events
    pub name: String,
    /// Commit attempts before `update` gives up
    pub max_update_attempts: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig {
            name: "default".to_string(),
            max_update_attempts: 64,
        }
    }
}

impl StoreConfig {
    pub fn named(name: impl Into<String>) -> Self {
        StoreConfig {
            name: name.into(),
            ..StoreConfig::default()
        }
    }
}

/// Reactive key/value store
pub struct StateStore {
    config: StoreConfig,
    values: RwLock<HashMap<String, Arc<PropertyCell>>>,
    schemas: RwLock<HashMap<String, Arc<dyn SchemaCheck>>>,
    owners: Mutex<HashMap<(String, OwnerId), Subscription>>,
}

impl StateStore {
    pub fn new() -> Self {
        StateStore::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        StateStore {
            config,
            values: RwLock::new(HashMap::new()),
            schemas: RwLock::new(HashMap::new()),
            owners: Mutex::new(HashMap::new()),
        }
    }

    /// Process-wide store, created on first use
    pub fn global() -> &'static StateStore {
        GLOBAL.get_or_init(|| StateStore::with_config(StoreConfig::named("global")))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn name_of<K: AsStateKey + ?Sized>(key: &K) -> StateResult<&str> {
        let name = key.key_name();
        require_name(name, "state key")?;
        Ok(name)
    }

    fn existing(&self, name: &str) -> Option<Arc<PropertyCell>> {
        self.values.read().get(name).cloned()
    }

    /// Cell for `name`, created empty if absent
    fn cell(&self, name: &str) -> Arc<PropertyCell> {
        if let Some(cell) = self.existing(name) {
            return cell;
        }
        let mut values = self.values.write();
        Arc::clone(
            values
                .entry(name.to_string())
                .or_insert_with(|| Arc::new(PropertyCell::new(name, None))),
        )
    }

    fn decode<T: StateValue>(name: &str, value: Option<&Value>) -> StateResult<Option<T>> {
        match value {
            None => Ok(None),
            Some(raw) => T::from_value(raw)
                .map(Some)
                .ok_or_else(|| StateError::TypeMismatch {
                    key: name.to_string(),
                    expected: T::TYPE_NAME,
                    found: raw.type_name().to_string(),
                }),
        }
    }

    /// Write a value; returns whether it changed
    pub fn set<K: AsStateKey + ?Sized>(&self, key: &K, value: K::Value) -> StateResult<bool> {
        let name = Self::name_of(key)?;
        let changed = self.cell(name).store(Some(value.into_value()));
        trace!(store = %self.config.name, key = name, changed, "set");
        Ok(changed)
    }

    /// Clear the value (listeners see `None`)
    pub fn unset<K: AsStateKey + ?Sized>(&self, key: &K) -> StateResult<bool> {
        let name = Self::name_of(key)?;
        Ok(self.existing(name).map_or(false, |cell| cell.store(None)))
    }

    /// Read a value; a stored value of another type is a `TypeMismatch`
    pub fn get<K: AsStateKey + ?Sized>(&self, key: &K) -> StateResult<Option<K::Value>> {
        let name = Self::name_of(key)?;
        match self.existing(name) {
            Some(cell) => cell.with_value(|value| Self::decode(name, value)),
            None => Ok(None),
        }
    }

    /// Live property for the key, created empty if absent
    pub fn get_property<K: AsStateKey + ?Sized>(
        &self,
        key: &K,
    ) -> StateResult<Property<K::Value>> {
        let name = Self::name_of(key)?;
        Ok(Property::from_cell(self.cell(name)))
    }

    /// Path view over the key's value graph
    ///
    /// Like `get_property`, this registers an empty slot for an absent key
    /// so the view reads whatever is `set` later; the key then shows up in
    /// `keys` and `len`.
    pub fn get_nested_property<K: AsStateKey + ?Sized>(
        &self,
        key: &K,
    ) -> StateResult<NestedProperty> {
        let name = Self::name_of(key)?;
        Ok(NestedProperty::from_cell(self.cell(name)))
    }

    /// Write inside the key's value graph and notify the key's listeners
    ///
    /// The graph is copied, modified and committed with a compare-and-swap,
    /// so listeners see the new graph as one change.
    pub fn set_nested<K: AsStateKey + ?Sized>(
        &self,
        key: &K,
        path: &str,
        value: impl Into<Value>,
    ) -> StateResult<bool> {
        let name = Self::name_of(key)?;
        let path = NestedPath::parse(path)?;
        let value = value.into();
        let cell = self.cell(name);

        self.commit(name, &cell, |current| {
            let mut root = current.cloned().ok_or_else(|| {
                StateError::invalid_state(format!("cannot set '{path}': '{name}' has no value"))
            })?;
            assign(&mut root, &path, value.clone())?;
            Ok(Some(root))
        })
    }

    /// Read-modify-write with compare-and-swap
    ///
    /// The updater may run more than once under contention and must not
    /// have side effects.
    pub fn update<K, F>(&self, key: &K, updater: F) -> StateResult<bool>
    where
        K: AsStateKey + ?Sized,
        F: Fn(Option<K::Value>) -> Option<K::Value>,
    {
        let name = Self::name_of(key)?;
        let cell = self.cell(name);
        self.commit(name, &cell, |current| {
            let typed = Self::decode::<K::Value>(name, current)?;
            Ok(updater(typed).map(StateValue::into_value))
        })
    }

    fn commit(
        &self,
        name: &str,
        cell: &PropertyCell,
        next: impl Fn(Option<&Value>) -> StateResult<Option<Value>>,
    ) -> StateResult<bool> {
        let attempts = self.config.max_update_attempts.max(1);
        for attempt in 1..=attempts {
            let current = cell.snapshot();
            let proposed = next(current.as_ref())?;
            match cell.compare_and_store(&current, proposed) {
                CasOutcome::Changed => return Ok(true),
                CasOutcome::Unchanged => return Ok(false),
                CasOutcome::Conflict if attempt > 1 => {
                    warn!(store = %self.config.name, key = name, attempt, "update retrying after conflict");
                }
                CasOutcome::Conflict => {
                    trace!(store = %self.config.name, key = name, "update conflict");
                }
            }
        }
        Err(StateError::UpdateContention {
            key: name.to_string(),
            attempts,
        })
    }

    /// Register `listener` for `key` on behalf of `owner`
    ///
    /// An owner holds at most one listener per key; registering again
    /// replaces the earlier one.
    pub fn listen<K, F>(&self, key: &K, owner: OwnerId, listener: F) -> StateResult<()>
    where
        K: AsStateKey + ?Sized,
        F: Fn(Option<&K::Value>) + Send + Sync + 'static,
    {
        let name = Self::name_of(key)?;
        let slot = (name.to_string(), owner);

        let previous = self.owners.lock().remove(&slot);
        if let Some(previous) = previous {
            previous.unsubscribe();
        }

        let cell = self.cell(name);
        let id = cell.subscribe(erase_listener::<K::Value, F>(&cell, listener));
        let displaced = self
            .owners
            .lock()
            .insert(slot, Subscription::new(id, &cell));
        if let Some(displaced) = displaced {
            displaced.unsubscribe();
        }

        trace!(store = %self.config.name, key = name, owner = %owner, subscription = %id, "listening");
        Ok(())
    }

    /// Remove the listener `owner` registered for `key`
    pub fn unlisten<K: AsStateKey + ?Sized>(&self, key: &K, owner: OwnerId) -> StateResult<bool> {
        let name = Self::name_of(key)?;
        let removed = self.owners.lock().remove(&(name.to_string(), owner));
        Ok(removed.map_or(false, |sub| sub.unsubscribe()))
    }

    /// Remove every listener registered by `owner`; returns how many
    pub fn unlisten_owner(&self, owner: OwnerId) -> usize {
        let removed: Vec<Subscription> = {
            let mut owners = self.owners.lock();
            let keys: Vec<(String, OwnerId)> = owners
                .keys()
                .filter(|(_, o)| *o == owner)
                .cloned()
                .collect();
            keys.iter().filter_map(|k| owners.remove(k)).collect()
        };
        removed.iter().filter(|sub| sub.unsubscribe()).count()
    }

    /// Register the schema used by `validate` for `key`
    pub fn register_schema<K: AsStateKey + ?Sized>(
        &self,
        key: &K,
        schema: StateSchema<K::Value>,
    ) -> StateResult<()> {
        let name = Self::name_of(key)?;
        debug!(store = %self.config.name, key = name, schema = ?schema, "schema registered");
        self.schemas
            .write()
            .insert(name.to_string(), Arc::new(schema));
        Ok(())
    }

    fn schema(&self, name: &str) -> Option<Arc<dyn SchemaCheck>> {
        self.schemas.read().get(name).cloned()
    }

    fn run_schema(&self, name: &str, schema: &dyn SchemaCheck) -> ValidationResult {
        // Rules run on a snapshot so they may use the store themselves.
        let current = self.existing(name).and_then(|cell| cell.snapshot());
        let mut errors = Vec::new();
        schema.collect(current.as_ref(), None, &mut errors);
        ValidationResult::from_errors(errors)
    }

    /// Validate the current value against the registered schema
    ///
    /// A key without a schema yields an invalid result naming the key.
    pub fn validate<K: AsStateKey + ?Sized>(&self, key: &K) -> StateResult<ValidationResult> {
        let name = Self::name_of(key)?;
        Ok(match self.schema(name) {
            Some(schema) => self.run_schema(name, schema.as_ref()),
            None => ValidationResult::no_schema(name),
        })
    }

    /// Validate every key that has a schema
    pub fn validate_all(&self) -> BTreeMap<String, ValidationResult> {
        let schemas: Vec<(String, Arc<dyn SchemaCheck>)> = self
            .schemas
            .read()
            .iter()
            .map(|(k, s)| (k.clone(), Arc::clone(s)))
            .collect();

        schemas
            .into_iter()
            .map(|(name, schema)| {
                let result = self.run_schema(&name, schema.as_ref());
                (name, result)
            })
            .collect()
    }

    /// Validate a candidate value and write it only if it passes
    ///
    /// Without a registered schema nothing is written.
    pub fn set_validated<K: AsStateKey + ?Sized>(
        &self,
        key: &K,
        value: K::Value,
    ) -> StateResult<ValidationResult> {
        let name = Self::name_of(key)?;
        let Some(schema) = self.schema(name) else {
            return Ok(ValidationResult::no_schema(name));
        };

        let candidate = value.into_value();
        let mut errors = Vec::new();
        schema.collect(Some(&candidate), None, &mut errors);
        let result = ValidationResult::from_errors(errors);
        if result.is_valid() {
            self.cell(name).store(Some(candidate));
        } else {
            debug!(store = %self.config.name, key = name, errors = %result, "write rejected");
        }
        Ok(result)
    }

    /// Drop a key and its owner listeners; its schema stays registered
    ///
    /// Property handles obtained earlier keep working but are detached.
    pub fn remove<K: AsStateKey + ?Sized>(&self, key: &K) -> StateResult<bool> {
        let name = Self::name_of(key)?;
        let removed = self.values.write().remove(name).is_some();

        let subs: Vec<Subscription> = {
            let mut owners = self.owners.lock();
            let slots: Vec<(String, OwnerId)> = owners
                .keys()
                .filter(|(k, _)| k == name)
                .cloned()
                .collect();
            slots.iter().filter_map(|s| owners.remove(s)).collect()
        };
        for sub in &subs {
            sub.unsubscribe();
        }
        Ok(removed)
    }

    pub fn contains_key<K: AsStateKey + ?Sized>(&self, key: &K) -> bool {
        self.values.read().contains_key(key.key_name())
    }

    /// Key names in sorted order
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.values.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Keys that have a schema, in sorted order
    pub fn schema_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.schemas.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }

    /// Empty values, schemas and owner listeners
    pub fn clear(&self) {
        let subs: Vec<Subscription> = self.owners.lock().drain().map(|(_, s)| s).collect();
        for sub in &subs {
            sub.unsubscribe();
        }
        let keys = {
            let mut values = self.values.write();
            let n = values.len();
            values.clear();
            n
        };
        self.schemas.write().clear();
        debug!(store = %self.config.name, keys, listeners = subs.len(), "store cleared");
    }

    /// End the store's lifetime, releasing every registration
    pub fn shutdown(self) {
        self.clear();
        debug!(store = %self.config.name, "store shut down");
    }
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for StateStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateStore")
            .field("name", &self.config.name)
            .field("keys", &self.values.read().len())
            .field("schemas", &self.schemas.read().len())
            .field("owner_listeners", &self.owners.lock().len())
            .finish()
    }
}
