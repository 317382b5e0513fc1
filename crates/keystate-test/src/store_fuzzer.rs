//! Store Fuzzer - Concurrent randomized testing for the state store
//!
//! Several threads hammer one store with a seeded mix of:
//! - compare-and-swap counter updates
//! - plain writes to shared registers
//! - nested writes into document graphs
//! - owner-scoped listen/unlisten churn
//!
//! Afterwards the store is checked against what the threads observed.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use keystate_core::{OwnerId, StateError, StateKey, StateResult, TypeTag, Value};
use keystate_store::{StateSchema, StateStore, StoreConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

/// Fuzzer configuration
#[derive(Clone, Debug)]
pub struct FuzzerConfig {
    /// Number of writer threads
    pub thread_count: usize,
    /// Number of keys of each kind (counters, registers, documents)
    pub key_count: usize,
    /// Operations per thread
    pub ops_per_thread: usize,
    /// Probability of a counter update
    pub update_prob: f64,
    /// Probability of a nested document write
    pub nested_prob: f64,
    /// Probability of a listen/unlisten step
    pub listen_prob: f64,
    /// Random seed
    pub seed: u64,
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        FuzzerConfig {
            thread_count: 4,
            key_count: 8,
            ops_per_thread: 1000,
            update_prob: 0.4,
            nested_prob: 0.2,
            listen_prob: 0.1,
            seed: 42,
        }
    }
}

impl FuzzerConfig {
    /// Light fuzzing for quick tests
    pub fn light() -> Self {
        FuzzerConfig {
            thread_count: 2,
            key_count: 4,
            ops_per_thread: 200,
            ..FuzzerConfig::default()
        }
    }

    /// Heavy fuzzing for thorough testing
    pub fn heavy() -> Self {
        FuzzerConfig {
            thread_count: 8,
            key_count: 16,
            ops_per_thread: 10_000,
            ..FuzzerConfig::default()
        }
    }

    /// Every thread fights over a single key of each kind
    pub fn contended() -> Self {
        FuzzerConfig {
            thread_count: 8,
            key_count: 1,
            ops_per_thread: 2000,
            update_prob: 0.6,
            nested_prob: 0.2,
            listen_prob: 0.05,
            seed: 7,
        }
    }
}

/// An invariant the store broke
#[derive(Clone, Debug, PartialEq)]
pub enum Violation {
    /// A counter does not equal the number of increments applied to it
    CounterDrift {
        key: String,
        expected: i64,
        actual: Option<i64>,
    },
    /// A register's listener ran a different number of times than it changed
    NotificationDrift {
        key: String,
        changes: u64,
        notifications: u64,
    },
    /// Typed and untyped reads of the same key disagree
    ViewDisagreement { key: String },
    /// A listener kept firing after its owner unlistened
    LeakedListener { owner: OwnerId },
    /// A document failed its schema
    InvalidDocument { key: String, errors: Vec<String> },
    /// An operation returned an unexpected error
    OperationFailed { op: &'static str, error: String },
}

/// Fuzzing result
#[derive(Debug, Default)]
pub struct FuzzResult {
    pub operations: u64,
    pub violations: Vec<Violation>,
}

impl FuzzResult {
    fn failed(op: &'static str, err: StateError) -> Self {
        FuzzResult {
            violations: vec![Violation::OperationFailed {
                op,
                error: err.to_string(),
            }],
            ..FuzzResult::default()
        }
    }

    pub fn is_valid(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Shape of a fuzzed document: `section.<n>` holds the last writer's index
type Document = BTreeMap<String, BTreeMap<String, i64>>;

#[derive(Default)]
struct ThreadLog {
    operations: u64,
    increments: HashMap<usize, i64>,
    changes: HashMap<usize, u64>,
    failures: Vec<Violation>,
}

/// State store fuzzer
pub struct StoreFuzzer {
    config: FuzzerConfig,
    store: StateStore,
}

impl StoreFuzzer {
    /// Create a fuzzer over a fresh store
    pub fn new(config: FuzzerConfig) -> Self {
        StoreFuzzer {
            config,
            store: StateStore::with_config(StoreConfig {
                name: "fuzz".to_string(),
                max_update_attempts: 10_000,
            }),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Typed keys of the counters bumped by `update`
    pub fn counter_keys(&self) -> StateResult<Vec<StateKey<i64>>> {
        (0..self.config.key_count.max(1))
            .map(|i| StateKey::of(format!("counter.{i}"), TypeTag::new()))
            .collect()
    }

    /// Run the fuzzer
    pub fn run(&mut self) -> FuzzResult {
        let keys = self.config.key_count.max(1);
        let counters = match self.counter_keys() {
            Ok(counters) => counters,
            Err(err) => return FuzzResult::failed("counter_keys", err),
        };
        let harness = OwnerId::next();
        let register_hits: Vec<Arc<AtomicU64>> =
            (0..keys).map(|_| Arc::new(AtomicU64::new(0))).collect();

        for (i, hits) in register_hits.iter().enumerate() {
            let hits = Arc::clone(hits);
            let listened = self.store.listen(
                &register_key(i),
                harness,
                move |_: Option<&Value>| {
                    hits.fetch_add(1, Ordering::Relaxed);
                },
            );
            if let Err(err) = listened {
                return FuzzResult::failed("listen", err);
            }
            if let Err(err) = self.store.set(&document_key(i), Value::empty_map()) {
                return FuzzResult::failed("set", err);
            }
        }

        let owners: Vec<OwnerId> = (0..self.config.thread_count).map(|_| OwnerId::next()).collect();
        let probes: Vec<Arc<AtomicU64>> = owners.iter().map(|_| Arc::new(AtomicU64::new(0))).collect();

        let logs: Vec<ThreadLog> = thread::scope(|scope| {
            let handles: Vec<_> = owners
                .iter()
                .zip(&probes)
                .enumerate()
                .map(|(t, (owner, probe))| {
                    let store = &self.store;
                    let config = &self.config;
                    let counters = counters.as_slice();
                    let probe = Arc::clone(probe);
                    let owner = *owner;
                    scope.spawn(move || run_thread(store, config, t, owner, probe, counters))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| joined_log(h.join()))
                .collect()
        });

        let mut result = FuzzResult::default();
        let mut increments: HashMap<usize, i64> = HashMap::new();
        let mut changes: HashMap<usize, u64> = HashMap::new();
        for log in logs {
            result.operations += log.operations;
            result.violations.extend(log.failures);
            for (k, n) in log.increments {
                *increments.entry(k).or_insert(0) += n;
            }
            for (k, n) in log.changes {
                *changes.entry(k).or_insert(0) += n;
            }
        }

        self.check_counters(&increments, &counters, &mut result);
        self.check_notifications(&changes, &register_hits, &mut result);
        self.check_unlisten(&owners, &probes, keys, &mut result);
        self.check_documents(keys, &mut result);

        debug!(
            operations = result.operations,
            violations = result.violations.len(),
            "fuzz run finished"
        );
        result
    }

    fn check_counters(
        &self,
        increments: &HashMap<usize, i64>,
        counters: &[StateKey<i64>],
        result: &mut FuzzResult,
    ) {
        for (i, key) in counters.iter().enumerate() {
            let expected = increments.get(&i).copied().unwrap_or(0);
            let actual = self.store.get(key).ok().flatten();
            if expected > 0 && actual != Some(expected) {
                result.violations.push(Violation::CounterDrift {
                    key: key.name().to_string(),
                    expected,
                    actual,
                });
            }

            let untyped = self.store.get(key.name()).ok().flatten();
            if untyped != actual.map(Value::Int) {
                result.violations.push(Violation::ViewDisagreement {
                    key: key.name().to_string(),
                });
            }
        }
    }

    fn check_notifications(
        &self,
        changes: &HashMap<usize, u64>,
        hits: &[Arc<AtomicU64>],
        result: &mut FuzzResult,
    ) {
        for (i, hit) in hits.iter().enumerate() {
            let expected = changes.get(&i).copied().unwrap_or(0);
            let notifications = hit.load(Ordering::Relaxed);
            if expected != notifications {
                result.violations.push(Violation::NotificationDrift {
                    key: register_key(i),
                    changes: expected,
                    notifications,
                });
            }
        }
    }

    fn check_unlisten(
        &self,
        owners: &[OwnerId],
        probes: &[Arc<AtomicU64>],
        keys: usize,
        result: &mut FuzzResult,
    ) {
        for owner in owners {
            self.store.unlisten_owner(*owner);
        }
        let before: Vec<u64> = probes.iter().map(|p| p.load(Ordering::Relaxed)).collect();

        for i in 0..keys {
            let key = register_key(i);
            if let Err(err) = self.store.set(&key, Value::from(format!("final-{i}"))) {
                result.violations.push(Violation::OperationFailed {
                    op: "set",
                    error: err.to_string(),
                });
            }
        }

        for ((owner, probe), seen) in owners.iter().zip(probes).zip(before) {
            if probe.load(Ordering::Relaxed) != seen {
                result.violations.push(Violation::LeakedListener { owner: *owner });
            }
        }
    }

    fn check_documents(&self, keys: usize, result: &mut FuzzResult) {
        for i in 0..keys {
            let schema = StateSchema::new(TypeTag::<Document>::new()).required();
            let registered = StateKey::of(document_key(i), TypeTag::new())
                .and_then(|key| self.store.register_schema(&key, schema));
            if let Err(err) = registered {
                result.violations.push(Violation::OperationFailed {
                    op: "register_schema",
                    error: err.to_string(),
                });
            }
        }

        for (key, outcome) in self.store.validate_all() {
            if !outcome.is_valid() {
                result.violations.push(Violation::InvalidDocument {
                    key,
                    errors: outcome.into_errors(),
                });
            }
        }
    }
}

/// Log of a joined worker; a panicked worker becomes a violation
fn joined_log(joined: thread::Result<ThreadLog>) -> ThreadLog {
    joined.unwrap_or_else(|_| ThreadLog {
        failures: vec![Violation::OperationFailed {
            op: "thread",
            error: "worker thread panicked".to_string(),
        }],
        ..ThreadLog::default()
    })
}

fn register_key(i: usize) -> String {
    format!("register.{i}")
}

fn document_key(i: usize) -> String {
    format!("doc.{i}")
}

fn run_thread(
    store: &StateStore,
    config: &FuzzerConfig,
    index: usize,
    owner: OwnerId,
    probe: Arc<AtomicU64>,
    counters: &[StateKey<i64>],
) -> ThreadLog {
    let keys = counters.len();
    let mut rng = StdRng::seed_from_u64(config.seed.wrapping_add(index as u64));
    let mut log = ThreadLog::default();

    for _ in 0..config.ops_per_thread {
        let k = rng.gen_range(0..keys);
        let roll: f64 = rng.gen();
        log.operations += 1;

        if roll < config.update_prob {
            match store.update(&counters[k], |v| Some(v.unwrap_or(0) + 1)) {
                Ok(_) => *log.increments.entry(k).or_insert(0) += 1,
                Err(err) => log.failures.push(Violation::OperationFailed {
                    op: "update",
                    error: err.to_string(),
                }),
            }
        } else if roll < config.update_prob + config.nested_prob {
            let field = rng.gen_range(0..4);
            let path = format!("section.{field}");
            if let Err(err) = store.set_nested(&document_key(k), &path, index as i64) {
                log.failures.push(Violation::OperationFailed {
                    op: "set_nested",
                    error: err.to_string(),
                });
            }
        } else if roll < config.update_prob + config.nested_prob + config.listen_prob {
            let key = register_key(k);
            let result = if rng.gen_bool(0.5) {
                let probe = Arc::clone(&probe);
                store.listen(&key, owner, move |_: Option<&Value>| {
                    probe.fetch_add(1, Ordering::Relaxed);
                })
            } else {
                store.unlisten(&key, owner).map(|_| ())
            };
            if let Err(err) = result {
                log.failures.push(Violation::OperationFailed {
                    op: "listen",
                    error: err.to_string(),
                });
            }
        } else {
            let value = Value::Int(rng.gen_range(0..4));
            match store.set(&register_key(k), value) {
                Ok(true) => *log.changes.entry(k).or_insert(0) += 1,
                Ok(false) => {}
                Err(err) => log.failures.push(Violation::OperationFailed {
                    op: "set",
                    error: err.to_string(),
                }),
            }
        }
    }

    log
}

/// Property-based test helpers
pub mod properties {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    use keystate_core::{assign, resolve, NestedPath, Value};
    use keystate_store::{Property, ValidationResult};

    /// Property: a value written at a path reads back unchanged
    pub fn nested_round_trip(root: &Value, path: &NestedPath, value: &Value) -> bool {
        let mut root = root.clone();
        if assign(&mut root, path, value.clone()).is_err() {
            return false;
        }
        match value {
            Value::Null => resolve(&root, path).is_none(),
            v => resolve(&root, path) == Some(v),
        }
    }

    /// Property: one notification per distinct consecutive value
    pub fn notifies_once_per_change(values: &[i64]) -> bool {
        let prop: Property<i64> = Property::empty();
        let hits = Arc::new(AtomicU64::new(0));
        let h = Arc::clone(&hits);
        prop.add_listener(move |_: Option<&i64>| {
            h.fetch_add(1, Ordering::Relaxed);
        });

        let mut expected = 0u64;
        let mut last = None;
        for v in values {
            if last != Some(*v) {
                expected += 1;
                last = Some(*v);
            }
            prop.set(Some(*v));
        }
        hits.load(Ordering::Relaxed) == expected
    }

    /// Property: every error of a nested failure names its location
    pub fn errors_prefixed(result: &ValidationResult, prefix: &str) -> bool {
        let dotted = format!("{prefix}.");
        result.errors().iter().all(|e| e.starts_with(&dotted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keystate_core::NestedPath;

    #[test]
    fn test_fuzzer_light() {
        let mut fuzzer = StoreFuzzer::new(FuzzerConfig::light());
        let result = fuzzer.run();
        assert!(result.is_valid(), "violations: {:?}", result.violations);
        assert_eq!(result.operations, 400);
    }

    #[test]
    fn test_fuzzer_contended() {
        let config = FuzzerConfig {
            ops_per_thread: 300,
            ..FuzzerConfig::contended()
        };
        let mut fuzzer = StoreFuzzer::new(config);
        let result = fuzzer.run();
        assert!(result.is_valid(), "violations: {:?}", result.violations);
    }

    #[test]
    fn test_single_thread_counts_exactly() {
        let config = FuzzerConfig {
            thread_count: 1,
            key_count: 2,
            ops_per_thread: 100,
            update_prob: 1.0,
            nested_prob: 0.0,
            listen_prob: 0.0,
            seed: 1,
        };
        let mut fuzzer = StoreFuzzer::new(config);
        let result = fuzzer.run();
        assert!(result.is_valid());

        let total: i64 = fuzzer
            .counter_keys()
            .unwrap()
            .iter()
            .map(|key| fuzzer.store().get(key).unwrap().unwrap_or(0))
            .sum();
        assert_eq!(total, 100);
    }

    #[test]
    fn test_panicked_worker_is_reported() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("worker failed");
        let log = joined_log(Err(payload));
        assert_eq!(log.operations, 0);
        assert!(matches!(
            log.failures.as_slice(),
            [Violation::OperationFailed { op: "thread", .. }]
        ));
    }

    #[test]
    fn test_properties() {
        let root = Value::map([("a", Value::list([1, 2]))]);
        let path = NestedPath::parse("a.1").unwrap();
        assert!(properties::nested_round_trip(&root, &path, &Value::from("x")));

        let path = NestedPath::parse("a.5").unwrap();
        assert!(!properties::nested_round_trip(&root, &path, &Value::from("x")));

        assert!(properties::notifies_once_per_change(&[1, 1, 2, 2, 1]));
    }
}
