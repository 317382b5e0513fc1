//! Observable properties
//!
//! A `Property<T>` is a handle onto a shared cell holding one optional
//! value and an ordered listener list. Every clone of the handle, and every
//! typed or untyped view the store hands out for the same key, shares the
//! cell, so a write through one is seen by all.
//!
//! # Invariants
//!
//! 1. Setting a value equal to the current one is a no-op: nothing is
//!    stored and no listener runs.
//! 2. Listeners run in registration order, on the writer's thread, after
//!    the value lock has been released.
//! 3. A panicking listener is logged and counted; the remaining listeners
//!    still run and the panic never escapes `set`.
//! 4. A new listener is immediately replayed the current value, if any.
//!    A write racing the registration reaches it either through the
//!    replay or through notification, never both.

use std::any::Any;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use keystate_core::{StateError, StateResult, StateValue, SubscriptionId, Value};
use parking_lot::{Mutex, RwLock};
use tracing::{error, trace, warn};

/// Type-erased listener stored in a cell
pub(crate) type Listener = Arc<dyn Fn(Option<&Value>) + Send + Sync>;

const ANONYMOUS: &str = "<anonymous>";

/// Outcome of a conditional write
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum CasOutcome {
    /// The cell no longer held the expected value
    Conflict,
    /// The new value equals the current one
    Unchanged,
    /// The value was replaced and listeners notified
    Changed,
}

/// Shared storage behind every property handle
pub(crate) struct PropertyCell {
    label: Arc<str>,
    value: RwLock<Option<Value>>,
    listeners: Mutex<Vec<(SubscriptionId, Listener)>>,
    failures: Arc<AtomicU64>,
}

impl PropertyCell {
    pub(crate) fn new(label: &str, initial: Option<Value>) -> Self {
        PropertyCell {
            label: Arc::from(label),
            value: RwLock::new(initial.and_then(Value::into_option)),
            listeners: Mutex::new(Vec::new()),
            failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub(crate) fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn snapshot(&self) -> Option<Value> {
        self.value.read().clone()
    }

    /// Read the current value without cloning it
    pub(crate) fn with_value<R>(&self, f: impl FnOnce(Option<&Value>) -> R) -> R {
        f(self.value.read().as_ref())
    }

    /// Store a value, notifying listeners if it changed
    pub(crate) fn store(&self, value: Option<Value>) -> bool {
        let value = value.and_then(Value::into_option);
        let listeners = {
            let mut current = self.value.write();
            if *current == value {
                return false;
            }
            *current = value.clone();
            self.listeners.lock().clone()
        };
        trace!(key = %self.label, "value changed");
        self.deliver(&listeners, value.as_ref());
        true
    }

    /// Store `value` only if the cell still holds `expected`
    pub(crate) fn compare_and_store(
        &self,
        expected: &Option<Value>,
        value: Option<Value>,
    ) -> CasOutcome {
        let value = value.and_then(Value::into_option);
        let listeners = {
            let mut current = self.value.write();
            if *current != *expected {
                return CasOutcome::Conflict;
            }
            if *current == value {
                return CasOutcome::Unchanged;
            }
            *current = value.clone();
            self.listeners.lock().clone()
        };
        trace!(key = %self.label, "value changed by update");
        self.deliver(&listeners, value.as_ref());
        CasOutcome::Changed
    }

    /// Mutate the stored value in place without notifying
    pub(crate) fn mutate<R>(
        &self,
        f: impl FnOnce(&mut Value) -> StateResult<R>,
    ) -> StateResult<R> {
        let mut current = self.value.write();
        match current.as_mut() {
            Some(value) => f(value),
            None => Err(StateError::invalid_state(format!(
                "'{}' holds no value to write into",
                self.label
            ))),
        }
    }

    pub(crate) fn subscribe(&self, listener: Listener) -> SubscriptionId {
        let id = SubscriptionId::next();
        // Lock order is value, then listeners. A writer either published
        // before this read (replay delivers it) or sees the new listener.
        let current = {
            let value = self.value.read();
            self.listeners.lock().push((id, Arc::clone(&listener)));
            value.clone()
        };
        if let Some(value) = current {
            self.invoke(id, &listener, Some(&value));
        }
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|(sid, _)| *sid != id);
        listeners.len() != before
    }

    pub(crate) fn clear_listeners(&self) {
        self.listeners.lock().clear();
    }

    pub(crate) fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    pub(crate) fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub(crate) fn failure_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.failures)
    }

    pub(crate) fn label_arc(&self) -> Arc<str> {
        Arc::clone(&self.label)
    }

    /// Run the listeners captured with a write against its value
    fn deliver(&self, listeners: &[(SubscriptionId, Listener)], value: Option<&Value>) {
        trace!(key = %self.label, listeners = listeners.len(), "notifying");
        for (id, listener) in listeners {
            self.invoke(*id, listener, value);
        }
    }

    pub(crate) fn invoke(&self, id: SubscriptionId, listener: &Listener, value: Option<&Value>) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(|| listener(value))) {
            self.failures.fetch_add(1, Ordering::Relaxed);
            error!(
                key = %self.label,
                subscription = %id,
                panic = %panic_message(payload.as_ref()),
                "listener panicked"
            );
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "non-string panic payload"
    }
}

/// Wrap a typed listener so it can sit in an untyped cell
pub(crate) fn erase_listener<T, F>(cell: &PropertyCell, listener: F) -> Listener
where
    T: StateValue,
    F: Fn(Option<&T>) + Send + Sync + 'static,
{
    let failures = cell.failure_counter();
    let label = cell.label_arc();
    Arc::new(move |value: Option<&Value>| match value {
        None => listener(None),
        Some(raw) => match T::from_value(raw) {
            Some(typed) => listener(Some(&typed)),
            None => {
                failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    key = %label,
                    expected = T::TYPE_NAME,
                    found = raw.type_name(),
                    "typed listener skipped a value of another type"
                );
            }
        },
    })
}

/// Observable value handle
pub struct Property<T = Value> {
    cell: Arc<PropertyCell>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: StateValue> Property<T> {
    /// Standalone property with an optional initial value
    pub fn new(initial: Option<T>) -> Self {
        Property::from_cell(Arc::new(PropertyCell::new(
            ANONYMOUS,
            initial.map(StateValue::into_value),
        )))
    }

    pub fn empty() -> Self {
        Property::new(None)
    }

    pub(crate) fn from_cell(cell: Arc<PropertyCell>) -> Self {
        Property {
            cell,
            _marker: PhantomData,
        }
    }

    #[cfg(test)]
    pub(crate) fn cell(&self) -> &Arc<PropertyCell> {
        &self.cell
    }

    /// Key name, or `<anonymous>` for a standalone property
    pub fn name(&self) -> &str {
        self.cell.label()
    }

    /// Current value; a stored value of another type is a `TypeMismatch`
    pub fn get(&self) -> StateResult<Option<T>> {
        self.cell.with_value(|value| match value {
            None => Ok(None),
            Some(raw) => T::from_value(raw)
                .map(Some)
                .ok_or_else(|| StateError::TypeMismatch {
                    key: self.cell.label().to_string(),
                    expected: T::TYPE_NAME,
                    found: raw.type_name().to_string(),
                }),
        })
    }

    /// Current value in its untyped form
    pub fn get_raw(&self) -> Option<Value> {
        self.cell.snapshot()
    }

    pub fn is_set(&self) -> bool {
        self.cell.with_value(|value| value.is_some())
    }

    /// Set the value; returns whether it changed and listeners ran
    pub fn set(&self, value: Option<T>) -> bool {
        self.cell.store(value.map(StateValue::into_value))
    }

    /// Register a listener, replaying the current value if there is one
    pub fn add_listener<F>(&self, listener: F) -> Subscription
    where
        F: Fn(Option<&T>) + Send + Sync + 'static,
    {
        let erased = erase_listener::<T, F>(&self.cell, listener);
        let id = self.cell.subscribe(erased);
        Subscription::new(id, &self.cell)
    }

    /// Remove a listener registered on this property
    pub fn remove_listener(&self, subscription: &Subscription) -> bool {
        if !Weak::ptr_eq(&subscription.cell, &Arc::downgrade(&self.cell)) {
            return false;
        }
        self.cell.unsubscribe(subscription.id)
    }

    pub fn clear_listeners(&self) {
        self.cell.clear_listeners();
    }

    pub fn listener_count(&self) -> usize {
        self.cell.listener_count()
    }

    /// Listener calls that panicked or were skipped for a type mismatch
    pub fn listener_failures(&self) -> u64 {
        self.cell.failures()
    }

    /// Whether two handles share one cell
    pub fn ptr_eq<U>(&self, other: &Property<U>) -> bool {
        Arc::ptr_eq(&self.cell, &other.cell)
    }
}

impl<T: StateValue> Default for Property<T> {
    fn default() -> Self {
        Property::empty()
    }
}

impl<T> Clone for Property<T> {
    fn clone(&self) -> Self {
        Property {
            cell: Arc::clone(&self.cell),
            _marker: PhantomData,
        }
    }
}

impl<T: StateValue> fmt::Debug for Property<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Property")
            .field("name", &self.cell.label())
            .field("type", &T::TYPE_NAME)
            .field("value", &self.cell.snapshot())
            .field("listeners", &self.cell.listener_count())
            .finish()
    }
}

/// Removal capability for one listener registration
///
/// Dropping a subscription does not remove the listener; call
/// [`Subscription::unsubscribe`] or [`Property::remove_listener`].
pub struct Subscription {
    id: SubscriptionId,
    cell: Weak<PropertyCell>,
}

impl Subscription {
    pub(crate) fn new(id: SubscriptionId, cell: &Arc<PropertyCell>) -> Self {
        Subscription {
            id,
            cell: Arc::downgrade(cell),
        }
    }

    #[inline]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Remove the listener; false if it was already gone
    pub fn unsubscribe(&self) -> bool {
        match self.cell.upgrade() {
            Some(cell) => cell.unsubscribe(self.id),
            None => false,
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("live", &(self.cell.strong_count() > 0))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, impl Fn(Option<&i64>) + Send + Sync + 'static) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        (count, move |_: Option<&i64>| {
            c.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[test]
    fn test_property_get_set() {
        let prop = Property::new(Some(5i64));
        assert_eq!(prop.get().unwrap(), Some(5));

        assert!(prop.set(Some(6)));
        assert_eq!(prop.get().unwrap(), Some(6));

        assert!(prop.set(None));
        assert_eq!(prop.get().unwrap(), None);
        assert!(!prop.is_set());
    }

    #[test]
    fn test_equal_value_does_not_notify() {
        let prop: Property<i64> = Property::empty();
        let (count, listener) = counter();
        prop.add_listener(listener);

        prop.set(Some(1));
        prop.set(Some(1));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        prop.set(Some(2));
        assert_eq!(count.load(Ordering::SeqCst), 2);

        prop.set(None);
        prop.set(None);
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_add_listener_replays_current_value() {
        let prop = Property::new(Some(42i64));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        prop.add_listener(move |v: Option<&i64>| s.lock().push(v.copied()));
        assert_eq!(*seen.lock(), vec![Some(42)]);

        let empty: Property<i64> = Property::empty();
        let (count, listener) = counter();
        empty.add_listener(listener);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_listeners_run_in_registration_order() {
        let prop: Property<String> = Property::empty();
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let o = Arc::clone(&order);
            prop.add_listener(move |_: Option<&String>| o.lock().push(tag));
        }

        prop.set(Some("go".to_string()));
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_remove_listener_by_subscription() {
        let prop: Property<i64> = Property::empty();
        let (count, listener) = counter();
        let sub = prop.add_listener(listener);

        assert!(prop.remove_listener(&sub));
        assert!(!prop.remove_listener(&sub));
        prop.set(Some(1));
        assert_eq!(count.load(Ordering::SeqCst), 0);

        let other: Property<i64> = Property::empty();
        let (_, listener) = counter();
        let foreign = other.add_listener(listener);
        assert!(!prop.remove_listener(&foreign));
        assert!(foreign.unsubscribe());
        assert_eq!(other.listener_count(), 0);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let prop: Property<i64> = Property::empty();
        prop.add_listener(|_: Option<&i64>| panic!("boom"));
        let (count, listener) = counter();
        prop.add_listener(listener);

        assert!(prop.set(Some(1)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(prop.listener_failures(), 1);
        assert_eq!(prop.get().unwrap(), Some(1));
    }

    #[test]
    fn test_clear_listeners_does_not_notify() {
        let prop = Property::new(Some(1i64));
        let (count, listener) = counter();
        prop.add_listener(listener);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        prop.clear_listeners();
        assert_eq!(prop.listener_count(), 0);
        prop.set(Some(2));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_typed_view_reports_mismatch() {
        let raw: Property<Value> = Property::new(Some(Value::from("text")));
        let typed: Property<i64> = Property::from_cell(Arc::clone(raw.cell()));

        assert!(matches!(typed.get(), Err(StateError::TypeMismatch { .. })));

        let (count, listener) = counter();
        typed.add_listener(listener);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        assert_eq!(typed.listener_failures(), 1);

        raw.set(Some(Value::Int(3)));
        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert_eq!(typed.get().unwrap(), Some(3));
    }

    #[test]
    fn test_compare_and_store() {
        let cell = PropertyCell::new("k", Some(Value::Int(1)));
        assert_eq!(
            cell.compare_and_store(&Some(Value::Int(2)), Some(Value::Int(3))),
            CasOutcome::Conflict
        );
        assert_eq!(
            cell.compare_and_store(&Some(Value::Int(1)), Some(Value::Int(1))),
            CasOutcome::Unchanged
        );
        assert_eq!(
            cell.compare_and_store(&Some(Value::Int(1)), Some(Value::Int(3))),
            CasOutcome::Changed
        );
        assert_eq!(cell.snapshot(), Some(Value::Int(3)));
    }

    #[test]
    fn test_null_value_is_absent() {
        let prop: Property<Value> = Property::new(Some(Value::Null));
        assert!(!prop.is_set());
        assert!(!prop.set(Some(Value::Null)));
    }

    #[test]
    fn test_nan_is_a_stable_value() {
        let prop: Property<f64> = Property::empty();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        prop.add_listener(move |_: Option<&f64>| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        assert!(prop.set(Some(f64::NAN)));
        assert!(!prop.set(Some(f64::NAN)));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let cell = PropertyCell::new("ratio", Some(Value::Float(f64::NAN)));
        assert_eq!(
            cell.compare_and_store(&Some(Value::Float(f64::NAN)), Some(Value::Float(1.0))),
            CasOutcome::Changed
        );
    }

    #[test]
    fn test_racing_write_delivered_once_to_new_listener() {
        let prop: Property<i64> = Property::new(Some(0));
        let writer = prop.clone();
        let seen: Vec<Arc<Mutex<Vec<i64>>>> =
            (0..32).map(|_| Arc::new(Mutex::new(Vec::new()))).collect();

        std::thread::scope(|scope| {
            scope.spawn(move || {
                for n in 1..=2000 {
                    writer.set(Some(n));
                }
            });
            for log in &seen {
                let log = Arc::clone(log);
                prop.add_listener(move |v: Option<&i64>| {
                    if let Some(v) = v {
                        log.lock().push(*v);
                    }
                });
            }
        });

        for log in &seen {
            let mut values = log.lock().clone();
            let total = values.len();
            values.sort_unstable();
            values.dedup();
            assert_eq!(values.len(), total, "a value was delivered twice");
        }
    }
}
