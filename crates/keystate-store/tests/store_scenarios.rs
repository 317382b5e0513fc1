//! End-to-end behavior of the store and its views

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use keystate_store::{
    NestedProperty, OwnerId, Property, Record, StateError, StateKey, StateSchema, StateStore,
    StoreConfig, TypeTag, Value,
};
use keystate_test::init_test_tracing;
use parking_lot::Mutex;

fn user() -> Value {
    Value::map([("address", Value::map([("city", "New York")]))])
}

fn recorder<T: Clone + Send + 'static>() -> (
    Arc<Mutex<Vec<Option<T>>>>,
    impl Fn(Option<&T>) + Send + Sync + 'static,
) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let s = Arc::clone(&seen);
    (seen, move |v: Option<&T>| s.lock().push(v.cloned()))
}

#[test]
fn distinct_writes_notify_once_each() {
    init_test_tracing();
    let prop: Property<String> = Property::empty();
    let (seen, listener) = recorder::<String>();
    prop.add_listener(listener);

    assert!(prop.set(Some("a".into())));
    assert!(!prop.set(Some("a".into())));
    assert!(prop.set(Some("b".into())));

    assert_eq!(*seen.lock(), vec![Some("a".into()), Some("b".into())]);
}

#[test]
fn add_listener_replays_only_a_present_value() {
    let empty: Property<i64> = Property::empty();
    let (seen, listener) = recorder::<i64>();
    empty.add_listener(listener);
    assert!(seen.lock().is_empty());

    let holding = Property::new(Some(7i64));
    let (seen, listener) = recorder::<i64>();
    holding.add_listener(listener);
    assert_eq!(*seen.lock(), vec![Some(7)]);
}

#[test]
fn panicking_listener_does_not_stop_others() {
    init_test_tracing();
    let prop: Property<i64> = Property::empty();
    let calls = Arc::new(AtomicUsize::new(0));

    prop.add_listener(|_: Option<&i64>| panic!("listener failure"));
    let c = Arc::clone(&calls);
    prop.add_listener(move |_: Option<&i64>| {
        c.fetch_add(1, Ordering::SeqCst);
    });

    assert!(prop.set(Some(1)));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(prop.listener_failures(), 1);
}

#[test]
fn nested_user_scenario() {
    let store = StateStore::new();
    store.set("user", user()).unwrap();

    let nested = store.get_nested_property("user").unwrap();
    assert_eq!(
        nested.get_nested_value::<String>("address.city").unwrap(),
        Some("New York".to_string())
    );

    nested.set_nested_value("address.city", "Boston").unwrap();
    let refetched = store.get_nested_property("user").unwrap();
    assert_eq!(
        refetched.get_nested_value::<String>("address.city").unwrap(),
        Some("Boston".to_string())
    );
    assert_eq!(
        store.get("user").unwrap(),
        Some(Value::map([("address", Value::map([("city", "Boston")]))]))
    );
}

#[test]
fn nested_round_trips_through_every_container() {
    let root = Value::map([
        ("items", Value::list([Value::map([("qty", 1)])])),
        (
            "owner",
            Value::from(Record::new("Person").with_field("name", "Ada")),
        ),
    ]);
    let nested = NestedProperty::new(root);

    nested.set_nested_value("items.0.qty", 5).unwrap();
    nested.set_nested_value("owner.name", "Grace").unwrap();
    nested.set_nested_value("fresh.deep.leaf", true).unwrap();

    assert_eq!(nested.get_nested_value::<i64>("items.0.qty").unwrap(), Some(5));
    assert_eq!(
        nested.get_nested_value::<String>("owner.name").unwrap(),
        Some("Grace".to_string())
    );
    assert_eq!(nested.get_nested_value::<bool>("fresh.deep.leaf").unwrap(), Some(true));

    assert!(matches!(
        nested.set_nested_value("owner.age", 36),
        Err(StateError::NoSuchField { .. })
    ));
    assert!(matches!(
        nested.set_nested_value("items.3.qty", 1),
        Err(StateError::IndexOutOfRange { index: 3, len: 1, .. })
    ));
}

#[test]
fn missing_paths_read_as_none() {
    let nested = NestedProperty::new(user());
    assert_eq!(nested.get_nested_raw("address.zip").unwrap(), None);
    assert_eq!(nested.get_nested_raw("address.city.more").unwrap(), None);
    assert_eq!(nested.get_nested_raw("nope.nothing").unwrap(), None);

    let store = StateStore::new();
    let unset = store.get_nested_property("ghost").unwrap();
    assert_eq!(unset.get_nested_raw("a.b").unwrap(), None);
    assert!(matches!(
        unset.set_nested_value("a.b", 1),
        Err(StateError::InvalidState(_))
    ));

    assert!(matches!(
        nested.get_nested_raw("address..city"),
        Err(StateError::InvalidArgument(_))
    ));
}

#[test]
fn nested_listener_sees_writes_under_its_path() {
    let nested = NestedProperty::new(user());
    let (seen, listener) = recorder::<Value>();
    nested.add_nested_listener("address.city", listener).unwrap();

    nested.set_nested_value("address.city", "Boston").unwrap();
    nested.set_nested_value("address", Value::map([("city", "Paris")])).unwrap();
    nested.set_nested_value("unrelated", 1).unwrap();

    assert_eq!(
        *seen.lock(),
        vec![
            Some(Value::from("New York")),
            Some(Value::from("Boston")),
            Some(Value::from("Paris")),
        ]
    );
}

#[test]
fn schema_required_and_rule() {
    let schema = StateSchema::new(TypeTag::<String>::new())
        .required()
        .add_rule(|s| s.chars().count() >= 3, "length must be at least 3")
        .unwrap();

    let short = schema.validate(Some(&Value::from("ab")));
    assert!(!short.is_valid());
    assert_eq!(short.errors().len(), 1);
    assert!(short.errors()[0].contains("length"));

    assert!(schema.validate(Some(&Value::from("abc"))).is_valid());
    assert!(!schema.validate(None).is_valid());
    assert!(StateSchema::new(TypeTag::<String>::new()).validate(None).is_valid());
}

#[test]
fn type_mismatch_reports_once_and_skips_rules() {
    let schema = StateSchema::new(TypeTag::<String>::new())
        .add_rule(|_| false, "never passes")
        .unwrap();

    let result = schema.validate(Some(&Value::Int(5)));
    assert_eq!(result.errors(), ["value must be of type Text"]);
}

#[test]
fn nested_schema_errors_name_their_location() {
    let address = StateSchema::new(TypeTag::<BTreeMap<String, Value>>::new())
        .add_nested_schema("city", StateSchema::new(TypeTag::<String>::new()).required())
        .unwrap();
    let user_schema = StateSchema::new(TypeTag::<BTreeMap<String, Value>>::new())
        .add_nested_schema("address", address)
        .unwrap();

    let result = user_schema.validate(Some(&Value::map([("address", Value::empty_map())])));
    assert_eq!(result.errors(), ["address.city is required"]);
    assert!(keystate_test::properties::errors_prefixed(&result, "address"));
}

#[test]
fn unlisten_silences_only_that_owner() {
    let store = StateStore::new();
    let owner_a = OwnerId::next();
    let owner_b = OwnerId::next();
    let a = Arc::new(AtomicUsize::new(0));
    let b = Arc::new(AtomicUsize::new(0));

    let ca = Arc::clone(&a);
    store
        .listen("k", owner_a, move |_: Option<&Value>| {
            ca.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();
    let cb = Arc::clone(&b);
    store
        .listen("k", owner_b, move |_: Option<&Value>| {
            cb.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

    store.unlisten("k", owner_a).unwrap();
    store.set("k", Value::Int(1)).unwrap();

    assert_eq!(a.load(Ordering::SeqCst), 0);
    assert_eq!(b.load(Ordering::SeqCst), 1);
}

#[test]
fn keys_with_same_name_are_equal_across_types() {
    let int_key = StateKey::of("k", TypeTag::<i64>::new()).unwrap();
    let text_key = StateKey::of("k", TypeTag::<String>::new()).unwrap();
    assert!(int_key == text_key);

    let store = StateStore::new();
    store.set(&int_key, 1).unwrap();
    assert!(matches!(
        store.get(&text_key),
        Err(StateError::TypeMismatch { expected: "Text", .. })
    ));
}

#[test]
fn independent_stores_do_not_share_state() {
    let first = StateStore::new();
    let second = StateStore::new();
    first.set("k", Value::Int(1)).unwrap();
    assert_eq!(second.get("k").unwrap(), None);
    first.shutdown();
    assert!(second.is_empty());
}

#[test]
fn concurrent_updates_are_not_lost() {
    let store = StateStore::with_config(StoreConfig {
        max_update_attempts: 10_000,
        ..StoreConfig::named("contended")
    });
    let count: StateKey<i64> = StateKey::of("count", TypeTag::new()).unwrap();

    std::thread::scope(|scope| {
        for _ in 0..8 {
            scope.spawn(|| {
                for _ in 0..250 {
                    store.update(&count, |v| Some(v.unwrap_or(0) + 1)).unwrap();
                }
            });
        }
    });

    assert_eq!(store.get(&count).unwrap(), Some(2000));
}

/// Run `f` on its own thread and fail if it does not finish in time
fn finishes<F: FnOnce() + Send + 'static>(f: F) {
    let (tx, rx) = std::sync::mpsc::channel();
    std::thread::spawn(move || {
        f();
        let _ = tx.send(());
    });
    assert!(
        rx.recv_timeout(std::time::Duration::from_secs(5)).is_ok(),
        "operation did not return; a lock was held across user code"
    );
}

#[test]
fn property_listener_may_write_its_own_key() {
    let store = Arc::new(StateStore::new());
    let count: StateKey<i64> = StateKey::of("count", TypeTag::new()).unwrap();

    let prop = store.get_property(&count).unwrap();
    let inner = Arc::clone(&store);
    let key = count.clone();
    prop.add_listener(move |v: Option<&i64>| {
        if let Some(n) = v.copied().filter(|n| *n < 3) {
            inner.set(&key, n + 1).unwrap();
        }
    });

    let writer = Arc::clone(&store);
    let k = count.clone();
    finishes(move || {
        writer.set(&k, 0).unwrap();
    });
    assert_eq!(store.get(&count).unwrap(), Some(3));
}

#[test]
fn owner_listener_may_read_and_write_the_store() {
    let store = Arc::new(StateStore::new());
    let inner = Arc::clone(&store);
    store
        .listen("k", OwnerId::next(), move |v: Option<&Value>| {
            let current = inner.get("k").unwrap();
            assert!(current.is_some());
            if let Some(n) = v.and_then(Value::as_i64) {
                inner.set("mirror", Value::Int(n)).unwrap();
            }
        })
        .unwrap();

    let writer = Arc::clone(&store);
    finishes(move || {
        writer.set("k", Value::Int(9)).unwrap();
        writer.update("k", |_| Some(Value::Int(10))).unwrap();
    });
    assert_eq!(store.get("mirror").unwrap(), Some(Value::Int(10)));
}

#[test]
fn nested_listener_may_use_the_store() {
    let store = Arc::new(StateStore::new());
    store.set("user", user()).unwrap();
    let nested = store.get_nested_property("user").unwrap();

    let inner = Arc::clone(&store);
    nested
        .add_nested_listener("address.city", move |v: Option<&Value>| {
            let root = inner.get("user").unwrap();
            assert!(root.is_some());
            if let Some(city) = v.and_then(Value::as_str) {
                inner.set("last_city", Value::from(city)).unwrap();
                inner.set_nested("user", "seen", true).unwrap();
            }
        })
        .unwrap();

    finishes(move || {
        nested.set_nested_value("address.city", "Boston").unwrap();
    });
    assert_eq!(store.get("last_city").unwrap(), Some(Value::from("Boston")));
    assert_eq!(
        store.get_nested_property("user").unwrap().get_nested_value::<bool>("seen").unwrap(),
        Some(true)
    );
}
