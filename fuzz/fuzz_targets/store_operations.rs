#![no_main]

use arbitrary::Arbitrary;
use keystate_store::{OwnerId, StateStore, Value};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
enum Op {
    Set { key: u8, value: i64 },
    Unset { key: u8 },
    SetNested { key: u8, path: String, value: i64 },
    Update { key: u8 },
    Listen { key: u8, owner: u8 },
    Unlisten { key: u8, owner: u8 },
    Remove { key: u8 },
    Validate { key: u8 },
}

fn key(k: u8) -> String {
    format!("k{}", k % 8)
}

fuzz_target!(|ops: Vec<Op>| {
    let store = StateStore::new();
    for op in ops {
        match op {
            Op::Set { key: k, value } => {
                let _ = store.set(&key(k), Value::Int(value));
            }
            Op::Unset { key: k } => {
                let _ = store.unset(&key(k));
            }
            Op::SetNested { key: k, path, value } => {
                let _ = store.set_nested(&key(k), &path, value);
            }
            Op::Update { key: k } => {
                let _ = store.update(&key(k), |v| match v {
                    Some(Value::Int(n)) => Some(Value::Int(n.wrapping_add(1))),
                    other => other,
                });
            }
            Op::Listen { key: k, owner } => {
                let _ = store.listen(&key(k), OwnerId::new(u64::from(owner)), |_: Option<&Value>| {});
            }
            Op::Unlisten { key: k, owner } => {
                let _ = store.unlisten(&key(k), OwnerId::new(u64::from(owner)));
            }
            Op::Remove { key: k } => {
                let _ = store.remove(&key(k));
            }
            Op::Validate { key: k } => {
                let _ = store.validate(&key(k));
            }
        }
    }
    store.shutdown();
});
