#![no_main]

use arbitrary::Arbitrary;
use keystate_core::{assign, resolve, NestedPath, Value};
use libfuzzer_sys::fuzz_target;

#[derive(Arbitrary, Debug)]
enum Node {
    Null,
    Int(i64),
    Text(String),
    List(Vec<Node>),
    Map(Vec<(String, Node)>),
}

impl Node {
    fn into_value(self, depth: usize) -> Value {
        if depth > 6 {
            return Value::Null;
        }
        match self {
            Node::Null => Value::Null,
            Node::Int(n) => Value::Int(n),
            Node::Text(s) => Value::Text(s),
            Node::List(items) => Value::list(items.into_iter().map(|n| n.into_value(depth + 1))),
            Node::Map(entries) => Value::map(
                entries
                    .into_iter()
                    .map(|(k, n)| (k, n.into_value(depth + 1))),
            ),
        }
    }
}

#[derive(Arbitrary, Debug)]
struct Input {
    root: Node,
    path: String,
    value: i64,
}

fuzz_target!(|input: Input| {
    let Ok(path) = NestedPath::parse(&input.path) else {
        return;
    };
    let mut root = input.root.into_value(0);
    let _ = resolve(&root, &path);

    if assign(&mut root, &path, Value::Int(input.value)).is_ok() {
        assert_eq!(resolve(&root, &path), Some(&Value::Int(input.value)));
    }
});
