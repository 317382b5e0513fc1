//! Value graph definitions
//!
//! Every stored value is a `Value`: scalars, indexed sequences, string-keyed
//! maps, and records. Records are the struct-like kind: a type name plus a
//! fixed table of named fields.
//!
//! Typed access goes through [`StateValue`], which a type implements to opt
//! into the store and into path addressing.

use std::collections::BTreeMap;
use std::fmt;

use crate::{StateError, StateResult};

/// Runtime kind of a value
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Null,
    Bool,
    Int,
    Float,
    Text,
    List,
    Map,
    Record,
}

impl ValueKind {
    pub fn name(self) -> &'static str {
        match self {
            ValueKind::Null => "Null",
            ValueKind::Bool => "Bool",
            ValueKind::Int => "Int",
            ValueKind::Float => "Float",
            ValueKind::Text => "Text",
            ValueKind::List => "List",
            ValueKind::Map => "Map",
            ValueKind::Record => "Record",
        }
    }

    /// Containers can be walked by a nested path
    pub fn is_container(self) -> bool {
        matches!(self, ValueKind::List | ValueKind::Map | ValueKind::Record)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A node in the state graph
///
/// Equality is structural. Floats compare by bit pattern, so `NaN` equals
/// itself and `0.0` differs from `-0.0`.
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Record(Record),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Bool(_) => ValueKind::Bool,
            Value::Int(_) => ValueKind::Int,
            Value::Float(_) => ValueKind::Float,
            Value::Text(_) => ValueKind::Text,
            Value::List(_) => ValueKind::List,
            Value::Map(_) => ValueKind::Map,
            Value::Record(_) => ValueKind::Record,
        }
    }

    /// Name used in diagnostics; records report their own type name
    pub fn type_name(&self) -> &str {
        match self {
            Value::Record(record) => record.type_name(),
            other => other.kind().name(),
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn empty_map() -> Self {
        Value::Map(BTreeMap::new())
    }

    /// Build a map from key/value pairs
    pub fn map<K, V, I>(entries: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Value::Map(
            entries
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }

    /// Build a list from items
    pub fn list<V, I>(items: I) -> Self
    where
        V: Into<Value>,
        I: IntoIterator<Item = V>,
    {
        Value::List(items.into_iter().map(Into::into).collect())
    }

    /// `Null` becomes `None`, anything else `Some`
    pub fn into_option(self) -> Option<Value> {
        match self {
            Value::Null => None,
            other => Some(other),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(x) => Some(*x),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(record) => Some(record),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Text(a), Value::Text(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Text(s) => write!(f, "{s:?}"),
            Value::List(items) => {
                f.write_str("[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{item}")?;
                }
                f.write_str("]")
            }
            Value::Map(map) => {
                f.write_str("{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{k:?}: {v}")?;
                }
                f.write_str("}")
            }
            Value::Record(record) => {
                write!(f, "{} {{", record.type_name())?;
                for (i, (k, v)) in record.fields().enumerate() {
                    if i > 0 {
                        f.write_str(",")?;
                    }
                    write!(f, " {k}: {v}")?;
                }
                f.write_str(" }")
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Int(i64::from(i))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Float(x)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<Record> for Value {
    fn from(record: Record) -> Self {
        Value::Record(record)
    }
}

impl<V: Into<Value>> From<Vec<V>> for Value {
    fn from(items: Vec<V>) -> Self {
        Value::list(items)
    }
}

impl<V: Into<Value>> From<BTreeMap<String, V>> for Value {
    fn from(map: BTreeMap<String, V>) -> Self {
        Value::map(map)
    }
}

impl<V: Into<Value>> From<Option<V>> for Value {
    fn from(value: Option<V>) -> Self {
        value.map_or(Value::Null, Into::into)
    }
}

/// Struct-like value with a fixed accessor table
///
/// Fields are declared when the record is built. Reading an undeclared
/// field yields nothing and writing one is an error.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    type_name: String,
    fields: Vec<(String, Value)>,
}

impl Record {
    pub fn new(type_name: impl Into<String>) -> Self {
        Record {
            type_name: type_name.into(),
            fields: Vec::new(),
        }
    }

    /// Declare a field (or overwrite a declared one)
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        let name = name.into();
        let value = value.into();
        match self.field_mut(&name) {
            Some(slot) => *slot = value,
            None => self.fields.push((name, value)),
        }
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| n == name).map(|(_, v)| v)
    }

    pub fn field_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.fields
            .iter_mut()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v)
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// Assign a declared field
    pub fn set_field(&mut self, name: &str, value: Value) -> StateResult<()> {
        let record = self.type_name.clone();
        match self.field_mut(name) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(StateError::NoSuchField {
                record,
                field: name.to_string(),
            }),
        }
    }

    /// Iterate over fields in declaration order
    pub fn fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(n, v)| (n.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// A type that can live in the store
///
/// Implementors map themselves onto the value graph. Struct types usually
/// convert to and from a [`Record`] whose type name is `TYPE_NAME`.
pub trait StateValue: Sized + Send + Sync + 'static {
    /// Name reported in type errors
    const TYPE_NAME: &'static str;

    /// Convert from a stored value, `None` if the kinds disagree
    fn from_value(value: &Value) -> Option<Self>;

    /// Convert into a stored value
    fn into_value(self) -> Value;

    /// Runtime type check without conversion
    fn matches(value: &Value) -> bool {
        Self::from_value(value).is_some()
    }
}

impl StateValue for Value {
    const TYPE_NAME: &'static str = "Value";

    fn from_value(value: &Value) -> Option<Self> {
        Some(value.clone())
    }

    fn into_value(self) -> Value {
        self
    }

    fn matches(_value: &Value) -> bool {
        true
    }
}

impl StateValue for bool {
    const TYPE_NAME: &'static str = "Bool";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_bool()
    }

    fn into_value(self) -> Value {
        Value::Bool(self)
    }
}

impl StateValue for i64 {
    const TYPE_NAME: &'static str = "Int";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_i64()
    }

    fn into_value(self) -> Value {
        Value::Int(self)
    }
}

impl StateValue for i32 {
    const TYPE_NAME: &'static str = "Int32";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_i64().and_then(|i| i32::try_from(i).ok())
    }

    fn into_value(self) -> Value {
        Value::Int(i64::from(self))
    }
}

impl StateValue for f64 {
    const TYPE_NAME: &'static str = "Float";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_f64()
    }

    fn into_value(self) -> Value {
        Value::Float(self)
    }
}

impl StateValue for String {
    const TYPE_NAME: &'static str = "Text";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_string)
    }

    fn into_value(self) -> Value {
        Value::Text(self)
    }

    fn matches(value: &Value) -> bool {
        matches!(value, Value::Text(_))
    }
}

impl StateValue for Record {
    const TYPE_NAME: &'static str = "Record";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_record().cloned()
    }

    fn into_value(self) -> Value {
        Value::Record(self)
    }

    fn matches(value: &Value) -> bool {
        matches!(value, Value::Record(_))
    }
}

impl<T: StateValue> StateValue for Vec<T> {
    const TYPE_NAME: &'static str = "List";

    fn from_value(value: &Value) -> Option<Self> {
        value.as_list()?.iter().map(T::from_value).collect()
    }

    fn into_value(self) -> Value {
        Value::List(self.into_iter().map(StateValue::into_value).collect())
    }

    fn matches(value: &Value) -> bool {
        value
            .as_list()
            .map_or(false, |items| items.iter().all(T::matches))
    }
}

impl<T: StateValue> StateValue for BTreeMap<String, T> {
    const TYPE_NAME: &'static str = "Map";

    fn from_value(value: &Value) -> Option<Self> {
        value
            .as_map()?
            .iter()
            .map(|(k, v)| T::from_value(v).map(|t| (k.clone(), t)))
            .collect()
    }

    fn into_value(self) -> Value {
        Value::Map(
            self.into_iter()
                .map(|(k, v)| (k, v.into_value()))
                .collect(),
        )
    }

    fn matches(value: &Value) -> bool {
        value
            .as_map()
            .map_or(false, |map| map.values().all(T::matches))
    }
}
