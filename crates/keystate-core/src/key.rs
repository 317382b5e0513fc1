//! Typed keys
//!
//! A `StateKey<T>` pairs a name with a type tag. Identity is the name alone:
//! a typed key and a plain string with the same name address the same slot,
//! and two keys with the same name but different `T` compare equal. Keeping
//! one logical type per name is the caller's job.

use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;

use crate::{require_name, StateResult, StateValue, Value};

/// Zero-sized compile-time type tag
pub struct TypeTag<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T: StateValue> TypeTag<T> {
    pub const fn new() -> Self {
        TypeTag {
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn name(&self) -> &'static str {
        T::TYPE_NAME
    }

    /// Runtime check of a stored value against this tag
    #[inline]
    pub fn matches(&self, value: &Value) -> bool {
        T::matches(value)
    }
}

impl<T: StateValue> Default for TypeTag<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for TypeTag<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for TypeTag<T> {}

impl<T: StateValue> fmt::Debug for TypeTag<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeTag({})", T::TYPE_NAME)
    }
}

/// Typed identifier for a store slot
pub struct StateKey<T> {
    name: Cow<'static, str>,
    tag: PhantomData<fn() -> T>,
}

impl<T: StateValue> StateKey<T> {
    /// Key for a `static` or `const` declaration
    ///
    /// The name is not checked here; store operations reject empty names.
    pub const fn constant(name: &'static str) -> Self {
        StateKey {
            name: Cow::Borrowed(name),
            tag: PhantomData,
        }
    }

    /// Create a key, rejecting an empty name
    pub fn of(name: impl Into<Cow<'static, str>>, _tag: TypeTag<T>) -> StateResult<Self> {
        let name = name.into();
        require_name(&name, "state key name")?;
        Ok(StateKey {
            name,
            tag: PhantomData,
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn type_tag(&self) -> TypeTag<T> {
        TypeTag::new()
    }

    #[inline]
    pub fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }
}

impl<T> Clone for StateKey<T> {
    fn clone(&self) -> Self {
        StateKey {
            name: self.name.clone(),
            tag: PhantomData,
        }
    }
}

impl<T, U> PartialEq<StateKey<U>> for StateKey<T> {
    fn eq(&self, other: &StateKey<U>) -> bool {
        self.name == other.name
    }
}

impl<T> Eq for StateKey<T> {}

impl<T> Hash for StateKey<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl<T: StateValue> fmt::Debug for StateKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StateKey({:?}, {})", self.name, T::TYPE_NAME)
    }
}

impl<T: StateValue> fmt::Display for StateKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.name, T::TYPE_NAME)
    }
}

/// Anything that names a store slot
///
/// Plain strings address the slot untyped (as [`Value`]); a `StateKey<T>`
/// addresses it as `T`.
pub trait AsStateKey {
    type Value: StateValue;

    fn key_name(&self) -> &str;
}

impl AsStateKey for str {
    type Value = Value;

    fn key_name(&self) -> &str {
        self
    }
}

impl AsStateKey for String {
    type Value = Value;

    fn key_name(&self) -> &str {
        self
    }
}

impl<T: StateValue> AsStateKey for StateKey<T> {
    type Value = T;

    fn key_name(&self) -> &str {
        &self.name
    }
}
