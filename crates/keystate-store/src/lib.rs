//! keystate Store - Typed reactive state container
//!
//! This crate implements the store and its building blocks:
//! - Observable properties with subscription handles
//! - Path-addressed views into nested value graphs
//! - Composable schemas and validation results
//! - The key/value store with owner-scoped listeners

pub mod nested;
pub mod property;
pub mod schema;
pub mod store;
pub mod validation;

pub use nested::NestedProperty;
pub use property::{Property, Subscription};
pub use schema::{SchemaBuilder, StateSchema};
pub use store::{StateStore, StoreConfig};
pub use validation::ValidationResult;

pub use keystate_core::{
    AsStateKey, NestedPath, OwnerId, Record, StateError, StateKey, StateResult, StateValue,
    SubscriptionId, TypeTag, Value, ValueKind,
};
