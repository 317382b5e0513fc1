//! keystate Core - Fundamental types and primitives
//!
//! This crate defines the types shared by the store and its tooling:
//! - The value graph (`Value`, `Record`) and the `StateValue` conversions
//! - Typed keys (`StateKey`, `TypeTag`) and owner/subscription identities
//! - The nested path grammar and resolution engine
//! - Error types

pub mod error;
pub mod id;
pub mod key;
pub mod path;
pub mod value;

pub use error::*;
pub use id::*;
pub use key::*;
pub use path::{assign, resolve, NestedPath};
pub use value::*;
