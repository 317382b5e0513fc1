//! keystate Test Harness - Store fuzzing and test support
//!
//! This crate provides:
//! - Concurrent store fuzzing with seeded workloads
//! - Property predicates shared by proptest suites
//! - Tracing setup for tests

pub mod logging;
pub mod store_fuzzer;

pub use logging::init_test_tracing;
pub use store_fuzzer::*;
