//! Kirpich development backend library.
//!
//! An in-memory implementation of the REST and realtime contract the
//! client speaks, for local runs and integration tests.

pub mod config;
pub mod server;
pub mod store;
