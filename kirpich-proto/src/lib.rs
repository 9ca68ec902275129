//! Shared wire contract for the Kirpich realtime connection and REST API.

pub mod api;
pub mod codec;
pub mod frame;
pub mod ids;
pub mod message;
