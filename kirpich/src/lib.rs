//! Kirpich realtime sync engine.
//!
//! Keeps a persistent connection to the messaging backend, applies pushed
//! frames to local chat and message state, and reconciles optimistic sends
//! with the server's acknowledgements.

pub mod app;
pub mod backend;
pub mod config;
pub mod connection;
pub mod engine;
pub mod event;
pub mod outbound;
pub mod router;
pub mod session;
pub mod state;
pub mod transport;
