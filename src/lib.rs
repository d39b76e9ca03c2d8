//! Durable multi-tenant job queue and worker runtime backed by Postgres.
//!
//! Clients submit opaque JSON payloads over an authenticated HTTP surface;
//! a pool of workers dequeues them with `FOR UPDATE SKIP LOCKED`, executes
//! a pluggable handler with at-least-once semantics, and quarantines
//! poison jobs in a dead-letter table. Lifecycle transitions fan out over
//! an in-process event bus to long-lived observer connections.

pub mod admission;
pub mod api;
pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod pool;
pub mod service;
pub mod state;
pub mod store;
pub mod worker;
