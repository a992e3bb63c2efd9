//! # flowmesh-redis
//!
//! A [`flowmesh_core::store::BackingStore`] implementation over Redis, isolating the
//! concrete store behind the same trait [`flowmesh_core::store::InMemoryBackingStore`]
//! implements — the production collaborator for a multi-instance deployment.
//!
//! Connection pooling is handled by `bb8`/`bb8-redis`; the durable completed/failed
//! stream rides Redis pub/sub, relayed into an in-process `tokio::sync::broadcast`
//! channel per queue on first subscription.

mod keys;
mod record;
mod store;

pub use store::RedisBackingStore;
