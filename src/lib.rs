//! Egressgate - a pool controller for rotating egress proxies
//!
//! This library keeps a warm pool of proxy resources behind a provider and
//! exposes exactly one of them at a time:
//! - Provisions the network policy and fills the pool on first use
//! - Polls a candidate until it is ready, then hands its endpoint out
//! - Expires the active resource after a TTL and rotates lazily on next use
//! - Tears down every resource and the policy on shutdown
//! - Backs resources with Docker containers or an in-memory simulation

pub mod admin;
pub mod config;
pub mod controller;
pub mod docker;
pub mod error;
pub mod pool;
pub mod provider;
pub mod simulated;
pub mod watcher;

pub use controller::{Endpoint, PoolController};
pub use error::Error;
