//! Job registry and per-job locks.
//!
//! This crate provides:
//! - The [`JobRegistry`] trait with create-if-absent and conditional update
//! - A Redis implementation driven by Lua scripts
//! - An in-memory implementation
//! - [`LockManager`], the lease-based per-job lock built on conditional writes

pub mod error;
pub mod lock;
pub mod memory;
pub mod redis_registry;
pub mod registry;

pub use error::{RegistryError, RegistryResult};
pub use lock::LockManager;
pub use memory::MemoryRegistry;
pub use redis_registry::RedisRegistry;
pub use registry::{Condition, JobRegistry, JobUpdate, RegistryConfig};
