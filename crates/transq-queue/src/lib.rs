//! At-least-once work queue.
//!
//! This crate provides:
//! - The [`WorkQueue`] trait (send, receive with visibility lease, delete, extend)
//! - A Redis Streams implementation with dead-lettering
//! - An in-memory implementation for tests and single-process runs

pub mod error;
pub mod memory;
pub mod queue;
pub mod redis_queue;

pub use error::{QueueError, QueueResult};
pub use memory::MemoryQueue;
pub use queue::{QueueConfig, QueueDepth, ReceivedMessage, WorkQueue};
pub use redis_queue::RedisWorkQueue;
