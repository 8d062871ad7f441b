//! Object storage for transcode inputs and outputs.
//!
//! This crate provides:
//! - The [`ObjectStorage`] trait (exists, read, write, file transfer)
//! - An S3 client for AWS and S3-compatible endpoints
//! - An in-memory implementation

pub mod error;
pub mod memory;
pub mod s3;
pub mod storage;

pub use error::{StorageError, StorageResult};
pub use memory::MemoryStorage;
pub use s3::{S3Config, S3Storage};
pub use storage::ObjectStorage;
