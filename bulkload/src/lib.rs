#![doc = include_str!("../README.md")]

mod cancel;
pub mod channel;
mod config;
mod connection;
mod enumerate;
mod error;
pub mod log_sink;
mod objstore;
mod pipeline;
pub mod pool;
mod task;

pub use cancel::{CancelReason, Cancellation};
pub use config::Config;
pub use connection::{ConnectionString, StaticCredentials};
pub use enumerate::FileEnumerator;
pub use error::{BulkLoadError, ErrorKind, Result};
pub use log_sink::{LogCollector, TracingCollector};
pub use objstore::{ObjectStorage, ObjectStorageFactory, SourceFile, StorageClient};
pub use pipeline::*;
