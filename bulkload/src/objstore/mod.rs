use crate::connection::ConnectionString;
use crate::{Config, Result};
use dyn_clone::DynClone;
use snafu::prelude::*;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

mod s3;

/// An object storage system like S3, scoped to the one container (bucket) files are uploaded into.
///
/// Not all object storage systems expose an S3-compatible API, so to ensure we can add support for
/// those other systems in the future, the object storage implementation is abstracted behind a
/// trait.  Tests use an in-memory implementation.
///
/// Use [`ObjectStorageFactory`] to create the S3 implementation of this trait.
///
/// Note that all implementations are trivially cloneable such that the cost of a clone is the cost
/// of increasing the ref count on an `Arc`
#[async_trait::async_trait]
pub trait ObjectStorage: DynClone + std::fmt::Debug + Sync + Send + 'static {
    /// Name of the container objects are uploaded into
    fn container(&self) -> &str;

    /// Create the container if it doesn't already exist.
    ///
    /// Returns `true` if the container was created, `false` if it was already there.
    async fn create_container_if_not_exists(&self) -> Result<bool>;

    /// Make a new client for uploading into the container.
    ///
    /// The upload pipeline keeps a bounded pool of these and reuses them for the whole run.
    fn new_client(&self) -> Box<dyn StorageClient>;
}

dyn_clone::clone_trait_object!(ObjectStorage);

/// A client that uploads files into an [`ObjectStorage`] container.
///
/// Each client is used by only one upload at a time.
#[async_trait::async_trait]
pub trait StorageClient: std::fmt::Debug + Sync + Send + 'static {
    /// Upload the contents of `source` as the object `key`, returning the number of bytes
    /// uploaded.
    ///
    /// If `cancel` fires before the upload finishes, the upload is abandoned and this fails with
    /// [`crate::BulkLoadError::Aborted`].
    async fn upload(&self, key: &str, source: SourceFile, cancel: &CancellationToken)
        -> Result<u64>;
}

/// A local file opened for upload
#[derive(Debug)]
pub struct SourceFile {
    pub path: PathBuf,
    pub file: tokio::fs::File,
    pub len: u64,
}

impl SourceFile {
    pub async fn open(path: &Path) -> Result<Self> {
        let file = tokio::fs::File::open(path)
            .await
            .with_context(|_| crate::error::OpenSourceFileSnafu { path })?;
        let len = file
            .metadata()
            .await
            .with_context(|_| crate::error::OpenSourceFileSnafu { path })?
            .len();

        Ok(Self {
            path: path.to_path_buf(),
            file,
            len,
        })
    }
}

/// Constructs [`ObjectStorage`] implementations from the configuration.
#[derive(Debug)]
pub struct ObjectStorageFactory {
    config: Config,
}

impl ObjectStorageFactory {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Parse the configured connection string and return the S3 implementation of
    /// [`ObjectStorage`] it describes.
    pub async fn build(&self) -> Result<Box<dyn ObjectStorage>> {
        let connection: ConnectionString = self
            .config
            .connection_string
            .as_deref()
            .unwrap_or_default()
            .parse()?;

        // NOTE: a new instance per call.  AWS SDK clients hold on to resources which are tied to
        // the tokio runtime they were made on, so sharing one between runtimes (as tests do) can
        // panic.
        Ok(Box::new(
            s3::S3::new(&connection, self.config.container.clone()).await,
        ))
    }
}
