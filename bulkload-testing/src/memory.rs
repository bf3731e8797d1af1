//! An in-memory [`ObjectStorage`] with failure and latency injection.
use bulkload::{BulkLoadError, ObjectStorage, SourceFile, StorageClient};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// How a [`MemoryStorage`] misbehaves
#[derive(Clone, Debug, Default)]
pub struct MemoryStorageOptions {
    /// Every upload takes this long.  Uploads observe cancellation while they wait.
    pub latency: Duration,

    /// Uploads to these keys fail
    pub fail_keys: HashSet<String>,

    /// The upload started `n`th (counting from 1) fails
    pub fail_nth_upload: Option<u64>,

    /// Pretend the container already exists
    pub container_exists: bool,
}

/// Object storage which keeps uploaded objects in memory and records how it was used.
///
/// Clones share state, so a test can keep one clone to inspect while the job owns another.
#[derive(Clone, Debug)]
pub struct MemoryStorage {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    container: String,
    options: MemoryStorageOptions,

    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    container_created: AtomicBool,

    clients_created: AtomicUsize,
    uploads_started: AtomicU64,
    uploads_aborted: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,

    /// Times a client was asked to start an upload while it was already uploading
    concurrent_client_use: AtomicU64,
}

impl MemoryStorage {
    pub fn new(container: &str) -> Self {
        Self::with_options(container, MemoryStorageOptions::default())
    }

    pub fn with_options(container: &str, options: MemoryStorageOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                container: container.to_string(),
                container_created: AtomicBool::new(false),
                options,
                objects: Mutex::new(BTreeMap::new()),
                clients_created: AtomicUsize::new(0),
                uploads_started: AtomicU64::new(0),
                uploads_aborted: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                peak_in_flight: AtomicUsize::new(0),
                concurrent_client_use: AtomicU64::new(0),
            }),
        }
    }

    /// Keys of every object uploaded so far, in sorted order
    pub fn keys(&self) -> Vec<String> {
        self.inner.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.objects.lock().unwrap().get(key).cloned()
    }

    pub fn container_created(&self) -> bool {
        self.inner.container_created.load(Ordering::SeqCst)
    }

    pub fn clients_created(&self) -> usize {
        self.inner.clients_created.load(Ordering::SeqCst)
    }

    pub fn uploads_started(&self) -> u64 {
        self.inner.uploads_started.load(Ordering::SeqCst)
    }

    pub fn uploads_aborted(&self) -> u64 {
        self.inner.uploads_aborted.load(Ordering::SeqCst)
    }

    /// The most uploads that were ever in progress at the same time
    pub fn peak_in_flight(&self) -> usize {
        self.inner.peak_in_flight.load(Ordering::SeqCst)
    }

    pub fn concurrent_client_use(&self) -> u64 {
        self.inner.concurrent_client_use.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl ObjectStorage for MemoryStorage {
    fn container(&self) -> &str {
        &self.inner.container
    }

    async fn create_container_if_not_exists(&self) -> bulkload::Result<bool> {
        if self.inner.options.container_exists {
            return Ok(false);
        }

        Ok(!self.inner.container_created.swap(true, Ordering::SeqCst))
    }

    fn new_client(&self) -> Box<dyn StorageClient> {
        let id = self.inner.clients_created.fetch_add(1, Ordering::SeqCst);

        Box::new(MemoryClient {
            id,
            storage: self.inner.clone(),
            busy: AtomicBool::new(false),
        })
    }
}

#[derive(Debug)]
struct MemoryClient {
    id: usize,
    storage: Arc<Inner>,
    busy: AtomicBool,
}

/// Tracks one upload in progress, for as long as it is alive
struct InFlight<'a> {
    client: &'a MemoryClient,
}

impl<'a> InFlight<'a> {
    fn enter(client: &'a MemoryClient) -> Self {
        if client.busy.swap(true, Ordering::SeqCst) {
            client
                .storage
                .concurrent_client_use
                .fetch_add(1, Ordering::SeqCst);
        }

        let in_flight = client.storage.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        client
            .storage
            .peak_in_flight
            .fetch_max(in_flight, Ordering::SeqCst);

        Self { client }
    }
}

impl<'a> Drop for InFlight<'a> {
    fn drop(&mut self) {
        self.client.storage.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.client.busy.store(false, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl StorageClient for MemoryClient {
    async fn upload(
        &self,
        key: &str,
        source: SourceFile,
        cancel: &CancellationToken,
    ) -> bulkload::Result<u64> {
        let storage = &self.storage;
        let nth = storage.uploads_started.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight::enter(self);

        let mut file = source.file;
        let mut data = Vec::with_capacity(source.len as usize);
        file.read_to_end(&mut data)
            .await
            .map_err(|e| BulkLoadError::upload_rejected(key, e.to_string()))?;

        if !storage.options.latency.is_zero() {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    debug!(client = self.id, key, "Upload aborted");
                    storage.uploads_aborted.fetch_add(1, Ordering::SeqCst);
                    return Err(BulkLoadError::Aborted);
                }
                _ = tokio::time::sleep(storage.options.latency) => {}
            }
        }

        if storage.options.fail_keys.contains(key) || storage.options.fail_nth_upload == Some(nth)
        {
            debug!(client = self.id, key, nth, "Injecting upload failure");
            return Err(BulkLoadError::upload_rejected(key, "injected failure"));
        }

        let len = data.len() as u64;
        storage
            .objects
            .lock()
            .unwrap()
            .insert(key.to_string(), data);
        debug!(client = self.id, key, len, "Stored object");

        Ok(len)
    }
}
