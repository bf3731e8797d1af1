//! A bounded pool of reusable resources, used to share storage clients between the upload
//! workers.
//!
//! At most `max` resources ever exist.  They are created on demand by the pool's factory the
//! first time a lease can't be satisfied from the free list, and after that they are reused for
//! the life of the pool.  A [`Lease`] gives its holder exclusive use of one resource and hands it
//! back when dropped, so a resource can't leak no matter how the holder exits.
use crate::cancel::Cancellation;
use crate::Result;
use snafu::prelude::*;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

type Factory<T> = Box<dyn Fn() -> T + Send + Sync>;

pub struct ResourcePool<T> {
    inner: Arc<PoolInner<T>>,
}

struct PoolInner<T> {
    max: usize,

    /// One permit per resource; a lease holds a permit for as long as it holds the resource
    permits: Arc<Semaphore>,

    free: Mutex<Vec<T>>,
    factory: Factory<T>,

    created: AtomicUsize,
    leased: AtomicUsize,
    peak_leased: AtomicUsize,
    acquires: AtomicU64,
    releases: AtomicU64,
}

/// Point-in-time snapshot of a pool's accounting
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// How many resources the factory has made so far.  Never more than the pool's max.
    pub created: usize,

    /// How many resources are leased out right now
    pub leased: usize,

    /// The most resources that were ever leased out at the same time
    pub peak_leased: usize,

    pub acquires: u64,
    pub releases: u64,
}

impl<T> Clone for ResourcePool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> ResourcePool<T> {
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.inner.created.load(Ordering::SeqCst),
            leased: self.inner.leased.load(Ordering::SeqCst),
            peak_leased: self.inner.peak_leased.load(Ordering::SeqCst),
            acquires: self.inner.acquires.load(Ordering::SeqCst),
            releases: self.inner.releases.load(Ordering::SeqCst),
        }
    }
}

impl<T> std::fmt::Debug for ResourcePool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourcePool")
            .field("max", &self.inner.max)
            .field("stats", &self.stats())
            .finish()
    }
}

impl<T: Send + 'static> ResourcePool<T> {
    /// Create a pool of at most `max` resources made by `factory`.
    ///
    /// Panics if `max` is zero.
    pub fn new(max: usize, factory: impl Fn() -> T + Send + Sync + 'static) -> Self {
        assert!(max > 0, "a resource pool must allow at least one resource");

        Self {
            inner: Arc::new(PoolInner {
                max,
                permits: Arc::new(Semaphore::new(max)),
                free: Mutex::new(Vec::with_capacity(max)),
                factory: Box::new(factory),
                created: AtomicUsize::new(0),
                leased: AtomicUsize::new(0),
                peak_leased: AtomicUsize::new(0),
                acquires: AtomicU64::new(0),
                releases: AtomicU64::new(0),
            }),
        }
    }

    /// Lease a resource, waiting for one to be returned if all of them are in use.
    ///
    /// Fails with [`crate::BulkLoadError::Aborted`] if the run is cancelled before a resource
    /// becomes available; no resource is leased in that case.
    pub async fn acquire(&self, cancel: &Cancellation) -> Result<Lease<T>> {
        ensure!(!cancel.is_cancelled(), crate::error::AbortedSnafu);

        let permit = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                return crate::error::AbortedSnafu.fail();
            }
            permit = self.inner.permits.clone().acquire_owned() => {
                permit.expect("BUG: the pool semaphore is never closed")
            }
        };

        // Holding a permit guarantees either a free resource or room to create one
        let reused = self
            .inner
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop();
        let resource = match reused {
            Some(resource) => resource,
            None => {
                let created = self.inner.created.fetch_add(1, Ordering::SeqCst) + 1;
                assert!(
                    created <= self.inner.max,
                    "BUG: pool created {created} resources but its max is {}",
                    self.inner.max
                );
                debug!(created, max = self.inner.max, "Creating new pooled resource");
                (self.inner.factory)()
            }
        };

        let leased = self.inner.leased.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.peak_leased.fetch_max(leased, Ordering::SeqCst);
        self.inner.acquires.fetch_add(1, Ordering::SeqCst);

        Ok(Lease {
            resource: Some(resource),
            pool: self.inner.clone(),
            _permit: permit,
        })
    }
}

/// Exclusive use of one pooled resource.  Dropping the lease returns the resource to the pool.
pub struct Lease<T> {
    resource: Option<T>,
    pool: Arc<PoolInner<T>>,

    // Declared last so it is released after `drop` has put the resource back on the free list;
    // a waiter woken by the permit always finds the resource there.
    _permit: OwnedSemaphorePermit,
}

impl<T> std::ops::Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.resource
            .as_ref()
            .expect("BUG: lease resource is only taken in drop")
    }
}

impl<T> std::fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Lease")
            .field("pool_max", &self.pool.max)
            .finish_non_exhaustive()
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            self.pool
                .free
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(resource);
            self.pool.leased.fetch_sub(1, Ordering::SeqCst);
            self.pool.releases.fetch_add(1, Ordering::SeqCst);
        }
    }
}
