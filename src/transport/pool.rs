//! # Transport Pool
//!
//! A bounded pool of interchangeable transport instances sharing one
//! configuration. Instances are created lazily up to the pool's maximum,
//! `open`ed exactly once before first use, lent out under scoped acquisition
//! and closed in an orderly fashion when the pool drains.
//!
//! ## Acquisition Model
//!
//! [`TransportPool::acquire`] returns a [`PooledTransport`] guard that derefs
//! to the transport. Dropping the guard returns the instance to the pool on
//! every exit path — normal completion, error return and task cancellation
//! alike — so a transport can never leak out of its scope.
//!
//! ## Lifecycle
//!
//! ```text
//! Fresh ──▶ Open ──▶ Closing ──▶ Closed
//! ```
//!
//! Once `close` begins, new acquisitions are refused, outstanding guards are
//! awaited, and every idle instance is closed before the pool reports Closed.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::{BusError, TransportError};
use crate::transport::Poolable;

/// Factory producing a cold (not yet opened) pool member
pub type PoolFactory<T> = Box<dyn Fn() -> Result<Box<T>, BusError> + Send + Sync>;

/// Lifecycle states of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolState {
    /// Created; no instance has been lent out yet
    Fresh,
    /// At least one instance has been created and lent out
    Open,
    /// Draining: new acquisitions are refused, outstanding ones are awaited
    Closing,
    /// Drained: every instance has been closed
    Closed,
}

struct PoolInner<T: Poolable + ?Sized> {
    name: String,
    factory: PoolFactory<T>,
    max_instances: usize,
    /// Bounds checked-out + idle instances to `max_instances`
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<T>>>,
    state: Mutex<PoolState>,
    /// Serialises instance creation so `open` observes a consistent state
    creation: tokio::sync::Mutex<()>,
    created: AtomicUsize,
}

/// A bounded multiset of transport instances of one configuration
///
/// Cheap to clone; clones share the same pool. Pool identity (not
/// configuration equality) is what groups APIs onto a shared listener, so the
/// registry hands out clones of a single pool per distinct transport config.
pub struct TransportPool<T: Poolable + ?Sized> {
    inner: Arc<PoolInner<T>>,
}

impl<T: Poolable + ?Sized> Clone for TransportPool<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Poolable + ?Sized> TransportPool<T> {
    /// Create a pool producing instances from `factory`, at most
    /// `max_instances` alive at once
    pub fn new(name: impl Into<String>, max_instances: usize, factory: PoolFactory<T>) -> Self {
        let max_instances = max_instances.max(1);
        Self {
            inner: Arc::new(PoolInner {
                name: name.into(),
                factory,
                max_instances,
                permits: Arc::new(Semaphore::new(max_instances)),
                idle: Mutex::new(Vec::new()),
                state: Mutex::new(PoolState::Fresh),
                creation: tokio::sync::Mutex::new(()),
                created: AtomicUsize::new(0),
            }),
        }
    }

    /// The diagnostic name of this pool, e.g. `rpc:memory`
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Current lifecycle state
    pub fn state(&self) -> PoolState {
        *self.inner.state.lock().expect("pool state lock poisoned")
    }

    /// Maximum number of concurrently live instances
    pub fn max_instances(&self) -> usize {
        self.inner.max_instances
    }

    /// Number of instances created over the pool's lifetime
    pub fn instances_created(&self) -> usize {
        self.inner.created.load(Ordering::Relaxed)
    }

    /// Whether `other` is a handle to this very pool
    pub fn same_pool(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// A stable identity for this pool, usable as a grouping key
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    /// Lend out a ready transport instance
    ///
    /// Waits when all `max_instances` are checked out. Creates and opens a new
    /// instance when the pool is not yet at capacity and no idle instance is
    /// available; an instance whose `open` fails is not pooled and the failure
    /// propagates to the acquirer.
    pub async fn acquire(&self) -> Result<PooledTransport<T>, BusError> {
        self.refuse_if_draining()?;

        let permit = Arc::clone(&self.inner.permits)
            .acquire_owned()
            .await
            .map_err(|_| self.closed_error())?;

        // The pool may have begun draining while we waited for a permit.
        self.refuse_if_draining()?;

        if let Some(transport) = self.pop_idle() {
            return Ok(PooledTransport {
                transport: Some(transport),
                inner: Arc::clone(&self.inner),
                _permit: permit,
            });
        }

        // No idle instance; create one. Creation is serialised so concurrent
        // first acquisitions do not race their backends' open().
        let _creating = self.inner.creation.lock().await;
        let transport = match self.pop_idle() {
            Some(transport) => transport,
            None => {
                let mut transport = (self.inner.factory)()?;
                transport.open_transport().await?;
                self.inner.created.fetch_add(1, Ordering::Relaxed);
                debug!(
                    pool = %self.inner.name,
                    total = self.inner.created.load(Ordering::Relaxed),
                    "opened new pooled transport instance"
                );
                transport
            }
        };
        drop(_creating);

        {
            let mut state = self.inner.state.lock().expect("pool state lock poisoned");
            if *state == PoolState::Fresh {
                *state = PoolState::Open;
            }
        }

        Ok(PooledTransport {
            transport: Some(transport),
            inner: Arc::clone(&self.inner),
            _permit: permit,
        })
    }

    /// Drain the pool
    ///
    /// Refuses new acquisitions, waits for every outstanding guard to be
    /// returned, then closes each idle instance. Idempotent: later calls (and
    /// concurrent calls racing the first) return immediately.
    pub async fn close(&self) -> Result<(), BusError> {
        {
            let mut state = self.inner.state.lock().expect("pool state lock poisoned");
            match *state {
                PoolState::Closing | PoolState::Closed => return Ok(()),
                PoolState::Fresh | PoolState::Open => *state = PoolState::Closing,
            }
        }

        // Acquiring every permit waits out all outstanding guards.
        let permits = self
            .inner
            .permits
            .acquire_many(self.inner.max_instances as u32)
            .await
            .map_err(|_| self.closed_error())?;
        permits.forget();
        self.inner.permits.close();

        let idle: Vec<Box<T>> = {
            let mut idle = self.inner.idle.lock().expect("pool idle lock poisoned");
            idle.drain(..).collect()
        };
        let mut first_failure = None;
        for mut transport in idle {
            if let Err(error) = transport.close_transport().await {
                warn!(pool = %self.inner.name, %error, "error closing pooled transport");
                first_failure.get_or_insert(error);
            }
        }

        *self.inner.state.lock().expect("pool state lock poisoned") = PoolState::Closed;
        debug!(pool = %self.inner.name, "transport pool closed");

        match first_failure {
            Some(error) => Err(error.into()),
            None => Ok(()),
        }
    }

    fn pop_idle(&self) -> Option<Box<T>> {
        self.inner
            .idle
            .lock()
            .expect("pool idle lock poisoned")
            .pop()
    }

    fn refuse_if_draining(&self) -> Result<(), BusError> {
        match self.state() {
            PoolState::Closing | PoolState::Closed => Err(self.closed_error()),
            PoolState::Fresh | PoolState::Open => Ok(()),
        }
    }

    fn closed_error(&self) -> BusError {
        TransportError::PoolClosed {
            pool: self.inner.name.clone(),
        }
        .into()
    }
}

impl<T: Poolable + ?Sized> std::fmt::Debug for TransportPool<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportPool")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("max_instances", &self.inner.max_instances)
            .finish()
    }
}

/// A lent transport instance, returned to its pool on drop
pub struct PooledTransport<T: Poolable + ?Sized> {
    transport: Option<Box<T>>,
    inner: Arc<PoolInner<T>>,
    _permit: OwnedSemaphorePermit,
}

impl<T: Poolable + ?Sized> std::ops::Deref for PooledTransport<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.transport
            .as_deref()
            .expect("pooled transport used after release")
    }
}

impl<T: Poolable + ?Sized> std::ops::DerefMut for PooledTransport<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.transport
            .as_deref_mut()
            .expect("pooled transport used after release")
    }
}

impl<T: Poolable + ?Sized> Drop for PooledTransport<T> {
    fn drop(&mut self) {
        if let Some(transport) = self.transport.take() {
            self.inner
                .idle
                .lock()
                .expect("pool idle lock poisoned")
                .push(transport);
        }
        // The permit drops with us, which is what releases the pool slot.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::time::Duration;

    struct Probe {
        opens: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        fail_open: bool,
    }

    #[async_trait]
    impl Poolable for Probe {
        async fn open_transport(&mut self) -> Result<(), TransportError> {
            if self.fail_open {
                return Err(TransportError::Connection("open refused".to_string()));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn close_transport(&mut self) -> Result<(), TransportError> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn probe_pool(
        max: usize,
        fail_open: bool,
    ) -> (TransportPool<Probe>, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let opens = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let (o, c) = (Arc::clone(&opens), Arc::clone(&closes));
        let pool = TransportPool::new(
            "test:probe",
            max,
            Box::new(move || {
                Ok(Box::new(Probe {
                    opens: Arc::clone(&o),
                    closes: Arc::clone(&c),
                    fail_open,
                }))
            }),
        );
        (pool, opens, closes)
    }

    #[tokio::test]
    async fn instances_are_opened_once_and_reused() {
        let (pool, opens, _) = probe_pool(4, false);

        let guard = pool.acquire().await.unwrap();
        drop(guard);
        let guard = pool.acquire().await.unwrap();
        drop(guard);

        assert_eq!(opens.load(Ordering::SeqCst), 1);
        assert_eq!(pool.instances_created(), 1);
        assert_eq!(pool.state(), PoolState::Open);
    }

    #[tokio::test]
    async fn acquisition_blocks_at_capacity() {
        let (pool, _, _) = probe_pool(1, false);

        let held = pool.acquire().await.unwrap();
        let contender = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await.map(|_| ()) })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(held);
        contender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn failed_open_propagates_and_is_not_pooled() {
        let (pool, opens, _) = probe_pool(2, true);

        assert!(pool.acquire().await.is_err());
        assert_eq!(opens.load(Ordering::SeqCst), 0);
        assert_eq!(pool.instances_created(), 0);

        // The permit was returned; the pool is still usable.
        assert!(pool.acquire().await.is_err());
    }

    #[tokio::test]
    async fn close_waits_for_outstanding_guards_and_closes_idle() {
        let (pool, _, closes) = probe_pool(2, false);

        let guard = pool.acquire().await.unwrap();
        let closer = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.close().await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!closer.is_finished());
        assert_eq!(pool.state(), PoolState::Closing);
        assert!(pool.acquire().await.is_err());

        drop(guard);
        closer.await.unwrap().unwrap();

        assert_eq!(pool.state(), PoolState::Closed);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (pool, _, closes) = probe_pool(2, false);
        drop(pool.acquire().await.unwrap());

        pool.close().await.unwrap();
        pool.close().await.unwrap();
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clones_share_identity() {
        let (pool, _, _) = probe_pool(2, false);
        let clone = pool.clone();
        let (other, _, _) = probe_pool(2, false);

        assert!(pool.same_pool(&clone));
        assert_eq!(pool.id(), clone.id());
        assert!(!pool.same_pool(&other));
    }
}
