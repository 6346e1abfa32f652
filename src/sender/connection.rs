use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info};

use super::transport::Transport;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("failed to build HTTP client: {0}")]
    Build(String),
}

pub type TransportFactory =
    Arc<dyn Fn() -> Result<Arc<dyn Transport>, ConnectionError> + Send + Sync>;

struct ConnectionEpoch {
    request_count: u64,
    limit: u64,
    generation: u64,
    transport: Arc<dyn Transport>,
}

/// Caps how many requests a pooled client serves before it is replaced.
///
/// Long-lived connections get pinned to one backend node behind a load
/// balancer; rotating the pool spreads ingestion load. The lock covers the
/// counter and the pointer swap, never the client build or network I/O.
pub struct ConnectionManager {
    factory: TransportFactory,
    epoch: Mutex<ConnectionEpoch>,
}

impl ConnectionManager {
    pub fn new(factory: TransportFactory, limit: u64) -> Result<Self, ConnectionError> {
        let transport = factory()?;
        Ok(Self {
            factory,
            epoch: Mutex::new(ConnectionEpoch {
                request_count: 0,
                limit: limit.max(1),
                generation: 0,
                transport,
            }),
        })
    }

    /// Transport for the next attempt. Callers keep their clone for the
    /// duration of the exchange, so a swap never interrupts it.
    pub fn current(&self) -> Arc<dyn Transport> {
        self.epoch.lock().transport.clone()
    }

    /// Records a completed exchange, replacing the pool at the limit.
    ///
    /// The counter is reset under the lock so only one caller rebuilds. The
    /// new client is built unlocked and swapped in only if no other reset
    /// landed meanwhile.
    pub fn after_request(&self) -> Result<(), ConnectionError> {
        let generation = {
            let mut epoch = self.epoch.lock();
            epoch.request_count += 1;
            if epoch.request_count < epoch.limit {
                return Ok(());
            }
            debug!(
                request_count = epoch.request_count,
                limit = epoch.limit,
                "Request limit reached, resetting connection"
            );
            epoch.request_count = 0;
            epoch.generation
        };

        let transport = (self.factory)().inspect_err(|e| {
            error!(error = %e, "Failed to reset connection");
        })?;

        let mut epoch = self.epoch.lock();
        if epoch.generation != generation {
            debug!(generation = epoch.generation, "Connection already replaced");
            return Ok(());
        }
        // Dropping the old handle lets its idle connections close once
        // in-flight requests release their clones.
        epoch.transport = transport;
        epoch.generation += 1;
        Ok(())
    }

    /// Forces a fresh pool regardless of the counter.
    pub fn rotate(&self) -> Result<(), ConnectionError> {
        let transport = (self.factory)()?;
        let mut epoch = self.epoch.lock();
        epoch.transport = transport;
        epoch.request_count = 0;
        epoch.generation += 1;
        info!(generation = epoch.generation, "Closed idle connections");
        Ok(())
    }

    pub fn request_count(&self) -> u64 {
        self.epoch.lock().request_count
    }

    pub fn limit(&self) -> u64 {
        self.epoch.lock().limit
    }

    /// Number of pool replacements so far.
    pub fn generation(&self) -> u64 {
        self.epoch.lock().generation
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let epoch = self.epoch.lock();
        f.debug_struct("ConnectionManager")
            .field("request_count", &epoch.request_count)
            .field("limit", &epoch.limit)
            .field("generation", &epoch.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sender::request::{InboundResponse, OutboundRequest};
    use crate::sender::transport::TransportError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{OnceLock, Weak};

    struct Noop;

    #[async_trait]
    impl Transport for Noop {
        async fn round_trip(
            &self,
            _request: &mut OutboundRequest,
        ) -> Result<InboundResponse, TransportError> {
            Err(TransportError::InvalidRequest("unused".into()))
        }
    }

    fn counting_factory() -> (TransportFactory, Arc<AtomicUsize>) {
        let built = Arc::new(AtomicUsize::new(0));
        let counter = built.clone();
        let factory: TransportFactory = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(Noop) as Arc<dyn Transport>)
        });
        (factory, built)
    }

    #[test]
    fn resets_when_limit_reached() {
        let (factory, built) = counting_factory();
        let manager = ConnectionManager::new(factory, 3).unwrap();
        assert_eq!(built.load(Ordering::SeqCst), 1);

        manager.after_request().unwrap();
        manager.after_request().unwrap();
        assert_eq!(manager.request_count(), 2);
        assert_eq!(built.load(Ordering::SeqCst), 1);

        manager.after_request().unwrap();
        assert_eq!(manager.request_count(), 0);
        assert_eq!(manager.generation(), 1);
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn limit_of_one_resets_after_every_request() {
        let (factory, built) = counting_factory();
        let manager = ConnectionManager::new(factory, 1).unwrap();

        for _ in 0..5 {
            manager.after_request().unwrap();
            assert_eq!(manager.request_count(), 0);
        }
        assert_eq!(built.load(Ordering::SeqCst), 6);
    }

    #[test]
    fn zero_limit_is_clamped() {
        let (factory, _) = counting_factory();
        let manager = ConnectionManager::new(factory, 0).unwrap();
        assert_eq!(manager.limit(), 1);
    }

    #[test]
    fn factory_failure_surfaces_and_keeps_old_transport() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let factory: TransportFactory = Arc::new(move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Ok(Arc::new(Noop) as Arc<dyn Transport>)
            } else {
                Err(ConnectionError::Build("tls init failed".into()))
            }
        });
        let manager = ConnectionManager::new(factory, 1).unwrap();

        assert!(manager.after_request().is_err());
        assert_eq!(manager.generation(), 0);
    }

    #[test]
    fn pool_is_built_without_holding_the_lock() {
        let slot: Arc<OnceLock<Weak<ConnectionManager>>> = Arc::new(OnceLock::new());
        let observed = Arc::new(Mutex::new(Vec::new()));
        let factory: TransportFactory = {
            let slot = slot.clone();
            let observed = observed.clone();
            Arc::new(move || {
                if let Some(manager) = slot.get().and_then(Weak::upgrade) {
                    observed.lock().push(manager.epoch.try_lock().is_some());
                }
                Ok(Arc::new(Noop) as Arc<dyn Transport>)
            })
        };
        let manager = Arc::new(ConnectionManager::new(factory, 1).unwrap());
        slot.set(Arc::downgrade(&manager)).unwrap();

        manager.after_request().unwrap();
        manager.rotate().unwrap();

        assert_eq!(*observed.lock(), vec![true, true]);
        assert_eq!(manager.generation(), 2);
    }

    #[test]
    fn reset_superseded_by_rotate_is_discarded() {
        let slot: Arc<OnceLock<Weak<ConnectionManager>>> = Arc::new(OnceLock::new());
        let rotated = Arc::new(AtomicBool::new(false));
        let (inner, built) = counting_factory();
        let factory: TransportFactory = {
            let slot = slot.clone();
            Arc::new(move || {
                if let Some(manager) = slot.get().and_then(Weak::upgrade)
                    && !rotated.swap(true, Ordering::SeqCst)
                {
                    manager.rotate().unwrap();
                }
                inner()
            })
        };
        let manager = Arc::new(ConnectionManager::new(factory, 1).unwrap());
        slot.set(Arc::downgrade(&manager)).unwrap();

        manager.after_request().unwrap();

        // One swap from the rotate; the limit reset's client was dropped.
        assert_eq!(manager.generation(), 1);
        assert_eq!(manager.request_count(), 0);
        assert_eq!(built.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn rotate_replaces_pool() {
        let (factory, built) = counting_factory();
        let manager = ConnectionManager::new(factory, 100).unwrap();
        manager.after_request().unwrap();

        manager.rotate().unwrap();
        assert_eq!(manager.request_count(), 0);
        assert_eq!(manager.generation(), 1);
        assert_eq!(built.load(Ordering::SeqCst), 2);
    }
}
