//! Media worker pool.
//!
//! Workers are created once at startup and never replaced. Routers are
//! handed out round-robin and come back through [`WorkerPool::release`],
//! which consumes the lease so a router cannot be released twice.
//!
//! A dead worker is fatal: every session bound to it is in an unknown
//! state, so the death watch cancels the process-wide fatal token and the
//! binary exits for its supervisor to restart.

use crate::media::codecs::media_codecs;
use crate::media::types::{RtpCodecCapability, WorkerSettings};
use crate::media::{EngineError, MediaEngine, MediaRouter, MediaWorker};
use crate::observability::metrics;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolSettings {
    pub num_workers: usize,
    pub rtc_min_port: u16,
    pub rtc_ports_per_worker: u16,
}

impl WorkerPoolSettings {
    /// Port range of worker `index`. Ranges do not overlap.
    #[must_use]
    pub fn worker_settings(&self, index: usize) -> WorkerSettings {
        let offset = u16::try_from(index)
            .unwrap_or(u16::MAX)
            .saturating_mul(self.rtc_ports_per_worker);
        let rtc_min_port = self.rtc_min_port.saturating_add(offset);
        WorkerSettings {
            rtc_min_port,
            rtc_max_port: rtc_min_port.saturating_add(self.rtc_ports_per_worker.saturating_sub(1)),
        }
    }
}

/// A router checked out of the pool for one session.
#[derive(Debug)]
pub struct RouterLease {
    router: Arc<dyn MediaRouter>,
    worker: Arc<dyn MediaWorker>,
    worker_index: usize,
}

impl RouterLease {
    #[must_use]
    pub fn router(&self) -> &Arc<dyn MediaRouter> {
        &self.router
    }

    #[must_use]
    pub fn worker_id(&self) -> &str {
        self.worker.id()
    }
}

#[derive(Debug)]
struct WorkerSlot {
    worker: Arc<dyn MediaWorker>,
    active_routers: AtomicUsize,
}

/// Load of a single worker, for the admin endpoint.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerLoad {
    pub worker_id: String,
    pub active_routers: usize,
}

#[derive(Debug)]
pub struct WorkerPool {
    slots: Vec<WorkerSlot>,
    cursor: AtomicUsize,
    media_codecs: Vec<RtpCodecCapability>,
}

impl WorkerPool {
    /// Creates `settings.num_workers` workers on `engine`.
    #[instrument(skip_all, name = "sig.media.pool.start", fields(workers = settings.num_workers))]
    pub async fn start(
        engine: &dyn MediaEngine,
        settings: &WorkerPoolSettings,
    ) -> Result<Self, EngineError> {
        let mut workers = Vec::with_capacity(settings.num_workers);
        for index in 0..settings.num_workers {
            let worker_settings = settings.worker_settings(index);
            let worker = engine.create_worker(worker_settings.clone()).await?;
            info!(
                target: "sig.media.pool",
                worker_id = %worker.id(),
                rtc_min_port = worker_settings.rtc_min_port,
                rtc_max_port = worker_settings.rtc_max_port,
                "Media worker created"
            );
            workers.push(worker);
        }
        Self::from_workers(workers)
    }

    /// Builds a pool over already-created workers.
    pub fn from_workers(workers: Vec<Arc<dyn MediaWorker>>) -> Result<Self, EngineError> {
        if workers.is_empty() {
            return Err(EngineError::InvalidParameters(
                "worker pool needs at least one worker".to_string(),
            ));
        }
        Ok(Self {
            slots: workers
                .into_iter()
                .map(|worker| WorkerSlot {
                    worker,
                    active_routers: AtomicUsize::new(0),
                })
                .collect(),
            cursor: AtomicUsize::new(0),
            media_codecs: media_codecs(),
        })
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.slots.len()
    }

    /// Creates a router on the next worker in round-robin order.
    pub async fn acquire_router(&self) -> Result<RouterLease, EngineError> {
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let slot = self
            .slots
            .get(index)
            .ok_or_else(|| EngineError::InvalidState("worker index out of range".to_string()))?;

        let start = Instant::now();
        let result = slot.worker.create_router(&self.media_codecs).await;
        metrics::record_engine_call("create_router", result.is_ok(), start.elapsed());

        let router = result?;
        let active = slot.active_routers.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            target: "sig.media.pool",
            worker_id = %slot.worker.id(),
            router_id = %router.id(),
            active_routers = active,
            "Router acquired"
        );

        Ok(RouterLease {
            router,
            worker: Arc::clone(&slot.worker),
            worker_index: index,
        })
    }

    /// Closes the leased router and returns the worker's slot.
    pub fn release(&self, lease: RouterLease) {
        lease.router.close();
        if let Some(slot) = self.slots.get(lease.worker_index) {
            let _ = slot
                .active_routers
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        }
        debug!(
            target: "sig.media.pool",
            worker_id = %lease.worker.id(),
            router_id = %lease.router.id(),
            "Router released"
        );
    }

    #[must_use]
    pub fn load(&self) -> Vec<WorkerLoad> {
        self.slots
            .iter()
            .map(|slot| WorkerLoad {
                worker_id: slot.worker.id().to_string(),
                active_routers: slot.active_routers.load(Ordering::SeqCst),
            })
            .collect()
    }

    /// Watches every worker and cancels `fatal` when one dies.
    pub fn spawn_death_watch(&self, fatal: CancellationToken) -> Vec<JoinHandle<()>> {
        self.slots
            .iter()
            .map(|slot| {
                let worker = Arc::clone(&slot.worker);
                let fatal = fatal.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        () = fatal.cancelled() => {}
                        reason = worker.died() => {
                            error!(
                                target: "sig.media.pool",
                                worker_id = %worker.id(),
                                reason = %reason,
                                "Media worker died, process must restart"
                            );
                            metrics::record_worker_death();
                            fatal.cancel();
                        }
                    }
                })
            })
            .collect()
    }

    /// Closes every worker. Called once at shutdown.
    pub fn close(&self) {
        for slot in &self.slots {
            slot.worker.close();
        }
        info!(target: "sig.media.pool", workers = self.slots.len(), "Media workers closed");
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::media::loopback::LoopbackEngine;
    use std::time::Duration;

    fn settings(num_workers: usize) -> WorkerPoolSettings {
        WorkerPoolSettings {
            num_workers,
            rtc_min_port: 10000,
            rtc_ports_per_worker: 100,
        }
    }

    #[test]
    fn test_worker_port_ranges_do_not_overlap() {
        let settings = settings(3);
        let first = settings.worker_settings(0);
        let second = settings.worker_settings(1);
        let third = settings.worker_settings(2);

        assert_eq!((first.rtc_min_port, first.rtc_max_port), (10000, 10099));
        assert_eq!((second.rtc_min_port, second.rtc_max_port), (10100, 10199));
        assert_eq!((third.rtc_min_port, third.rtc_max_port), (10200, 10299));
    }

    #[tokio::test]
    async fn test_empty_pool_is_rejected() {
        let result = WorkerPool::from_workers(Vec::new());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_round_robin_across_workers() {
        let engine = LoopbackEngine::new();
        let pool = WorkerPool::start(&engine, &settings(3)).await.unwrap();
        assert_eq!(pool.size(), 3);

        let mut worker_ids = Vec::new();
        for _ in 0..6 {
            worker_ids.push(pool.acquire_router().await.unwrap().worker_id().to_string());
        }

        assert_eq!(worker_ids[0], worker_ids[3]);
        assert_eq!(worker_ids[1], worker_ids[4]);
        assert_eq!(worker_ids[2], worker_ids[5]);
        assert_ne!(worker_ids[0], worker_ids[1]);
        assert_ne!(worker_ids[1], worker_ids[2]);
    }

    #[tokio::test]
    async fn test_release_closes_router_and_updates_load() {
        let engine = LoopbackEngine::new();
        let pool = WorkerPool::start(&engine, &settings(1)).await.unwrap();

        let lease = pool.acquire_router().await.unwrap();
        assert_eq!(pool.load().first().unwrap().active_routers, 1);
        assert_eq!(engine.open_routers(), 1);

        pool.release(lease);
        assert_eq!(pool.load().first().unwrap().active_routers, 0);
        assert_eq!(engine.open_routers(), 0);
        assert_eq!(engine.router_close_calls(), 1);
    }

    #[tokio::test]
    async fn test_router_creation_failure_is_reported() {
        let engine = LoopbackEngine::new();
        let pool = WorkerPool::start(&engine, &settings(1)).await.unwrap();
        engine.fail_next_router_creations(1);

        let result = pool.acquire_router().await;
        assert!(matches!(result, Err(EngineError::Request(_))));
        assert_eq!(pool.load().first().unwrap().active_routers, 0);
    }

    #[tokio::test]
    async fn test_worker_death_cancels_fatal_token() {
        let engine = LoopbackEngine::new();
        let pool = WorkerPool::start(&engine, &settings(2)).await.unwrap();
        let fatal = CancellationToken::new();
        let watchers = pool.spawn_death_watch(fatal.clone());

        engine.workers().last().unwrap().kill("out of memory");

        tokio::time::timeout(Duration::from_secs(1), fatal.cancelled())
            .await
            .unwrap();
        for watcher in watchers {
            tokio::time::timeout(Duration::from_secs(1), watcher)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
