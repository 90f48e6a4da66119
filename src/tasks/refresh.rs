//! Background Refresh Task
//!
//! Periodically re-invokes refresh functions for keys nearing expiry and
//! writes the results back through the cache's normal write path.
//!
//! The periodic task is not started with the cache. It starts on the first
//! registration of a refresh function (`Idle -> Running`) and runs until the
//! cache is dropped or shut down.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::store::{RefreshTarget, StoreInner};
use crate::cache::CacheStore;
use crate::config::CacheConfig;

#[derive(Debug)]
enum SchedulerState {
    Idle,
    Running(JoinHandle<()>),
    Stopped,
}

/// Drives background refresh for one cache.
#[derive(Debug)]
pub struct RefreshScheduler {
    enabled: bool,
    interval: Duration,
    min_ttl_ms: u64,
    cache_name: String,
    state: Mutex<SchedulerState>,
    /// One task per key being refreshed
    in_flight: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl RefreshScheduler {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            enabled: config.background_refresh_enabled,
            interval: config.refresh_interval(),
            min_ttl_ms: config.refresh_min_ttl_ms(),
            cache_name: config.name.clone(),
            state: Mutex::new(SchedulerState::Idle),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lock_state(), SchedulerState::Running(_))
    }

    // == Ensure Started ==
    /// Starts the periodic task if refresh is enabled and it is not running yet.
    ///
    /// Needs a Tokio runtime; without one the scheduler stays idle and the
    /// next registration tries again.
    pub(crate) fn ensure_started(&self, store: &CacheStore) {
        if !self.enabled {
            return;
        }

        let mut state = self.lock_state();
        if !matches!(*state, SchedulerState::Idle) {
            return;
        }

        match Handle::try_current() {
            Ok(runtime) => {
                let handle = runtime.spawn(refresh_loop(
                    Arc::downgrade(&store.inner),
                    self.interval,
                    self.cache_name.clone(),
                ));
                *state = SchedulerState::Running(handle);
                info!(
                    cache = %self.cache_name,
                    interval_ms = self.interval.as_millis() as u64,
                    min_ttl_ms = self.min_ttl_ms,
                    "Background refresh started"
                );
            }
            Err(_) => {
                warn!(cache = %self.cache_name, "No Tokio runtime; background refresh not started");
            }
        }
    }

    // == Tick ==
    /// Starts a refresh task for every due registration whose previous
    /// refresh has finished. Returns the number of tasks started.
    pub(crate) fn tick(&self, store: &CacheStore) -> usize {
        let runtime = match Handle::try_current() {
            Ok(runtime) => runtime,
            Err(_) => {
                warn!(cache = %self.cache_name, "No Tokio runtime; refresh tick skipped");
                return 0;
            }
        };

        let mut in_flight = self.lock_in_flight();
        in_flight.retain(|_, handle| !handle.is_finished());

        let mut started = 0;
        for target in store.due_refreshes(self.min_ttl_ms) {
            if in_flight.contains_key(&target.key) {
                debug!(cache = %self.cache_name, key = %target.key, "Refresh still in flight; skipped");
                continue;
            }
            let key = target.key.clone();
            let handle = runtime.spawn(refresh_key(Arc::downgrade(&store.inner), target));
            in_flight.insert(key, handle);
            started += 1;
        }
        started
    }

    /// Aborts in-flight refreshes for `keys`.
    pub(crate) fn cancel(&self, keys: &[String]) {
        let mut in_flight = self.lock_in_flight();
        for key in keys {
            if let Some(handle) = in_flight.remove(key) {
                handle.abort();
            }
        }
    }

    pub(crate) fn cancel_all(&self) {
        for (_, handle) in self.lock_in_flight().drain() {
            handle.abort();
        }
    }

    // == Shutdown ==
    /// Stops the periodic task for good and aborts in-flight refreshes.
    pub fn shutdown(&self) {
        let previous = std::mem::replace(&mut *self.lock_state(), SchedulerState::Stopped);
        if let SchedulerState::Running(handle) = previous {
            handle.abort();
            info!(cache = %self.cache_name, "Background refresh stopped");
        }
        self.cancel_all();
    }

    fn lock_state(&self) -> MutexGuard<'_, SchedulerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_in_flight(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RefreshScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Ticks every `period` until the cache is gone.
async fn refresh_loop(store: Weak<StoreInner>, period: Duration, cache_name: String) {
    let mut ticker = time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        let Some(inner) = store.upgrade() else {
            debug!(cache = %cache_name, "Cache dropped; refresh loop exiting");
            return;
        };
        let store = CacheStore { inner };

        let started = store.inner.scheduler.tick(&store);
        if started > 0 {
            debug!(cache = %cache_name, started, "Refresh tick");
        }
    }
}

/// Runs one refresh function without holding any cache lock, then writes the
/// result back.
async fn refresh_key(store: Weak<StoreInner>, target: RefreshTarget) {
    let RefreshTarget {
        key,
        generation,
        refresh,
    } = target;

    let result = refresh(key.clone()).await;

    let Some(inner) = store.upgrade() else {
        return;
    };
    let store = CacheStore { inner };

    match result {
        Ok(value) => {
            if store.write_back(&key, generation, value) {
                debug!(cache = %store.config().name, key = %key, "Refreshed");
            } else {
                debug!(cache = %store.config().name, key = %key, "Refresh result discarded");
            }
        }
        Err(err) => {
            store.record_refresh_failure();
            warn!(
                cache = %store.config().name,
                key = %key,
                error = %err,
                "Refresh failed; keeping stale value"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{refresh_fn, ManualClock};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn refresh_config() -> CacheConfig {
        CacheConfig::default().with_background_refresh(
            Duration::from_millis(1_000),
            Duration::from_millis(2_000),
        )
    }

    fn test_store(config: CacheConfig) -> (CacheStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let store = CacheStore::builder(config)
            .clock(clock.clone())
            .build()
            .unwrap();
        (store, clock)
    }

    fn counting_refresh(calls: Arc<AtomicUsize>) -> crate::cache::RefreshFn {
        refresh_fn(move |key| {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                Ok(json!(format!("{key}:{n}")))
            }
        })
    }

    #[tokio::test]
    async fn test_scheduler_idle_until_registration() {
        let (store, _) = test_store(refresh_config());
        assert!(!store.inner.scheduler.is_running());

        store.set("plain", json!(1), None).unwrap();
        assert!(!store.inner.scheduler.is_running());

        store
            .set_with_refresh("key", json!(1), None, refresh_fn(|_| async { Ok(json!(2)) }))
            .unwrap();
        assert!(store.inner.scheduler.is_running());
    }

    #[tokio::test]
    async fn test_scheduler_not_started_when_disabled() {
        let (store, _) = test_store(CacheConfig::default());

        store
            .set_with_refresh("key", json!(1), None, refresh_fn(|_| async { Ok(json!(2)) }))
            .unwrap();
        assert!(!store.inner.scheduler.is_running());
    }

    #[test]
    fn test_scheduler_without_runtime_stays_idle() {
        let (store, _) = test_store(refresh_config());

        store
            .set_with_refresh("key", json!(1), None, refresh_fn(|_| async { Ok(json!(2)) }))
            .unwrap();
        assert!(!store.inner.scheduler.is_running());
        assert_eq!(store.refresh_now(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_refreshes_due_key_once() {
        let (store, _) = test_store(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        // 1s TTL is inside the 70s default threshold
        store
            .set_with_refresh("key", json!("stale"), Some(1), counting_refresh(calls.clone()))
            .unwrap();

        assert_eq!(store.refresh_now(), 1);
        time::sleep(Duration::from_millis(1)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("key").unwrap(), Some(json!("key:1")));
        assert!(store.is_registered("key"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tick_skips_keys_not_due() {
        let (store, _) = test_store(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        store
            .set_with_refresh("key", json!("v"), Some(3_600), counting_refresh(calls.clone()))
            .unwrap();

        assert_eq!(store.refresh_now(), 0);
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_refresh_keeps_stale_value() {
        let (store, clock) = test_store(CacheConfig::default());

        store
            .set_with_refresh(
                "key",
                json!("stale"),
                Some(10),
                refresh_fn(|_| async { Err(anyhow::anyhow!("backend down")) }),
            )
            .unwrap();

        assert_eq!(store.refresh_now(), 1);
        time::sleep(Duration::from_millis(1)).await;

        assert_eq!(store.get("key").unwrap(), Some(json!("stale")));
        assert_eq!(store.stats().refresh_failures, 1);

        // Once expired the value is gone but the registration survives for retry
        clock.advance(Duration::from_secs(10));
        assert_eq!(store.get("key").unwrap(), None);
        assert!(store.is_registered("key"));
        assert_eq!(store.refresh_now(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_revives_expired_key() {
        let (store, clock) = test_store(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        store
            .set_with_refresh("key", json!("old"), Some(1), counting_refresh(calls.clone()))
            .unwrap();
        clock.advance(Duration::from_secs(5));
        assert_eq!(store.get("key").unwrap(), None);

        assert_eq!(store.refresh_now(), 1);
        time::sleep(Duration::from_millis(1)).await;

        assert_eq!(store.get("key").unwrap(), Some(json!("key:1")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_refresh_does_not_stack_or_block_others() {
        let (store, _) = test_store(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        store
            .set_with_refresh(
                "slow",
                json!("v"),
                Some(1),
                refresh_fn(|_| async {
                    time::sleep(Duration::from_secs(3_600)).await;
                    Ok(json!("late"))
                }),
            )
            .unwrap();
        store
            .set_with_refresh("fast", json!("v"), Some(1), counting_refresh(calls.clone()))
            .unwrap();

        assert_eq!(store.refresh_now(), 2);
        time::sleep(Duration::from_millis(1)).await;

        // "slow" is still running, only "fast" is started again
        assert_eq!(store.refresh_now(), 1);
        time::sleep(Duration::from_millis(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_cancels_in_flight_refresh() {
        let (store, _) = test_store(CacheConfig::default());

        store
            .set_with_refresh(
                "key",
                json!("v"),
                Some(1),
                refresh_fn(|_| async {
                    time::sleep(Duration::from_secs(1)).await;
                    Ok(json!("resurrected"))
                }),
            )
            .unwrap();

        assert_eq!(store.refresh_now(), 1);
        store.delete(["key"]);
        time::sleep(Duration::from_secs(2)).await;

        assert_eq!(store.get("key").unwrap(), None);
        assert!(!store.is_registered("key"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_loop_refreshes_each_tick() {
        let (store, _) = test_store(refresh_config());
        let calls = Arc::new(AtomicUsize::new(0));

        store
            .set_with_refresh("key", json!("v"), Some(1), counting_refresh(calls.clone()))
            .unwrap();

        // First tick fires one interval after start
        time::sleep(Duration::from_millis(500)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.get("key").unwrap(), Some(json!("key:1")));

        time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_stops_loop() {
        let (store, _) = test_store(refresh_config());
        let calls = Arc::new(AtomicUsize::new(0));

        store
            .set_with_refresh("key", json!("v"), Some(1), counting_refresh(calls.clone()))
            .unwrap();
        store.shutdown();
        assert!(!store.inner.scheduler.is_running());

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        // Stopped schedulers do not restart
        store
            .set_with_refresh("other", json!("v"), Some(1), counting_refresh(calls.clone()))
            .unwrap();
        assert!(!store.inner.scheduler.is_running());
    }
}
