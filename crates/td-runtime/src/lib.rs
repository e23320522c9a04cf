//! `Runtime` abstracts the bits of the OS the worker runtime touches so
//! components (the janitor's retention math, the identifier clock) can be
//! driven deterministically in tests instead of racing the wall clock.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;

/// A handle to a spawned background task. Dropping it does not cancel the
/// task; call [`SpawnHandle::shutdown`] explicitly.
pub trait SpawnHandle: Send + Sync {
    fn shutdown(&self);
}

struct TokioSpawnHandle(tokio::task::JoinHandle<()>);

impl SpawnHandle for TokioSpawnHandle {
    fn shutdown(&self) {
        self.0.abort();
    }
}

/// Clock + task-spawning abstraction. Implementations: [`ProdRuntime`] (real
/// tokio, wall clock) and [`TestRuntime`] (manually-advanced virtual clock,
/// no sleeping).
#[async_trait]
pub trait Runtime: Clone + Send + Sync + 'static {
    /// Milliseconds since the Unix epoch.
    fn unix_timestamp_millis(&self) -> u64;

    async fn wait(&self, duration: Duration);

    fn spawn(
        &self,
        name: &'static str,
        future: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle>;
}

/// Production runtime: real wall clock, real tokio tasks.
#[derive(Clone, Default)]
pub struct ProdRuntime;

#[async_trait]
impl Runtime for ProdRuntime {
    fn unix_timestamp_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the Unix epoch")
            .as_millis() as u64
    }

    async fn wait(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn spawn(
        &self,
        name: &'static str,
        future: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        let handle = tokio::task::Builder::new()
            .name(name)
            .spawn(future)
            .unwrap_or_else(|_| tokio::spawn(future));
        Box::new(TokioSpawnHandle(handle))
    }
}

/// Deterministic runtime for tests: the clock only advances when
/// [`TestRuntime::advance`] is called, and [`Runtime::wait`] resolves
/// immediately against the current virtual time rather than sleeping.
#[derive(Clone)]
pub struct TestRuntime {
    millis: Arc<AtomicU64>,
    spawned: Arc<Mutex<Vec<tokio::task::JoinHandle<()>>>>,
}

impl TestRuntime {
    pub fn new(start_millis: u64) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(start_millis)),
            spawned: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.millis
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }
}

struct NoopSpawnHandle;
impl SpawnHandle for NoopSpawnHandle {
    fn shutdown(&self) {}
}

#[async_trait]
impl Runtime for TestRuntime {
    fn unix_timestamp_millis(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }

    async fn wait(&self, _duration: Duration) {
        // Tests drive time explicitly via `advance`; don't actually sleep.
        tokio::task::yield_now().await;
    }

    fn spawn(
        &self,
        _name: &'static str,
        future: impl Future<Output = ()> + Send + 'static,
    ) -> Box<dyn SpawnHandle> {
        let handle = tokio::spawn(future);
        self.spawned.lock().unwrap().push(handle);
        Box::new(NoopSpawnHandle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_runtime_clock_only_moves_on_advance() {
        let rt = TestRuntime::new(1_000);
        assert_eq!(rt.unix_timestamp_millis(), 1_000);
        rt.wait(Duration::from_secs(60)).await;
        assert_eq!(rt.unix_timestamp_millis(), 1_000);
        rt.advance(Duration::from_secs(60));
        assert_eq!(rt.unix_timestamp_millis(), 61_000);
    }

    #[tokio::test]
    async fn prod_runtime_clock_is_monotonic() {
        let rt = ProdRuntime;
        let t0 = rt.unix_timestamp_millis();
        rt.wait(Duration::from_millis(5)).await;
        let t1 = rt.unix_timestamp_millis();
        assert!(t1 >= t0);
    }
}
