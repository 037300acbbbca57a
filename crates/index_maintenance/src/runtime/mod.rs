//! Runtime trait for abstracting away time, task spawning and randomness so
//! the scheduler can run against the tokio executor in production and a
//! paused, seeded clock in tests.

use std::{
    future::Future,
    pin::Pin,
    time::{
        Duration,
        SystemTime,
        UNIX_EPOCH,
    },
};

use futures::{
    future::FusedFuture,
    FutureExt,
};
use rand::Rng;
use thiserror::Error;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

#[derive(Error, Debug)]
pub enum JoinError {
    #[error("Future canceled")]
    Canceled,
    #[error("Future panicked: {0:?}")]
    Panicked(anyhow::Error),
}

impl From<tokio::task::JoinError> for JoinError {
    fn from(e: tokio::task::JoinError) -> Self {
        if e.is_cancelled() {
            return JoinError::Canceled;
        }
        let panic = e.into_panic();
        let msg = match panic.downcast::<&str>() {
            Ok(s) => (*s).to_owned(),
            Err(panic) => match panic.downcast::<String>() {
                Ok(s) => *s,
                Err(_) => "non-string panic payload".to_owned(),
            },
        };
        JoinError::Panicked(anyhow::anyhow!(msg))
    }
}

/// Handle to a task started with `Runtime::spawn`.
pub struct SpawnHandle {
    handle: tokio::task::JoinHandle<()>,
}

impl SpawnHandle {
    pub fn shutdown(&mut self) {
        self.handle.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn join(self) -> Result<(), JoinError> {
        self.handle.await.map_err(JoinError::from)
    }
}

/// Shutdown the associated future, preempting it at its next yield point, and
/// join on its result.
pub async fn shutdown_and_join(mut handle: SpawnHandle) -> anyhow::Result<()> {
    handle.shutdown();
    if let Err(e) = handle.join().await {
        if !matches!(e, JoinError::Canceled) {
            return Err(e.into());
        }
    }
    Ok(())
}

/// Everything OS-like the maintenance engine touches. Engine code is generic
/// over this trait so tests can drive it on a virtual clock.
pub trait Runtime: Clone + Sync + Send + 'static {
    /// Source of randomness associated with the runtime.
    type Rng: Rng;

    /// Sleep for the given duration.
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>>;

    /// Spawn a future on the runtime's executor.
    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> SpawnHandle;

    /// Return (a potentially-virtualized) system time.
    fn system_time(&self) -> SystemTime;

    /// Milliseconds since the Unix epoch, as persisted in maintenance state.
    fn unix_timestamp_ms(&self) -> u64 {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or_default()
    }

    /// Use the runtime's source of randomness.
    fn with_rng<R>(&self, f: impl FnOnce(&mut Self::Rng) -> R) -> R;
}

/// Production runtime backed by the ambient tokio executor.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProdRuntime;

impl Runtime for ProdRuntime {
    type Rng = rand::rngs::ThreadRng;

    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        Box::pin(tokio::time::sleep(duration).fuse())
    }

    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> SpawnHandle {
        tracing::debug!("Spawning {name}");
        SpawnHandle {
            handle: tokio::spawn(f),
        }
    }

    fn system_time(&self) -> SystemTime {
        SystemTime::now()
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut Self::Rng) -> R) -> R {
        f(&mut rand::rng())
    }
}
