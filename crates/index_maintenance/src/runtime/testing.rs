use std::{
    future::Future,
    pin::Pin,
    sync::{
        Arc,
        LazyLock,
    },
    time::{
        Duration,
        SystemTime,
    },
};

use futures::{
    future::FusedFuture,
    FutureExt,
};
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha12Rng;

use super::{
    Runtime,
    SpawnHandle,
};

/// Wall-clock origin of every `TestRuntime`.
pub static TEST_EPOCH: LazyLock<SystemTime> =
    LazyLock::new(|| SystemTime::UNIX_EPOCH + Duration::from_secs(1620198000));

/// Deterministic runtime for tests. Must be created inside a tokio runtime
/// with a paused clock (`#[tokio::test(start_paused = true)]`): system time
/// is `TEST_EPOCH` plus however far tokio's virtual clock has advanced.
#[derive(Clone)]
pub struct TestRuntime {
    created_at: tokio::time::Instant,
    rng: Arc<Mutex<ChaCha12Rng>>,
}

impl TestRuntime {
    pub fn new() -> Self {
        Self::new_with_seed(0)
    }

    pub fn new_with_seed(seed: u64) -> Self {
        Self {
            created_at: tokio::time::Instant::now(),
            rng: Arc::new(Mutex::new(ChaCha12Rng::seed_from_u64(seed))),
        }
    }

    /// Advance the virtual clock. Timers that fire along the way wake their
    /// tasks.
    pub async fn advance(&self, duration: Duration) {
        tokio::time::advance(duration).await;
    }
}

impl Runtime for TestRuntime {
    type Rng = ChaCha12Rng;

    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>> {
        Box::pin(tokio::time::sleep(duration).fuse())
    }

    fn spawn(
        &self,
        _name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> SpawnHandle {
        SpawnHandle {
            handle: tokio::spawn(f),
        }
    }

    fn system_time(&self) -> SystemTime {
        *TEST_EPOCH + self.created_at.elapsed()
    }

    fn with_rng<R>(&self, f: impl FnOnce(&mut Self::Rng) -> R) -> R {
        f(&mut self.rng.lock())
    }
}
