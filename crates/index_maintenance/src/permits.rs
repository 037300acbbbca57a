use std::{
    sync::Arc,
    time::Duration,
};

use futures::FutureExt;
use tokio::sync::{
    OwnedSemaphorePermit,
    Semaphore,
};

use crate::runtime::Runtime;

/// Node-wide admission budget shared by background housekeeping work.
#[derive(Clone)]
pub struct MaintenancePermits {
    semaphore: Arc<Semaphore>,
}

impl MaintenancePermits {
    pub fn new(permits: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
        }
    }

    /// Wait up to `timeout` for a permit. `None` means the caller should
    /// proceed without one.
    pub async fn acquire<RT: Runtime>(
        &self,
        rt: &RT,
        timeout: Duration,
    ) -> Option<OwnedSemaphorePermit> {
        let acquire = self.semaphore.clone().acquire_owned().fuse();
        let mut wait = rt.wait(timeout);
        futures::pin_mut!(acquire);
        futures::select_biased! {
            permit = acquire => permit.ok(),
            _ = wait => None,
        }
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }
}
