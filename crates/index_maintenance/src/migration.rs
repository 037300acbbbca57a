//! Interlock between maintenance and the partition migration subsystem.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
};

use async_trait::async_trait;
use errors::ErrorMetadata;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::types::PartitionId;

/// What maintenance needs to know about partition ownership and migration
/// activity on this node. The `await_*` methods return `false` if `cancel`
/// fired before the activity quiesced.
#[async_trait]
pub trait MigrationInterlock: Send + Sync {
    fn owned_partitions(&self) -> BTreeSet<PartitionId>;

    /// Partitions currently being received by an in-flight migration target.
    fn incoming_partitions(&self) -> BTreeSet<PartitionId>;

    fn target_idle(&self) -> bool;

    /// Published whenever the set of owned partitions changes.
    fn subscribe_ownership(&self) -> watch::Receiver<BTreeSet<PartitionId>>;

    async fn await_idle(&self, cancel: &CancellationToken) -> bool;

    async fn await_source_idle(&self, cancel: &CancellationToken) -> bool;

    async fn await_target_idle(&self, cancel: &CancellationToken) -> bool;
}

/// Set while secondary cleaning is waiting for or running a batch. The
/// migration subsystem refuses to start a target while it is set, so a
/// restarted target cannot collide with entries left by a failed attempt.
#[derive(Clone, Default)]
pub struct BusyMaintenance(Arc<AtomicBool>);

impl BusyMaintenance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_busy(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn enter(&self) -> BusyMaintenanceGuard {
        self.0.store(true, Ordering::SeqCst);
        BusyMaintenanceGuard(self.0.clone())
    }
}

pub struct BusyMaintenanceGuard(Arc<AtomicBool>);

impl Drop for BusyMaintenanceGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct MigrationState {
    owned: BTreeSet<PartitionId>,
    incoming: BTreeSet<PartitionId>,
    outgoing: BTreeSet<PartitionId>,
}

/// In-process bookkeeping of partition ownership and migrations, usable as
/// the node's `MigrationInterlock`.
pub struct MigrationTracker {
    state: Mutex<MigrationState>,
    changed: watch::Sender<u64>,
    ownership: watch::Sender<BTreeSet<PartitionId>>,
    busy: BusyMaintenance,
}

impl MigrationTracker {
    pub fn new(owned: impl IntoIterator<Item = PartitionId>, busy: BusyMaintenance) -> Self {
        let owned: BTreeSet<_> = owned.into_iter().collect();
        let (changed, _) = watch::channel(0);
        let (ownership, _) = watch::channel(owned.clone());
        Self {
            state: Mutex::new(MigrationState {
                owned,
                ..Default::default()
            }),
            changed,
            ownership,
            busy,
        }
    }

    fn modify(&self, f: impl FnOnce(&mut MigrationState) -> anyhow::Result<()>) -> anyhow::Result<()> {
        {
            let mut state = self.state.lock();
            f(&mut state)?;
            // Published under the lock so subscribers never see an older set
            // replace a newer one.
            self.ownership.send_if_modified(|owned| {
                if *owned == state.owned {
                    return false;
                }
                owned.clone_from(&state.owned);
                true
            });
        }
        self.changed.send_modify(|v| *v += 1);
        Ok(())
    }

    /// Begin receiving `partition`. Refused while secondary cleaning is busy.
    pub fn start_target(&self, partition: PartitionId) -> anyhow::Result<()> {
        if self.busy.is_busy() {
            anyhow::bail!(ErrorMetadata::overloaded(
                "MaintenanceBusy",
                format!("Cannot receive partition {partition} while secondary cleaning is pending"),
            ));
        }
        self.modify(|state| {
            if state.owned.contains(&partition) || !state.incoming.insert(partition) {
                anyhow::bail!(ErrorMetadata::bad_request(
                    "PartitionAlreadyPresent",
                    format!("Partition {partition} is already owned or incoming"),
                ));
            }
            Ok(())
        })
    }

    /// The partition becomes owned before it stops being incoming, so a
    /// reader that checks incoming first and owned second always sees it.
    pub fn finish_target(&self, partition: PartitionId) -> anyhow::Result<()> {
        self.modify(|state| {
            state.owned.insert(partition);
            state.incoming.remove(&partition);
            Ok(())
        })
    }

    pub fn abort_target(&self, partition: PartitionId) -> anyhow::Result<()> {
        self.modify(|state| {
            state.incoming.remove(&partition);
            Ok(())
        })
    }

    pub fn start_source(&self, partition: PartitionId) -> anyhow::Result<()> {
        self.modify(|state| {
            if !state.owned.contains(&partition) {
                anyhow::bail!(ErrorMetadata::partition_not_owned(partition));
            }
            state.outgoing.insert(partition);
            Ok(())
        })
    }

    pub fn finish_source(&self, partition: PartitionId) -> anyhow::Result<()> {
        self.modify(|state| {
            state.owned.remove(&partition);
            state.outgoing.remove(&partition);
            Ok(())
        })
    }

    pub fn abort_source(&self, partition: PartitionId) -> anyhow::Result<()> {
        self.modify(|state| {
            state.outgoing.remove(&partition);
            Ok(())
        })
    }

    async fn wait_until(
        &self,
        cancel: &CancellationToken,
        done: impl Fn(&MigrationState) -> bool + Send + Sync,
    ) -> bool {
        let mut changed = self.changed.subscribe();
        loop {
            if done(&self.state.lock()) {
                return true;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                r = changed.changed() => {
                    if r.is_err() {
                        return false;
                    }
                },
            }
        }
    }
}

#[async_trait]
impl MigrationInterlock for MigrationTracker {
    fn owned_partitions(&self) -> BTreeSet<PartitionId> {
        self.state.lock().owned.clone()
    }

    fn incoming_partitions(&self) -> BTreeSet<PartitionId> {
        self.state.lock().incoming.clone()
    }

    fn target_idle(&self) -> bool {
        self.state.lock().incoming.is_empty()
    }

    fn subscribe_ownership(&self) -> watch::Receiver<BTreeSet<PartitionId>> {
        self.ownership.subscribe()
    }

    async fn await_idle(&self, cancel: &CancellationToken) -> bool {
        self.wait_until(cancel, |s| s.incoming.is_empty() && s.outgoing.is_empty())
            .await
    }

    async fn await_source_idle(&self, cancel: &CancellationToken) -> bool {
        self.wait_until(cancel, |s| s.outgoing.is_empty()).await
    }

    async fn await_target_idle(&self, cancel: &CancellationToken) -> bool {
        self.wait_until(cancel, |s| s.incoming.is_empty()).await
    }
}
