//! Brings persisted maintenance state and the open index handles in line
//! with the visible schema. Runs only on the scheduler task.

use std::{
    collections::{
        BTreeMap,
        BTreeSet,
    },
    sync::Arc,
};

use errors::ErrorMetadataAnyhowExt;

use crate::{
    context::{
        HandleSnapshot,
        MaintenanceContext,
    },
    metrics::{
        log_corruption_reset,
        log_permanent_failure,
        reconcile_timer,
    },
    runtime::Runtime,
    schema::{
        SchemaRegistry,
        SchemaSnapshot,
    },
    state::{
        DeletedTableState,
        IndexPhase,
        OwnedPartitionsState,
        SecondaryIndexState,
        Versioned,
    },
    store::IndexHandle,
    types::{
        IndexName,
        PartitionId,
        SchemaSeq,
    },
};

pub(crate) struct Reconciler<RT: Runtime> {
    ctx: Arc<MaintenanceContext<RT>>,
    schema: Arc<SchemaRegistry>,
    last_seq: Option<SchemaSeq>,
    applied_cleaning_epoch: u64,
    handles: BTreeMap<IndexName, Arc<dyn IndexHandle>>,
}

impl<RT: Runtime> Reconciler<RT> {
    pub fn new(ctx: Arc<MaintenanceContext<RT>>, schema: Arc<SchemaRegistry>) -> Self {
        Self {
            ctx,
            schema,
            last_seq: None,
            applied_cleaning_epoch: 0,
            handles: BTreeMap::new(),
        }
    }

    pub async fn reconcile(&mut self) -> anyhow::Result<HandleSnapshot> {
        let timer = reconcile_timer();
        let snapshot = self.schema.current();
        let owned = self.ctx.interlock.owned_partitions();
        let cleaning_epoch = self.ctx.requests.cleaning_epoch();

        // Compared against the persisted set so losses that happened while no
        // scheduler was running are noticed too.
        let recorded = self.ctx.state.get_owned_partitions().await?;
        let lost_partitions: BTreeSet<PartitionId> = match &recorded {
            Some(previous) => previous
                .value
                .partitions
                .difference(&owned)
                .copied()
                .collect(),
            None => BTreeSet::new(),
        };
        let mark_cleaning =
            !lost_partitions.is_empty() || cleaning_epoch != self.applied_cleaning_epoch;
        let schema_changed = self.last_seq != Some(snapshot.seq);

        if schema_changed || mark_cleaning || self.ctx.requests.has_resets() {
            tracing::info!(
                "Reconciling maintenance state at schema {} (lost partitions: {lost_partitions:?})",
                snapshot.seq
            );
            self.reconcile_indexes(&snapshot, mark_cleaning, !lost_partitions.is_empty())
                .await?;
            self.reconcile_tables(&snapshot).await?;
            self.apply_resets(&snapshot).await?;
            self.ctx
                .tracker
                .update_schema(&snapshot, self.ctx.rt.system_time());
            self.last_seq = Some(snapshot.seq);
            self.applied_cleaning_epoch = cleaning_epoch;
        } else {
            self.open_missing_handles(&snapshot).await?;
        }
        // Only recorded once every affected index is marked for cleaning.
        if recorded.as_ref().map(|r| &r.value.partitions) != Some(&owned) {
            self.ctx
                .state
                .put_owned_partitions(
                    &OwnedPartitionsState { partitions: owned },
                    recorded.map(|r| r.version),
                )
                .await?;
        }
        timer.finish();
        Ok(Arc::new(self.handles.clone()))
    }

    /// `restart_cleaning` is set when partitions were lost: entries behind an
    /// in-progress cleaning cursor may belong to them, so the scan restarts.
    async fn reconcile_indexes(
        &mut self,
        snapshot: &SchemaSnapshot,
        mark_cleaning: bool,
        restart_cleaning: bool,
    ) -> anyhow::Result<()> {
        let now_ms = self.ctx.rt.unix_timestamp_ms();
        let mut records = self.ctx.state.load_indexes().await?;

        let dropped: BTreeSet<IndexName> = records
            .keys()
            .chain(self.handles.keys())
            .filter(|name| !snapshot.indexes.contains_key(*name))
            .cloned()
            .collect();
        for name in dropped {
            self.handles.remove(&name);
            self.ctx.store.close_index(&name).await?;
            self.ctx.store.remove_index(&name).await?;
            if let Some(record) = records.remove(&name) {
                self.ctx.state.delete_index(&name, record.version).await?;
            }
            self.ctx.requests.complete_reset(&name);
            tracing::info!("Removed index {name}, it is no longer in the schema");
        }

        for (name, index) in &snapshot.indexes {
            match records.get(name) {
                None if !index.ready => {
                    let state = SecondaryIndexState::new_populating(name.clone(), index.table, now_ms);
                    self.ctx.state.create_index(&state).await?;
                    tracing::info!("Scheduled population of new index {name}");
                },
                None if mark_cleaning => {
                    let state = SecondaryIndexState::new_cleaning(name.clone(), index.table, now_ms);
                    self.ctx.state.create_index(&state).await?;
                },
                None => {},
                Some(Versioned { value, version }) if mark_cleaning => {
                    // Populating indexes may already hold entries for a lost
                    // partition, written incrementally before it was scanned.
                    let mut state = value.clone();
                    if state.request_cleaning(restart_cleaning) {
                        self.ctx.state.put_index(&state, *version).await?;
                        tracing::info!("Scheduled cleaning of {name} ({:?})", value.phase());
                    }
                },
                Some(Versioned { value, version })
                    if value.phase() == IndexPhase::Idle && index.ready =>
                {
                    self.ctx.state.delete_index(name, *version).await?;
                },
                Some(_) => {},
            }
        }
        self.open_missing_handles(snapshot).await
    }

    /// Open handles for every schema index that has none yet. Tables that are
    /// not established on this node are skipped until a later pass.
    async fn open_missing_handles(&mut self, snapshot: &SchemaSnapshot) -> anyhow::Result<()> {
        let records = self.ctx.state.load_indexes().await?;
        for (name, index) in &snapshot.indexes {
            if !self.handles.contains_key(name) {
                match self.ctx.store.open_index(index).await {
                    Ok(handle) => {
                        self.handles.insert(name.clone(), handle);
                    },
                    Err(e) if e.is_table_unavailable() => {
                        tracing::warn!("Not opening {name} yet: {e:#}");
                        continue;
                    },
                    Err(e) => return Err(e),
                }
            }
            if let (Some(handle), Some(record)) = (self.handles.get(name), records.get(name)) {
                if record.value.phase() == IndexPhase::Populating {
                    handle.set_incremental_population(true);
                }
            }
        }
        Ok(())
    }

    async fn reconcile_tables(&self, snapshot: &SchemaSnapshot) -> anyhow::Result<()> {
        let records = self.ctx.state.load_tables().await?;
        for (id, dropped) in &snapshot.dropped {
            if !records.contains_key(id) {
                let state = DeletedTableState::new(*id, dropped.name.clone(), dropped.dropped_at);
                self.ctx.state.create_table(&state).await?;
                tracing::info!("Scheduled removal of dropped table {} ({id})", dropped.name);
            }
        }
        for (id, record) in &records {
            if !snapshot.dropped.contains_key(id) {
                self.ctx.state.delete_table(record).await?;
            }
        }
        Ok(())
    }

    /// Rebuild indexes reported corrupt. A reset stays queued until it has
    /// been applied, so a report made while the table is unavailable is not
    /// lost.
    async fn apply_resets(&mut self, snapshot: &SchemaSnapshot) -> anyhow::Result<()> {
        for name in self.ctx.requests.resets() {
            let Some(index) = snapshot.indexes.get(&name) else {
                self.ctx.requests.complete_reset(&name);
                continue;
            };
            if !self.handles.contains_key(&name) {
                tracing::info!("Deferring rebuild of {name}, it is not open");
                continue;
            }
            self.handles.remove(&name);
            self.ctx.store.close_index(&name).await?;
            let handle = self.ctx.store.open_index(index).await?;
            handle.clear().await?;
            handle.set_incremental_population(true);
            self.handles.insert(name.clone(), handle);

            let now_ms = self.ctx.rt.unix_timestamp_ms();
            let retry_limit = self.ctx.config.corruption_retry_limit;
            let state = match self.ctx.state.get_index(&name).await? {
                Some(Versioned { mut value, version }) => {
                    value.reset_for_rebuild(now_ms, retry_limit);
                    self.ctx.state.put_index(&value, version).await?;
                    value
                },
                None => {
                    let mut value =
                        SecondaryIndexState::new_populating(name.clone(), index.table, now_ms);
                    value.reset_for_rebuild(now_ms, retry_limit);
                    self.ctx.state.create_index(&value).await?;
                    value
                },
            };
            log_corruption_reset();
            if state.phase() == IndexPhase::Failed {
                tracing::error!("Giving up on {name}: {:?}", state.error);
                log_permanent_failure();
            } else {
                tracing::warn!(
                    "Rebuilding corrupted index {name} (generation {})",
                    state.rebuild_generation
                );
            }
            self.ctx.requests.complete_reset(&name);
        }
        Ok(())
    }
}
