//! Secondary index population. Each step scans one batch of one partition
//! for one index and persists the cursor, so a build survives restarts and
//! interleaves fairly with the other maintenance operations.

use std::{
    sync::Arc,
    time::SystemTime,
};

use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
use itertools::Itertools;

use crate::{
    context::{
        HandleSnapshot,
        MaintenanceContext,
        Outcome,
    },
    metrics::{
        log_index_populated,
        log_num_indexes_populating,
        log_permanent_failure,
        log_permit_timeout,
        log_rows_populated,
        log_unavailable_table_skip,
        populate_batch_timer,
    },
    retry::RetryTier,
    runtime::Runtime,
    state::{
        IndexPhase,
        SecondaryIndexState,
    },
    store::IndexHandle,
    types::{
        IndexName,
        PartitionId,
        RowKind,
    },
};

pub(crate) struct SecondaryPopulator<RT: Runtime> {
    ctx: Arc<MaintenanceContext<RT>>,
}

impl<RT: Runtime> SecondaryPopulator<RT> {
    pub fn new(ctx: Arc<MaintenanceContext<RT>>) -> Self {
        Self { ctx }
    }

    /// Populate one batch of the least recently visited index that can make
    /// progress.
    pub async fn step(&self, handles: &HandleSnapshot) -> anyhow::Result<Outcome> {
        let candidates = self
            .ctx
            .state
            .load_indexes()
            .await?
            .into_values()
            .map(|record| record.value)
            .filter(|state| state.phase() == IndexPhase::Populating)
            .sorted_by(|a, b| {
                (a.last_pass_time_ms, &a.index).cmp(&(b.last_pass_time_ms, &b.index))
            })
            .collect_vec();
        log_num_indexes_populating(candidates.len());
        if candidates.is_empty() {
            return Ok(Outcome::Done);
        }

        let now = self.ctx.rt.system_time();
        let mut earliest_deadline: Option<SystemTime> = None;
        for state in candidates {
            let Some(handle) = handles.get(&state.index) else {
                tracing::info!(
                    "Skipping population of {}: table is not available",
                    state.index
                );
                log_unavailable_table_skip();
                self.bump_pass_time(&state.index).await?;
                continue;
            };
            if let Some(deadline) = self.ctx.tracker.throttle_deadline(state.table_id, now) {
                tracing::debug!("Table {} is throttled, skipping {}", state.table_id, state.index);
                earliest_deadline = Some(match earliest_deadline {
                    Some(current) => current.min(deadline),
                    None => deadline,
                });
                continue;
            }
            return self.populate_batch(state, handle.clone()).await;
        }

        let delay = match earliest_deadline {
            Some(deadline) => deadline.duration_since(now).unwrap_or_default(),
            None => self.ctx.config.short_retry,
        };
        Ok(Outcome::Retry(delay))
    }

    async fn populate_batch(
        &self,
        state: SecondaryIndexState,
        handle: Arc<dyn IndexHandle>,
    ) -> anyhow::Result<Outcome> {
        let owned = self.ctx.interlock.owned_partitions();
        let partition = match state.current_partition {
            Some(partition) => partition,
            None => match owned
                .iter()
                .find(|p| !state.completed_partitions.contains(p))
            {
                Some(partition) => *partition,
                None => return self.finish_population(state, handle).await,
            },
        };

        let permit = self
            .ctx
            .permits
            .acquire(&self.ctx.rt, self.ctx.config.permit_timeout)
            .await;
        if permit.is_none() {
            tracing::warn!(
                "Timed out waiting for a maintenance permit, populating {} without one",
                state.index
            );
            log_permit_timeout();
        }

        let timer = populate_batch_timer();
        let result = self.populate_partition(&state, &handle, partition).await;
        drop(timer);
        match result {
            Ok(()) => Ok(Outcome::Progress),
            Err(e) => self.handle_failure(&state, partition, e).await,
        }
    }

    async fn populate_partition(
        &self,
        state: &SecondaryIndexState,
        handle: &Arc<dyn IndexHandle>,
        partition: PartitionId,
    ) -> anyhow::Result<()> {
        let batch_size = self.ctx.config.populate_batch_size;
        let after: &[u8] = if state.current_partition == Some(partition) {
            &state.last_key
        } else {
            &[]
        };
        let records = self
            .ctx
            .store
            .scan_keys(partition, after, batch_size)
            .await?;
        let partition_complete = records.len() < batch_size;
        let last_key = records.last().map(|record| record.primary_key.clone());

        let keys = records
            .into_iter()
            .filter(|record| record.table == state.table_id && record.kind == RowKind::Live)
            .map(|record| record.primary_key)
            .collect_vec();
        if !keys.is_empty() {
            let rows = self.ctx.store.read_locked(partition, &keys).await?;
            handle.populate(&rows).await?;
            log_rows_populated(rows.len());
        }

        let generation = state.rebuild_generation;
        let now_ms = self.ctx.rt.unix_timestamp_ms();
        self.ctx
            .state
            .update_index(&state.index, |s| {
                if s.rebuild_generation != generation || !s.populating {
                    anyhow::bail!(ErrorMetadata::system_occ());
                }
                match last_key {
                    Some(last_key) if !partition_complete => s.advance(partition, last_key),
                    _ => s.finish_partition(partition),
                }
                s.last_pass_time_ms = now_ms;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn handle_failure(
        &self,
        state: &SecondaryIndexState,
        partition: PartitionId,
        e: anyhow::Error,
    ) -> anyhow::Result<Outcome> {
        if e.is_index_corrupted() {
            tracing::error!("Index {} is corrupted, scheduling a rebuild: {e:#}", state.index);
            self.ctx.requests.request_reset(state.index.clone());
            return Ok(Outcome::Restart);
        }
        if e.is_table_unavailable() {
            tracing::info!("Table for {} became unavailable: {e:#}", state.index);
            log_unavailable_table_skip();
            self.bump_pass_time(&state.index).await?;
            return Ok(Outcome::Retry(self.ctx.config.short_retry));
        }
        if e.is_partition_not_owned() {
            tracing::info!(
                "Partition {partition} left this node while populating {}",
                state.index
            );
            let generation = state.rebuild_generation;
            self.ctx
                .state
                .update_index(&state.index, |s| {
                    if s.rebuild_generation == generation && s.populating {
                        s.finish_partition(partition);
                    }
                    Ok(())
                })
                .await?;
            return Ok(Outcome::Progress);
        }
        if RetryTier::classify(&e).is_some() {
            return Err(e);
        }

        tracing::error!("Population of {} failed permanently: {e:#}", state.index);
        log_permanent_failure();
        let message = format!("{e:#}");
        self.ctx
            .state
            .update_index(&state.index, |s| {
                s.mark_failed(message);
                Ok(())
            })
            .await?;
        Ok(Outcome::Progress)
    }

    /// No owned partition is left to scan. Completion waits until no
    /// migration target is running, since an incoming partition would not be
    /// covered.
    async fn finish_population(
        &self,
        state: SecondaryIndexState,
        handle: Arc<dyn IndexHandle>,
    ) -> anyhow::Result<Outcome> {
        if !self.ctx.interlock.target_idle() {
            tracing::debug!(
                "Waiting for incoming partitions before completing {}",
                state.index
            );
            return Ok(Outcome::Retry(self.ctx.config.short_retry));
        }
        let owned = self.ctx.interlock.owned_partitions();
        if owned
            .iter()
            .any(|p| !state.completed_partitions.contains(p))
        {
            return Ok(Outcome::Progress);
        }
        let needs_cleaning = state
            .completed_partitions
            .iter()
            .any(|p| !owned.contains(p));

        let generation = state.rebuild_generation;
        let updated = self
            .ctx
            .state
            .update_index(&state.index, |s| {
                if s.rebuild_generation != generation || !s.populating {
                    anyhow::bail!(ErrorMetadata::system_occ());
                }
                s.finish_population(needs_cleaning);
                Ok(())
            })
            .await?;
        if updated.is_some() {
            handle.set_incremental_population(false);
            log_index_populated();
            tracing::info!(
                "Finished populating {} (needs cleaning: {needs_cleaning})",
                state.index
            );
        }
        Ok(Outcome::Progress)
    }

    async fn bump_pass_time(&self, index: &IndexName) -> anyhow::Result<()> {
        let now_ms = self.ctx.rt.unix_timestamp_ms();
        self.ctx
            .state
            .update_index(index, |s| {
                s.last_pass_time_ms = now_ms;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
