//! Removal of secondary index entries whose primary rows live in partitions
//! this node no longer owns.

use std::sync::Arc;

use errors::ErrorMetadata;
use tokio_util::sync::CancellationToken;

use crate::{
    context::{
        HandleSnapshot,
        MaintenanceContext,
        Outcome,
    },
    metrics::log_entries_cleaned,
    runtime::Runtime,
    state::IndexPhase,
};

pub(crate) struct SecondaryCleaner<RT: Runtime> {
    ctx: Arc<MaintenanceContext<RT>>,
}

impl<RT: Runtime> SecondaryCleaner<RT> {
    pub fn new(ctx: Arc<MaintenanceContext<RT>>) -> Self {
        Self { ctx }
    }

    pub async fn step(
        &self,
        handles: &HandleSnapshot,
        cancel: &CancellationToken,
    ) -> anyhow::Result<Outcome> {
        let cleaning: Vec<_> = self
            .ctx
            .state
            .load_indexes()
            .await?
            .into_values()
            .map(|record| record.value)
            .filter(|state| state.phase() == IndexPhase::Cleaning)
            .collect();
        let Some(state) = cleaning
            .iter()
            .find(|state| state.cleaning_cursor.is_some())
            .or_else(|| cleaning.first())
            .cloned()
        else {
            return Ok(Outcome::Done);
        };
        let Some(handle) = handles.get(&state.index).cloned() else {
            anyhow::bail!(ErrorMetadata::table_unavailable(format!(
                "Index {} is not open on this node",
                state.index
            )));
        };

        // Held until the batch ends, including the waits below.
        let _busy = self.ctx.busy.enter();
        if !self.ctx.interlock.await_source_idle(cancel).await
            || !self.ctx.interlock.await_idle(cancel).await
        {
            tracing::debug!("Secondary cleaning of {} interrupted", state.index);
            return Ok(Outcome::Progress);
        }

        let batch_size = self.ctx.config.clean_secondary_batch_size;
        let entries = handle
            .scan_entries(state.cleaning_cursor.as_ref(), batch_size)
            .await?;
        let owned = self.ctx.interlock.owned_partitions();
        let stale: Vec<_> = entries
            .iter()
            .filter(|entry| !owned.contains(&self.ctx.store.partition_of(&entry.primary_key)))
            .cloned()
            .collect();
        if !stale.is_empty() {
            handle.delete_entries(&stale).await?;
            log_entries_cleaned(stale.len());
        }

        let done = entries.len() < batch_size;
        let cursor = entries.last().cloned();
        let generation = state.rebuild_generation;
        self.ctx
            .state
            .update_index(&state.index, |s| {
                if s.rebuild_generation != generation || s.phase() != IndexPhase::Cleaning {
                    anyhow::bail!(ErrorMetadata::system_occ());
                }
                if done {
                    s.finish_cleaning();
                } else {
                    s.cleaning_cursor = cursor;
                }
                Ok(())
            })
            .await?;
        if done {
            tracing::info!("Finished cleaning stale entries of {}", state.index);
        }
        Ok(Outcome::Progress)
    }
}
