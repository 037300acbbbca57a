//! Logical deletion of the rows of dropped tables.

use std::sync::Arc;

use crate::{
    context::{
        MaintenanceContext,
        Outcome,
    },
    metrics::log_table_extinguished,
    runtime::Runtime,
};

pub(crate) struct PrimaryCleaner<RT: Runtime> {
    ctx: Arc<MaintenanceContext<RT>>,
}

impl<RT: Runtime> PrimaryCleaner<RT> {
    pub fn new(ctx: Arc<MaintenanceContext<RT>>) -> Self {
        Self { ctx }
    }

    pub async fn step(&self) -> anyhow::Result<Outcome> {
        let Some(current) = self
            .ctx
            .state
            .load_tables()
            .await?
            .into_values()
            .find(|record| !record.value.done)
        else {
            return Ok(Outcome::Done);
        };
        let table_id = current.value.table_id;

        let pinned = self.ctx.barrier.pinned_before(current.value.marked_at);
        if pinned > 0 {
            tracing::debug!(
                "Waiting for {pinned} operations older than schema {} before dropping table {}",
                current.value.marked_at,
                current.value.table
            );
            return Ok(Outcome::Retry(self.ctx.config.short_retry));
        }

        // Incoming first: a target that completes between the two queries
        // has already been added to the owned set.
        let mut segments = self.ctx.interlock.incoming_partitions();
        segments.extend(self.ctx.interlock.owned_partitions());

        self.ctx
            .store
            .extinguish_records(table_id, &segments)
            .await?;
        let table = self
            .ctx
            .state
            .update_table(current, |state| {
                state.completed_partitions.extend(segments.iter().copied());
                state.done = true;
            })
            .await?;
        log_table_extinguished();
        tracing::info!(
            "Extinguished records of dropped table {} ({table_id}) in {} partitions",
            table.table,
            table.completed_partitions.len()
        );
        Ok(Outcome::Progress)
    }
}
