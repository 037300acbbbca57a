//! The per-node maintenance control loop.
//!
//! A pass reconciles state with the schema, then runs the three maintenance
//! operations round-robin, one batch per step, until none of them has work
//! left. The task then parks until `request_update` wakes it. A request that
//! arrives mid-pass cancels the pass; operations stop within one batch and the
//! next pass starts from persisted progress.

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{
            AtomicBool,
            Ordering,
        },
        Arc,
    },
    time::{
        Duration,
        SystemTime,
    },
};

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{
    watch,
    Notify,
};
use tokio_util::sync::CancellationToken;

use crate::{
    clean_primary::PrimaryCleaner,
    clean_secondary::SecondaryCleaner,
    config::MaintenanceConfig,
    context::{
        HandleSnapshot,
        MaintenanceContext,
        MaintenanceServices,
        Outcome,
    },
    metrics::log_retry,
    populate::SecondaryPopulator,
    reconcile::Reconciler,
    retry::RetryTier,
    runtime::{
        shutdown_and_join,
        Runtime,
        SpawnHandle,
    },
    schema::SchemaRegistry,
    shutdown::ShutdownSignal,
    state::SecondaryIndexState,
    types::{
        IndexName,
        TableId,
    },
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum MaintenanceOp {
    Populate,
    CleanPrimary,
    CleanSecondary,
}

impl MaintenanceOp {
    const ALL: [MaintenanceOp; 3] = [
        MaintenanceOp::Populate,
        MaintenanceOp::CleanPrimary,
        MaintenanceOp::CleanSecondary,
    ];
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Reconciling,
    Running(MaintenanceOp),
    Stopped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    /// Number of times the scheduler parked with no outstanding work.
    pub idle_passes: u64,
}

struct SchedulerShared {
    update_requested: AtomicBool,
    wake: Notify,
    shut_down: AtomicBool,
    pass_token: Mutex<CancellationToken>,
    status: watch::Sender<SchedulerStatus>,
}

impl SchedulerShared {
    fn request_update(&self) -> bool {
        if self.shut_down.load(Ordering::SeqCst) {
            return false;
        }
        self.update_requested.store(true, Ordering::SeqCst);
        self.pass_token.lock().cancel();
        self.wake.notify_one();
        true
    }

    fn set_state(&self, state: SchedulerState) {
        self.status.send_if_modified(|status| {
            let modified = status.state != state;
            status.state = state;
            modified
        });
    }
}

enum PassEnd {
    Done,
    Cancelled,
    Restart,
}

pub struct MaintenanceScheduler<RT: Runtime> {
    ctx: Arc<MaintenanceContext<RT>>,
    schema: Arc<SchemaRegistry>,
    shared: Arc<SchedulerShared>,
    shutdown_signal: ShutdownSignal,
    handle: Mutex<Option<SpawnHandle>>,
    ownership_listener: Mutex<Option<SpawnHandle>>,
}

impl<RT: Runtime> MaintenanceScheduler<RT> {
    pub fn new(
        rt: RT,
        config: MaintenanceConfig,
        schema: Arc<SchemaRegistry>,
        services: MaintenanceServices,
        shutdown_signal: ShutdownSignal,
    ) -> Self {
        let (status, _) = watch::channel(SchedulerStatus {
            state: SchedulerState::Idle,
            idle_passes: 0,
        });
        Self {
            ctx: Arc::new(MaintenanceContext::new(rt, config, services)),
            schema,
            shared: Arc::new(SchedulerShared {
                update_requested: AtomicBool::new(false),
                wake: Notify::new(),
                shut_down: AtomicBool::new(false),
                pass_token: Mutex::new(CancellationToken::new()),
                status,
            }),
            shutdown_signal,
            handle: Mutex::new(None),
            ownership_listener: Mutex::new(None),
        }
    }

    /// Spawn the control loop with an initial pass requested. Does nothing if
    /// already started or if maintenance is disabled.
    pub fn start(&self) {
        if !self.ctx.config.enabled {
            tracing::error!("Index maintenance is disabled, not starting the scheduler");
            return;
        }
        let mut handle = self.handle.lock();
        if handle.is_some() || self.shared.shut_down.load(Ordering::SeqCst) {
            return;
        }
        self.shared.update_requested.store(true, Ordering::SeqCst);
        let worker = SchedulerLoop {
            ctx: self.ctx.clone(),
            shared: self.shared.clone(),
            shutdown_signal: self.shutdown_signal.clone(),
            reconciler: Reconciler::new(self.ctx.clone(), self.schema.clone()),
            populator: SecondaryPopulator::new(self.ctx.clone()),
            primary_cleaner: PrimaryCleaner::new(self.ctx.clone()),
            secondary_cleaner: SecondaryCleaner::new(self.ctx.clone()),
        };
        *handle = Some(self.ctx.rt.spawn("index_maintenance_scheduler", worker.run()));
        *self.ownership_listener.lock() = Some(self.spawn_ownership_listener());
    }

    /// Losing a partition leaves its secondary index entries behind, so every
    /// loss starts a new pass.
    fn spawn_ownership_listener(&self) -> SpawnHandle {
        let mut ownership = self.ctx.interlock.subscribe_ownership();
        let shared = self.shared.clone();
        self.ctx
            .rt
            .spawn("index_maintenance_ownership_listener", async move {
                let mut previous = ownership.borrow_and_update().clone();
                while ownership.changed().await.is_ok() {
                    let owned = ownership.borrow_and_update().clone();
                    if previous.difference(&owned).next().is_some() {
                        tracing::info!("Partition ownership shrank to {owned:?}");
                        if !shared.request_update() {
                            return;
                        }
                    }
                    previous = owned;
                }
            })
    }

    /// Ask for a reconciliation pass, cancelling the current one. Returns
    /// false once the scheduler has been shut down.
    pub fn request_update(&self) -> bool {
        self.shared.request_update()
    }

    /// Stop the control loop and wait for it to exit. Progress committed by
    /// completed batches is kept.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        self.shared.shut_down.store(true, Ordering::SeqCst);
        self.shared.pass_token.lock().cancel();
        let listener = self.ownership_listener.lock().take();
        if let Some(listener) = listener {
            shutdown_and_join(listener).await?;
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            shutdown_and_join(handle).await?;
        }
        self.shared.set_state(SchedulerState::Stopped);
        tracing::info!("Index maintenance scheduler shut down");
        Ok(())
    }

    pub fn is_busy_maintenance(&self) -> bool {
        self.ctx.busy.is_busy()
    }

    /// Queue a rebuild of `index`. Reports made before the rebuild starts are
    /// coalesced into one.
    pub fn report_index_corruption(&self, index: IndexName) -> bool {
        if self.ctx.requests.request_reset(index.clone()) {
            tracing::warn!("Corruption reported for {index}");
        }
        self.request_update()
    }

    /// Mark every index that has not failed as needing a cleaning pass.
    pub fn request_secondary_cleaning(&self) -> bool {
        self.ctx.requests.request_cleaning();
        self.request_update()
    }

    pub async fn add_index_complete(&self, index: &IndexName) -> anyhow::Result<bool> {
        self.ctx
            .state
            .index_build_complete(&self.schema.current(), index)
            .await
    }

    pub async fn remove_table_data_complete(&self, table: TableId) -> anyhow::Result<bool> {
        self.ctx
            .state
            .table_data_removed(&self.schema.current(), table)
            .await
    }

    pub async fn index_status(
        &self,
        index: &IndexName,
    ) -> anyhow::Result<Option<SecondaryIndexState>> {
        Ok(self
            .ctx
            .state
            .get_index(index)
            .await?
            .map(|record| record.value))
    }

    pub fn subscribe(&self) -> watch::Receiver<SchedulerStatus> {
        self.shared.status.subscribe()
    }

    /// Wait until the scheduler parks with no pending request. Fails if it
    /// stops instead.
    pub async fn wait_for_quiescence(&self) -> anyhow::Result<()> {
        let mut status = self.shared.status.subscribe();
        loop {
            {
                let current = status.borrow_and_update();
                match current.state {
                    SchedulerState::Stopped => {
                        anyhow::bail!("Index maintenance scheduler stopped")
                    },
                    SchedulerState::Idle
                        if !self.shared.update_requested.load(Ordering::SeqCst)
                            && self.handle.lock().is_some() =>
                    {
                        return Ok(());
                    },
                    _ => {},
                }
            }
            status.changed().await?;
        }
    }
}

struct SchedulerLoop<RT: Runtime> {
    ctx: Arc<MaintenanceContext<RT>>,
    shared: Arc<SchedulerShared>,
    shutdown_signal: ShutdownSignal,
    reconciler: Reconciler<RT>,
    populator: SecondaryPopulator<RT>,
    primary_cleaner: PrimaryCleaner<RT>,
    secondary_cleaner: SecondaryCleaner<RT>,
}

impl<RT: Runtime> SchedulerLoop<RT> {
    async fn run(mut self) {
        tracing::info!("Starting index maintenance scheduler");
        loop {
            if self.shared.shut_down.load(Ordering::SeqCst) {
                return;
            }
            // A request that lands after the token is replaced cancels this
            // pass; one that landed before is consumed by the swap below.
            let token = {
                let mut token = self.shared.pass_token.lock();
                *token = CancellationToken::new();
                token.clone()
            };
            self.shared.set_state(SchedulerState::Reconciling);
            if !self.shared.update_requested.swap(false, Ordering::SeqCst) {
                self.shared.status.send_modify(|status| {
                    status.state = SchedulerState::Idle;
                    status.idle_passes += 1;
                });
                tracing::debug!("Index maintenance is idle");
                self.shared.wake.notified().await;
                continue;
            }

            let handles = match self.reconcile(&token).await {
                Ok(Some(handles)) => handles,
                Ok(None) => continue,
                Err(e) => return self.fatal(e),
            };
            match self.run_operations(&handles, &token).await {
                Ok(PassEnd::Done) => tracing::debug!("Maintenance pass finished"),
                Ok(PassEnd::Cancelled) => tracing::debug!("Maintenance pass cancelled"),
                Ok(PassEnd::Restart) => {
                    self.shared.update_requested.store(true, Ordering::SeqCst);
                },
                Err(e) => return self.fatal(e),
            }
        }
    }

    /// Returns `None` if the pass was cancelled while retrying.
    async fn reconcile(
        &mut self,
        token: &CancellationToken,
    ) -> anyhow::Result<Option<HandleSnapshot>> {
        loop {
            if token.is_cancelled() {
                return Ok(None);
            }
            match self.reconciler.reconcile().await {
                Ok(handles) => return Ok(Some(handles)),
                Err(e) => {
                    let delay = self.retry_delay(e, "reconciliation")?;
                    if !self.sleep(delay, token).await {
                        return Ok(None);
                    }
                },
            }
        }
    }

    async fn run_operations(
        &mut self,
        handles: &HandleSnapshot,
        token: &CancellationToken,
    ) -> anyhow::Result<PassEnd> {
        let mut retry_at: BTreeMap<MaintenanceOp, SystemTime> = BTreeMap::new();
        loop {
            let mut progressed = false;
            let mut done = 0;
            for op in MaintenanceOp::ALL {
                if token.is_cancelled() {
                    return Ok(PassEnd::Cancelled);
                }
                let now = self.ctx.rt.system_time();
                if retry_at.get(&op).is_some_and(|deadline| *deadline > now) {
                    continue;
                }
                retry_at.remove(&op);
                self.shared.set_state(SchedulerState::Running(op));
                match self.step(op, handles, token).await {
                    Outcome::Progress => progressed = true,
                    Outcome::Retry(delay) => {
                        retry_at.insert(op, now + delay);
                    },
                    Outcome::Restart => return Ok(PassEnd::Restart),
                    Outcome::Done => done += 1,
                    Outcome::Fatal(e) => return Err(e),
                }
            }
            if done == MaintenanceOp::ALL.len() {
                return Ok(PassEnd::Done);
            }
            if !progressed {
                let now = self.ctx.rt.system_time();
                let wait = retry_at
                    .values()
                    .min()
                    .map(|deadline| deadline.duration_since(now).unwrap_or_default())
                    .unwrap_or_default();
                if !self.sleep(wait, token).await {
                    return Ok(PassEnd::Cancelled);
                }
            }
        }
    }

    async fn step(
        &self,
        op: MaintenanceOp,
        handles: &HandleSnapshot,
        token: &CancellationToken,
    ) -> Outcome {
        let result = match op {
            MaintenanceOp::Populate => self.populator.step(handles).await,
            MaintenanceOp::CleanPrimary => self.primary_cleaner.step().await,
            MaintenanceOp::CleanSecondary => self.secondary_cleaner.step(handles, token).await,
        };
        match result {
            Ok(outcome) => outcome,
            Err(e) => match self.retry_delay(e, &format!("{op:?}")) {
                Ok(delay) => Outcome::Retry(delay),
                Err(e) => Outcome::Fatal(e),
            },
        }
    }

    /// Jittered delay for a transient fault, or the error back if it is not
    /// retriable.
    fn retry_delay(&self, e: anyhow::Error, what: &str) -> anyhow::Result<Duration> {
        let Some(tier) = RetryTier::classify(&e) else {
            return Err(e);
        };
        let delay = self
            .ctx
            .rt
            .with_rng(|rng| tier.delay(&self.ctx.config, rng));
        log_retry(tier);
        tracing::warn!("{what} hit a transient fault, retrying in {delay:?}: {e:#}");
        Ok(delay)
    }

    /// Returns false if `token` fired first.
    async fn sleep(&self, delay: Duration, token: &CancellationToken) -> bool {
        let cancelled = token.cancelled().fuse();
        let mut wait = self.ctx.rt.wait(delay);
        futures::pin_mut!(cancelled);
        futures::select_biased! {
            _ = cancelled => false,
            _ = wait => true,
        }
    }

    fn fatal(&self, e: anyhow::Error) {
        self.shared.set_state(SchedulerState::Stopped);
        self.shutdown_signal.signal(e);
    }
}
