//! Polling driver that drains the queue tick by tick.
//!
//! A single long-lived task wakes on a fixed interval, visits every
//! registered service in registration order, asks the scheduler for a
//! batch, then claims, dispatches and settles each selected row. Handler
//! failures never abort the tick; store read failures abort only the
//! affected service's iteration.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::registry::{HandlerRegistry, ServiceEntry, TaskHandler};
use crate::scheduler;
use crate::store::TaskStore;
use crate::task::{TaskRow, TaskStatus};

/// What happens to rows the handler failed, while retries remain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryMode {
    /// Walk the row back to pending so a later tick picks it up again.
    #[default]
    Requeue,
    /// Leave the row in failed for an external re-driver.
    Leave,
}

impl RetryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requeue => "requeue",
            Self::Leave => "leave",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "requeue" => Some(Self::Requeue),
            "leave" => Some(Self::Leave),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct PollingConfig {
    pub tick_interval: Duration,
    /// Failures allowed before a row is dead-lettered.
    pub max_retries: i32,
    pub retry_mode: RetryMode,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            max_retries: 3,
            retry_mode: RetryMode::default(),
        }
    }
}

/// Handle to the background polling task.
pub struct Poller {
    shutdown_tx: watch::Sender<bool>,
    cancel: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl Poller {
    pub fn start(
        config: PollingConfig,
        store: Arc<dyn TaskStore>,
        registry: Arc<HandlerRegistry>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cancel = CancellationToken::new();
        let task = PollerTask {
            config,
            store,
            registry,
            shutdown_rx,
            cancel: cancel.clone(),
        };
        let handle = tokio::spawn(async move {
            if let Err(err) = task.run().await {
                error!(?err, "poller terminated with error");
                Err(err)
            } else {
                Ok(())
            }
        });
        Self {
            shutdown_tx,
            cancel,
            handle,
        }
    }

    /// Stop issuing new claims and propagate cancel to in-flight handlers.
    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        self.cancel.cancel();
    }

    /// Shut down and wait for in-flight dispatches to settle.
    pub async fn shutdown(self) -> Result<()> {
        self.trigger_shutdown();
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!("poller task panicked: {err}")),
        }
    }
}

struct PollerTask {
    config: PollingConfig,
    store: Arc<dyn TaskStore>,
    registry: Arc<HandlerRegistry>,
    shutdown_rx: watch::Receiver<bool>,
    cancel: CancellationToken,
}

impl PollerTask {
    async fn run(mut self) -> Result<()> {
        info!(
            tick_interval_ms = self.config.tick_interval.as_millis(),
            max_retries = self.config.max_retries,
            retry_mode = self.config.retry_mode.as_str(),
            services = self.registry.len(),
            "starting poller",
        );

        let mut ticker = interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut inflight: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_tick(&mut inflight).await;
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_ok() && *self.shutdown_rx.borrow() {
                        info!("poller shutting down");
                        break;
                    }
                }
            }
        }

        // In-flight handlers have seen the cancel token; wait for their
        // rows to settle before returning.
        while inflight.join_next().await.is_some() {}
        Ok(())
    }

    async fn run_tick(&self, inflight: &mut JoinSet<()>) {
        // Reap finished dispatches so the set stays bounded.
        while inflight.try_join_next().is_some() {}

        for entry in self.registry.services() {
            if self.cancel.is_cancelled() {
                return;
            }
            if let Err(err) = self.run_service(entry, inflight).await {
                metrics::counter!(
                    "turnstile_tick_errors_total",
                    "service" => entry.policy.service_name.clone(),
                )
                .increment(1);
                warn!(
                    service = %entry.policy.service_name,
                    ?err,
                    "service iteration failed, resuming next tick"
                );
            }
        }
    }

    async fn run_service(&self, entry: &ServiceEntry, inflight: &mut JoinSet<()>) -> Result<()> {
        let policy = &entry.policy;
        let service = policy.service_name.as_str();

        let selected = scheduler::schedule(self.store.as_ref(), policy).await?;
        if selected.is_empty() {
            return Ok(());
        }
        debug!(service, count = selected.len(), "dispatching selected tasks");

        for task in selected {
            if self.cancel.is_cancelled() {
                break;
            }
            match self.store.claim(task.id).await {
                Ok(true) => {}
                Ok(false) => {
                    // Racing claimer or manual intervention; not an error.
                    debug!(task_id = %task.id, "task no longer pending, skipping");
                    continue;
                }
                Err(err) => {
                    warn!(task_id = %task.id, ?err, "claim failed");
                    continue;
                }
            }
            metrics::counter!("turnstile_tasks_claimed_total", "service" => service.to_string())
                .increment(1);

            let store = Arc::clone(&self.store);
            let handler = Arc::clone(&entry.handler);
            let config = self.config.clone();
            let cancel = self.cancel.clone();
            inflight.spawn(async move {
                dispatch_one(store, handler, config, task, cancel).await;
            });
        }

        if let Ok(count) = self.store.count_in_progress(service).await {
            metrics::gauge!("turnstile_in_progress", "service" => service.to_string())
                .set(count as f64);
        }
        if let Ok(count) = self.store.count_pending(service).await {
            metrics::gauge!("turnstile_pending", "service" => service.to_string())
                .set(count as f64);
        }

        Ok(())
    }
}

/// Run the handler for one claimed row and settle its status.
async fn dispatch_one(
    store: Arc<dyn TaskStore>,
    handler: Arc<dyn TaskHandler>,
    config: PollingConfig,
    task: TaskRow,
    cancel: CancellationToken,
) {
    let started = Instant::now();
    let result = handler.execute(&task, cancel.clone()).await;
    metrics::histogram!(
        "turnstile_dispatch_seconds",
        "service" => task.service_name.clone(),
    )
    .record(started.elapsed().as_secs_f64());

    match result {
        Ok(()) => {
            debug!(task_id = %task.id, service = %task.service_name, "task completed");
            apply_transition(store.as_ref(), task.id, TaskStatus::InProgress, TaskStatus::Completed)
                .await;
        }
        Err(_) if cancel.is_cancelled() => {
            info!(task_id = %task.id, service = %task.service_name, "task canceled");
            apply_transition(store.as_ref(), task.id, TaskStatus::InProgress, TaskStatus::Canceled)
                .await;
        }
        Err(err) => {
            warn!(
                task_id = %task.id,
                service = %task.service_name,
                tenant_id = %task.tenant_id,
                ?err,
                "handler failed"
            );
            metrics::counter!(
                "turnstile_task_failures_total",
                "service" => task.service_name.clone(),
            )
            .increment(1);
            settle_failure(store.as_ref(), &task, &config).await;
        }
    }
}

/// Move a failed row through the retry policy: dead-letter once the budget
/// is exhausted, otherwise requeue or leave per configuration.
async fn settle_failure(store: &dyn TaskStore, task: &TaskRow, config: &PollingConfig) {
    if !apply_transition(store, task.id, TaskStatus::InProgress, TaskStatus::Failed).await {
        return;
    }

    // The failure edge bumped retry_count; read it back rather than trust
    // the pre-claim snapshot.
    let retry_count = match store.get(task.id).await {
        Ok(Some(row)) => row.retry_count,
        Ok(None) => {
            warn!(task_id = %task.id, "failed task vanished before retry decision");
            return;
        }
        Err(err) => {
            error!(task_id = %task.id, ?err, "could not read back failed task");
            return;
        }
    };

    if retry_count > config.max_retries {
        if apply_transition(store, task.id, TaskStatus::Failed, TaskStatus::DeadLettered).await {
            metrics::counter!(
                "turnstile_dead_lettered_total",
                "service" => task.service_name.clone(),
            )
            .increment(1);
            warn!(task_id = %task.id, retry_count, "task dead-lettered");
        }
        return;
    }

    if config.retry_mode == RetryMode::Requeue
        && apply_transition(store, task.id, TaskStatus::Failed, TaskStatus::Retrying).await
    {
        metrics::counter!(
            "turnstile_retries_total",
            "service" => task.service_name.clone(),
        )
        .increment(1);
        apply_transition(store, task.id, TaskStatus::Retrying, TaskStatus::Pending).await;
    }
}

async fn apply_transition(
    store: &dyn TaskStore,
    id: Uuid,
    from: TaskStatus,
    to: TaskStatus,
) -> bool {
    match store.transition(id, from, to).await {
        Ok(true) => {
            debug!(task_id = %id, %from, %to, "status transition");
            true
        }
        Ok(false) => {
            warn!(task_id = %id, %from, %to, "transition lost, row moved underneath");
            false
        }
        Err(err) => {
            error!(task_id = %id, %from, %to, ?err, "transition failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ServicePolicy;
    use crate::store::MemoryStore;
    use crate::task::{NewTask, Operation};
    use anyhow::bail;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TICK: Duration = Duration::from_millis(10);

    fn new_task(service: &str, sku: &str, tenant: &str, op: Operation) -> NewTask {
        NewTask {
            execution_instance_id: Uuid::new_v4(),
            event_instance_id: Uuid::new_v4(),
            tenant_id: tenant.to_string(),
            product_sku: sku.to_string(),
            service_name: service.to_string(),
            operation: op,
        }
    }

    fn config(max_retries: i32, retry_mode: RetryMode) -> PollingConfig {
        PollingConfig {
            tick_interval: TICK,
            max_retries,
            retry_mode,
        }
    }

    fn registry_with(
        service: &str,
        per_sku_limit: i64,
        max_concurrency: i64,
        handler: Arc<dyn TaskHandler>,
    ) -> Arc<HandlerRegistry> {
        let mut registry = HandlerRegistry::new();
        registry.register(
            ServicePolicy::new(service, per_sku_limit, max_concurrency),
            handler,
        );
        Arc::new(registry)
    }

    async fn wait_until<F>(mut condition: F)
    where
        F: FnMut() -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            if Instant::now() > deadline {
                panic!("condition not reached within deadline");
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Succeeds every time and records dispatch order.
    #[derive(Default)]
    struct RecordingHandler {
        seen: Mutex<Vec<Uuid>>,
    }

    #[async_trait]
    impl TaskHandler for RecordingHandler {
        async fn execute(&self, task: &TaskRow, _cancel: CancellationToken) -> Result<()> {
            self.seen.lock().expect("seen poisoned").push(task.id);
            Ok(())
        }
    }

    /// Fails every invocation.
    #[derive(Default)]
    struct FailingHandler {
        attempts: AtomicUsize,
    }

    #[async_trait]
    impl TaskHandler for FailingHandler {
        async fn execute(&self, _task: &TaskRow, _cancel: CancellationToken) -> Result<()> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            bail!("downstream rejected the request")
        }
    }

    /// Blocks until the cancel token fires, then returns an error.
    struct BlockingHandler;

    #[async_trait]
    impl TaskHandler for BlockingHandler {
        async fn execute(&self, _task: &TaskRow, cancel: CancellationToken) -> Result<()> {
            cancel.cancelled().await;
            bail!("canceled")
        }
    }

    #[tokio::test]
    async fn pending_row_reaches_completed() {
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(RecordingHandler::default());
        let registry = registry_with("iam", 2, 4, handler.clone());

        let row = store
            .enqueue(new_task("iam", "sku-a", "t1", Operation::Create))
            .await
            .unwrap();

        let poller = Poller::start(config(3, RetryMode::Requeue), store.clone(), registry);
        let probe = store.clone();
        wait_until(move || {
            !probe
                .rows_with_status("iam", TaskStatus::Completed)
                .is_empty()
        })
        .await;
        poller.shutdown().await.unwrap();

        let settled = store.snapshot();
        assert_eq!(settled.len(), 1);
        assert_eq!(settled[0].id, row.id);
        assert_eq!(settled[0].status, TaskStatus::Completed);
        assert_eq!(settled[0].retry_count, 0);
        assert_eq!(handler.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn repeated_failures_dead_letter_the_row() {
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(FailingHandler::default());
        let registry = registry_with("iam", 2, 4, handler.clone());

        let row = store
            .enqueue(new_task("iam", "sku-a", "t1", Operation::Create))
            .await
            .unwrap();

        let poller = Poller::start(config(2, RetryMode::Requeue), store.clone(), registry);
        let probe = store.clone();
        wait_until(move || {
            !probe
                .rows_with_status("iam", TaskStatus::DeadLettered)
                .is_empty()
        })
        .await;
        poller.shutdown().await.unwrap();

        let settled = store.get(row.id).await.unwrap().unwrap();
        assert_eq!(settled.status, TaskStatus::DeadLettered);
        // Two retries allowed, so the third failure tips it over.
        assert_eq!(settled.retry_count, 3);
        assert_eq!(handler.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn leave_mode_parks_failed_rows() {
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(FailingHandler::default());
        let registry = registry_with("iam", 2, 4, handler.clone());

        let row = store
            .enqueue(new_task("iam", "sku-a", "t1", Operation::Create))
            .await
            .unwrap();

        let poller = Poller::start(config(3, RetryMode::Leave), store.clone(), registry);
        let probe = store.clone();
        wait_until(move || !probe.rows_with_status("iam", TaskStatus::Failed).is_empty()).await;
        // A few more ticks must not pick the parked row back up.
        tokio::time::sleep(TICK * 5).await;
        poller.shutdown().await.unwrap();

        let settled = store.get(row.id).await.unwrap().unwrap();
        assert_eq!(settled.status, TaskStatus::Failed);
        assert_eq!(settled.retry_count, 1);
        assert_eq!(handler.attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_settles_in_flight_rows_to_canceled() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry_with("iam", 2, 4, Arc::new(BlockingHandler));

        let row = store
            .enqueue(new_task("iam", "sku-a", "t1", Operation::Create))
            .await
            .unwrap();

        let poller = Poller::start(config(3, RetryMode::Requeue), store.clone(), registry);
        let probe = store.clone();
        wait_until(move || {
            !probe
                .rows_with_status("iam", TaskStatus::InProgress)
                .is_empty()
        })
        .await;

        poller.shutdown().await.unwrap();

        let settled = store.get(row.id).await.unwrap().unwrap();
        assert_eq!(settled.status, TaskStatus::Canceled);
        assert_eq!(settled.retry_count, 0);
    }

    #[tokio::test]
    async fn deep_sku_waits_for_its_next_turn() {
        let store = Arc::new(MemoryStore::new());
        let handler = Arc::new(RecordingHandler::default());
        let registry = registry_with("iam", 2, 3, handler.clone());

        // sku-a has two rows; sku-b one. Fairness says sku-a's second row
        // cannot go before sku-b's first.
        let a1 = store
            .enqueue(new_task("iam", "sku-a", "a1", Operation::Create))
            .await
            .unwrap();
        let a2 = store
            .enqueue(new_task("iam", "sku-a", "a2", Operation::Create))
            .await
            .unwrap();
        let b1 = store
            .enqueue(new_task("iam", "sku-b", "b1", Operation::Create))
            .await
            .unwrap();

        let poller = Poller::start(config(3, RetryMode::Requeue), store.clone(), registry);
        let probe = store.clone();
        wait_until(move || probe.rows_with_status("iam", TaskStatus::Completed).len() == 3).await;
        poller.shutdown().await.unwrap();

        let seen = handler.seen.lock().unwrap().clone();
        let position =
            |id: Uuid| seen.iter().position(|seen_id| *seen_id == id).expect("dispatched");
        assert!(position(a1.id) < position(a2.id));
        assert!(position(b1.id) < position(a2.id));
    }

    #[tokio::test]
    async fn tenant_serialization_across_ticks() {
        let store = Arc::new(MemoryStore::new());
        let registry = registry_with("iam", 2, 4, Arc::new(BlockingHandler));

        // Same tenant twice: the second row must stay pending while the
        // first is in flight.
        let first = store
            .enqueue(new_task("iam", "sku-a", "t1", Operation::Create))
            .await
            .unwrap();
        let second = store
            .enqueue(new_task("iam", "sku-a", "t1", Operation::Update))
            .await
            .unwrap();

        let poller = Poller::start(config(3, RetryMode::Requeue), store.clone(), registry);
        let probe = store.clone();
        wait_until(move || {
            !probe
                .rows_with_status("iam", TaskStatus::InProgress)
                .is_empty()
        })
        .await;
        // Give the poller several more ticks to (incorrectly) claim the
        // blocked tenant's second row.
        tokio::time::sleep(TICK * 5).await;

        assert_eq!(
            store.get(first.id).await.unwrap().unwrap().status,
            TaskStatus::InProgress
        );
        assert_eq!(
            store.get(second.id).await.unwrap().unwrap().status,
            TaskStatus::Pending
        );

        poller.shutdown().await.unwrap();
    }

    #[test]
    fn retry_mode_roundtrip() {
        for mode in [RetryMode::Requeue, RetryMode::Leave] {
            assert_eq!(RetryMode::parse(mode.as_str()), Some(mode));
        }
        assert_eq!(RetryMode::parse("drop"), None);
    }
}
