//! Background reconciliation of `running` phases.
//!
//! Every cycle re-reads the running set from the store, asks the
//! [`ExternalStatusProvider`] about each item concurrently, and drives the
//! matching store transition. Broadcasts and notifications happen only after
//! the transition has committed and their failures are logged, not returned.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::github::{Notifier, PhaseNotice};
use super::models::PhaseQueueItem;
use super::provider::{ExternalStatus, ExternalStatusProvider};
use super::store::PhaseQueueStore;
use super::ws::Broadcaster;
use crate::errors::{CoordinatorError, DeliveryError};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub poll_interval: Duration,
    pub provider_timeout: Duration,
    pub notify_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            provider_timeout: Duration::from_secs(30),
            notify_timeout: Duration::from_secs(15),
        }
    }
}

/// Tally of one reconciliation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub polled: usize,
    pub completed: usize,
    pub failed: usize,
    pub blocked: usize,
    pub still_running: usize,
    pub not_found: usize,
    pub errors: usize,
}

impl CycleReport {
    pub fn changed(&self) -> bool {
        self.completed + self.failed + self.blocked > 0
    }

    fn record(&mut self, outcome: ItemOutcome) {
        match outcome {
            ItemOutcome::Completed => self.completed += 1,
            ItemOutcome::Failed { blocked } => {
                self.failed += 1;
                self.blocked += blocked;
            }
            ItemOutcome::StillRunning => self.still_running += 1,
            ItemOutcome::NotFound => self.not_found += 1,
            ItemOutcome::Settled => {}
        }
    }
}

#[derive(Debug)]
enum ItemOutcome {
    Completed,
    Failed { blocked: usize },
    StillRunning,
    NotFound,
    /// Another caller already performed the transition.
    Settled,
}

struct Reconciler {
    store: PhaseQueueStore,
    provider: Arc<dyn ExternalStatusProvider>,
    broadcaster: Arc<dyn Broadcaster>,
    notifier: Arc<dyn Notifier>,
    config: CoordinatorConfig,
    cycles: AtomicU64,
}

struct LoopHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Coordinator {
    inner: Arc<Reconciler>,
    handle: Mutex<Option<LoopHandle>>,
}

impl Coordinator {
    pub fn new(
        store: PhaseQueueStore,
        provider: Arc<dyn ExternalStatusProvider>,
        broadcaster: Arc<dyn Broadcaster>,
        notifier: Arc<dyn Notifier>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Reconciler {
                store,
                provider,
                broadcaster,
                notifier,
                config,
                cycles: AtomicU64::new(0),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the polling loop. Returns false if it is already running.
    pub fn start(&self) -> bool {
        let mut handle = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = handle.as_ref()
            && !existing.task.is_finished()
        {
            warn!("coordinator is already running");
            return false;
        }

        let token = CancellationToken::new();
        let task = tokio::spawn(run_loop(self.inner.clone(), token.clone()));
        *handle = Some(LoopHandle { token, task });
        info!(
            poll_interval = ?self.inner.config.poll_interval,
            "coordinator started"
        );
        true
    }

    /// Cancel the loop and wait for the in-flight cycle to finish.
    /// No-op when the loop is not running.
    pub async fn stop(&self) {
        let taken = self
            .handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(LoopHandle { token, task }) = taken else {
            return;
        };
        token.cancel();
        if let Err(e) = task.await {
            error!(error = %e, "coordinator task panicked");
        }
        info!("coordinator stopped");
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|h| !h.task.is_finished())
    }

    /// Run one reconciliation pass outside the loop.
    pub async fn run_cycle(&self) -> CycleReport {
        self.inner.clone().run_cycle().await
    }

    pub fn cycles_completed(&self) -> u64 {
        self.inner.cycles.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }
}

async fn run_loop(inner: Arc<Reconciler>, token: CancellationToken) {
    loop {
        let report = inner.clone().run_cycle().await;
        if report.changed() || report.errors > 0 {
            info!(
                polled = report.polled,
                completed = report.completed,
                failed = report.failed,
                blocked = report.blocked,
                not_found = report.not_found,
                errors = report.errors,
                "reconciliation cycle finished"
            );
        } else {
            debug!(polled = report.polled, "reconciliation cycle idle");
        }

        tokio::select! {
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(inner.config.poll_interval) => {}
        }
    }
}

impl Reconciler {
    async fn run_cycle(self: Arc<Self>) -> CycleReport {
        let mut report = CycleReport::default();

        // Never cached across cycles.
        let running = match self.store.get_running(None).await {
            Ok(items) => items,
            Err(e) => {
                error!(error = %e, "failed to load running phases");
                report.errors += 1;
                self.cycles.fetch_add(1, Ordering::Relaxed);
                return report;
            }
        };
        report.polled = running.len();

        let mut set = JoinSet::new();
        for item in running {
            let this = self.clone();
            set.spawn(async move {
                let queue_id = item.queue_id.clone();
                (queue_id, this.reconcile(item).await)
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => report.record(outcome),
                Ok((queue_id, Err(e))) => {
                    error!(queue_id = %queue_id, error = %e, "failed to reconcile phase");
                    report.errors += 1;
                }
                Err(e) => {
                    error!(error = %e, "reconcile task aborted");
                    report.errors += 1;
                }
            }
        }

        self.cycles.fetch_add(1, Ordering::Relaxed);
        report
    }

    async fn reconcile(&self, item: PhaseQueueItem) -> Result<ItemOutcome, CoordinatorError> {
        let external_ref =
            item.external_ref
                .ok_or_else(|| CoordinatorError::MissingExternalRef {
                    queue_id: item.queue_id.clone(),
                })?;

        let status = timeout(
            self.config.provider_timeout,
            self.provider.get_status(external_ref),
        )
        .await
        .map_err(|_| CoordinatorError::ProviderUnavailable {
            external_ref,
            timeout: self.config.provider_timeout,
        })?
        .map_err(CoordinatorError::Provider)?;

        match status {
            ExternalStatus::NotFound => {
                warn!(
                    queue_id = %item.queue_id,
                    external_ref,
                    "external run not found yet; leaving phase running"
                );
                Ok(ItemOutcome::NotFound)
            }
            ExternalStatus::Running => Ok(ItemOutcome::StillRunning),
            ExternalStatus::Succeeded => self.complete(&item).await,
            ExternalStatus::Failed { detail } => self.fail(&item, external_ref, detail).await,
        }
    }

    async fn complete(&self, item: &PhaseQueueItem) -> Result<ItemOutcome, CoordinatorError> {
        let outcome = self.store.mark_complete(&item.queue_id).await?;
        if !outcome.changed {
            return Ok(ItemOutcome::Settled);
        }

        self.publish_group(item.group_id).await;
        self.publish_transition(&outcome.item);
        let notice = notice_for(&outcome.item, None);
        self.deliver("completed", self.notifier.notify_completed(&notice))
            .await;
        Ok(ItemOutcome::Completed)
    }

    async fn fail(
        &self,
        item: &PhaseQueueItem,
        external_ref: i64,
        detail: Option<String>,
    ) -> Result<ItemOutcome, CoordinatorError> {
        let detail = match detail.filter(|d| !d.trim().is_empty()) {
            Some(d) => Some(d),
            None => self.fetch_failure_detail(external_ref).await,
        };
        let message = detail
            .filter(|d| !d.trim().is_empty())
            .unwrap_or_else(|| format!("External run {} reported failure", external_ref));

        let outcome = self.store.mark_failed(&item.queue_id, &message).await?;
        if !outcome.changed {
            return Ok(ItemOutcome::Settled);
        }

        self.publish_group(item.group_id).await;
        self.publish_transition(&outcome.item);
        for blocked in &outcome.blocked {
            self.publish_transition(blocked);
            let notice = notice_for(blocked, blocked.error_message.clone());
            self.deliver("blocked", self.notifier.notify_blocked(&notice))
                .await;
        }
        let notice = notice_for(&outcome.item, Some(message));
        self.deliver("failed", self.notifier.notify_failed(&notice))
            .await;

        Ok(ItemOutcome::Failed {
            blocked: outcome.blocked.len(),
        })
    }

    async fn fetch_failure_detail(&self, external_ref: i64) -> Option<String> {
        match timeout(
            self.config.provider_timeout,
            self.provider.failure_detail(external_ref),
        )
        .await
        {
            Ok(Ok(detail)) => detail,
            Ok(Err(e)) => {
                warn!(external_ref, error = %e, "could not fetch failure detail");
                None
            }
            Err(_) => {
                warn!(external_ref, "failure detail request timed out");
                None
            }
        }
    }

    async fn publish_group(&self, group_id: i64) {
        let items = match self.store.get_by_group(group_id).await {
            Ok(items) => items,
            Err(e) => {
                warn!(group_id, error = %e, "could not load group for broadcast");
                return;
            }
        };
        if let Err(e) = self.broadcaster.publish(group_id, &items) {
            warn!(group_id, error = %e, "broadcast failed");
        }
    }

    fn publish_transition(&self, item: &PhaseQueueItem) {
        if let Err(e) = self.broadcaster.publish_transition(item) {
            warn!(queue_id = %item.queue_id, error = %e, "broadcast failed");
        }
    }

    async fn deliver<F>(&self, kind: &'static str, send: F)
    where
        F: Future<Output = Result<(), DeliveryError>>,
    {
        match timeout(self.config.notify_timeout, send).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(kind, error = %e, "notification failed"),
            Err(_) => warn!(kind, timeout = ?self.config.notify_timeout, "notification timed out"),
        }
    }
}

fn notice_for(item: &PhaseQueueItem, detail: Option<String>) -> PhaseNotice {
    PhaseNotice {
        group_id: item.group_id,
        phase_number: item.phase_number,
        external_ref: item.external_ref,
        detail,
    }
}
