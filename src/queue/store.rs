//! Async scheduling API over the phase table.
//!
//! `PhaseQueueStore` is the only writer of phase state. Every mutation is a
//! single guarded SQLite transaction (see `db.rs`). Concurrent callers may race
//! on the same phase; at most one of them observes a real transition.

use tracing::{debug, info, warn};

use super::db::{DbHandle, QueueDb};
use super::models::*;
use crate::errors::{QueueError, QueueResult};

/// Default upper bound on phases per group.
pub const DEFAULT_MAX_CHAIN_LENGTH: usize = 20;

#[derive(Clone)]
pub struct PhaseQueueStore {
    db: DbHandle,
    max_chain_length: usize,
}

impl PhaseQueueStore {
    pub fn new(db: DbHandle, max_chain_length: usize) -> Self {
        Self {
            db,
            max_chain_length,
        }
    }

    /// Store over a fresh in-memory database.
    pub fn in_memory() -> anyhow::Result<Self> {
        Ok(Self::new(
            DbHandle::new(QueueDb::new_in_memory()?),
            DEFAULT_MAX_CHAIN_LENGTH,
        ))
    }

    pub fn max_chain_length(&self) -> usize {
        self.max_chain_length
    }

    /// Reject malformed chains before anything is persisted.
    pub fn validate_chain(&self, payloads: &[serde_json::Value]) -> QueueResult<()> {
        if payloads.is_empty() {
            return Err(QueueError::Validation(
                "a request needs at least one phase".into(),
            ));
        }
        if payloads.len() > self.max_chain_length {
            return Err(QueueError::Validation(format!(
                "{} phases exceeds the maximum chain length of {}",
                payloads.len(),
                self.max_chain_length
            )));
        }
        Ok(())
    }

    /// Create one phase per payload: phase 1 `ready`, the rest `queued`, each
    /// depending on its predecessor. Returns the new queue ids in phase order.
    pub async fn enqueue(
        &self,
        group_id: i64,
        payloads: Vec<serde_json::Value>,
    ) -> QueueResult<Vec<String>> {
        Ok(self
            .enqueue_items(group_id, payloads)
            .await?
            .into_iter()
            .map(|item| item.queue_id)
            .collect())
    }

    /// Same as [`enqueue`](Self::enqueue) but returns the created items.
    pub async fn enqueue_items(
        &self,
        group_id: i64,
        payloads: Vec<serde_json::Value>,
    ) -> QueueResult<Vec<PhaseQueueItem>> {
        self.validate_chain(&payloads)?;
        let count = payloads.len();
        let items = self
            .db
            .call(move |db| db.insert_chain(group_id, payloads))
            .await?;
        info!(group_id, phases = count, "enqueued phase chain");
        Ok(items)
    }

    pub async fn enqueue_phases(
        &self,
        group_id: i64,
        phases: Vec<NewPhase>,
    ) -> QueueResult<Vec<PhaseQueueItem>> {
        let payloads = phases.into_iter().map(NewPhase::into_payload).collect();
        self.enqueue_items(group_id, payloads).await
    }

    pub async fn mark_running(
        &self,
        queue_id: &str,
        external_ref: i64,
    ) -> QueueResult<PhaseQueueItem> {
        let id = queue_id.to_string();
        let item = self
            .db
            .call(move |db| db.mark_running(&id, external_ref))
            .await?;
        info!(
            queue_id = %item.queue_id,
            group_id = item.group_id,
            phase_number = item.phase_number,
            external_ref,
            "phase dispatched"
        );
        Ok(item)
    }

    pub async fn mark_complete(&self, queue_id: &str) -> QueueResult<CompletionOutcome> {
        let id = queue_id.to_string();
        let outcome = self.db.call(move |db| db.mark_complete(&id)).await?;
        if outcome.changed {
            info!(
                queue_id = %outcome.item.queue_id,
                group_id = outcome.item.group_id,
                phase_number = outcome.item.phase_number,
                promoted = outcome.promoted.as_ref().map(|p| p.phase_number),
                "phase completed"
            );
        } else {
            debug!(queue_id, "phase already completed");
        }
        Ok(outcome)
    }

    pub async fn mark_failed(
        &self,
        queue_id: &str,
        error_message: &str,
    ) -> QueueResult<FailureOutcome> {
        if error_message.trim().is_empty() {
            return Err(QueueError::Validation(
                "failure message must not be empty".into(),
            ));
        }
        let id = queue_id.to_string();
        let message = error_message.to_string();
        let outcome = self
            .db
            .call(move |db| db.mark_failed(&id, &message))
            .await?;
        if outcome.changed {
            warn!(
                queue_id = %outcome.item.queue_id,
                group_id = outcome.item.group_id,
                phase_number = outcome.item.phase_number,
                blocked = outcome.blocked.len(),
                error = error_message,
                "phase failed"
            );
        } else {
            debug!(queue_id, "phase already failed");
        }
        Ok(outcome)
    }

    /// Every `running` phase, optionally restricted to one group.
    pub async fn get_running(&self, group_id: Option<i64>) -> QueueResult<Vec<PhaseQueueItem>> {
        self.db
            .call(move |db| db.list_by_status(PhaseStatus::Running, group_id))
            .await
    }

    /// Full chain for one group, ordered by phase number.
    pub async fn get_by_group(&self, group_id: i64) -> QueueResult<Vec<PhaseQueueItem>> {
        self.db.call(move |db| db.list_by_group(group_id)).await
    }

    pub async fn get(&self, queue_id: &str) -> QueueResult<Option<PhaseQueueItem>> {
        let id = queue_id.to_string();
        self.db.call(move |db| db.get_item(&id)).await
    }

    pub async fn list_groups(&self) -> QueueResult<Vec<i64>> {
        self.db.call(|db| db.list_groups()).await
    }

    pub async fn group_view(&self, group_id: i64) -> QueueResult<GroupView> {
        let phases = self.get_by_group(group_id).await?;
        Ok(GroupView {
            summary: GroupSummary::from_items(group_id, &phases),
            phases,
        })
    }

    /// Administrative cancel of a single phase and its pending dependents.
    pub async fn remove(&self, queue_id: &str, force: bool) -> QueueResult<RemovalOutcome> {
        let id = queue_id.to_string();
        let outcome = self.db.call(move |db| db.remove(&id, force)).await?;
        info!(
            queue_id,
            force,
            removed = outcome.removed.len(),
            "removed queued phases"
        );
        Ok(outcome)
    }

    pub async fn cancel_group(&self, group_id: i64, force: bool) -> QueueResult<RemovalOutcome> {
        let outcome = self
            .db
            .call(move |db| db.cancel_group(group_id, force))
            .await?;
        info!(
            group_id,
            force,
            removed = outcome.removed.len(),
            "cancelled group"
        );
        Ok(outcome)
    }
}
