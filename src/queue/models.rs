use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Lifecycle of a single phase.
///
/// ```text
/// queued --> ready --> running --> completed
///   |          |          `-----> failed
///   `----------+--> blocked
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Queued,
    Ready,
    Running,
    Completed,
    Blocked,
    Failed,
}

impl PhaseStatus {
    pub const ALL: [PhaseStatus; 6] = [
        Self::Queued,
        Self::Ready,
        Self::Running,
        Self::Completed,
        Self::Blocked,
        Self::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Blocked => "blocked",
            Self::Failed => "failed",
        }
    }

    /// Absorbing states. Nothing ever leaves them.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Blocked | Self::Failed)
    }

    /// Not yet started; eligible for blocking or administrative removal.
    pub fn is_pending(&self) -> bool {
        matches!(self, Self::Queued | Self::Ready)
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "ready" => Ok(Self::Ready),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "blocked" => Ok(Self::Blocked),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid phase status: {}", s)),
        }
    }
}

/// Which phase of the same group must complete before this one is released.
///
/// Serialized as the nullable `depends_on_phase` number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<u32>", into = "Option<u32>")]
pub enum PhaseDependency {
    Root,
    After(u32),
}

impl PhaseDependency {
    /// Dependency of `phase_number` in a linear chain.
    pub fn linear(phase_number: u32) -> Self {
        if phase_number <= 1 {
            Self::Root
        } else {
            Self::After(phase_number - 1)
        }
    }

    pub fn predecessor(&self) -> Option<u32> {
        match self {
            Self::Root => None,
            Self::After(n) => Some(*n),
        }
    }
}

impl From<Option<u32>> for PhaseDependency {
    fn from(value: Option<u32>) -> Self {
        match value {
            Some(n) => Self::After(n),
            None => Self::Root,
        }
    }
}

impl From<PhaseDependency> for Option<u32> {
    fn from(value: PhaseDependency) -> Self {
        value.predecessor()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseQueueItem {
    pub queue_id: String,
    pub group_id: i64,
    pub phase_number: u32,
    pub external_ref: Option<i64>,
    pub status: PhaseStatus,
    pub depends_on_phase: PhaseDependency,
    pub payload: serde_json::Value,
    pub error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl PhaseQueueItem {
    /// Display title from the payload, if the producer supplied one.
    pub fn title(&self) -> Option<&str> {
        self.payload.get("title").and_then(|t| t.as_str())
    }
}

/// Typed enqueue input. Serialized verbatim into the opaque payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewPhase {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub params: serde_json::Value,
}

impl NewPhase {
    pub fn titled(title: &str) -> Self {
        Self {
            title: title.to_string(),
            description: String::new(),
            params: serde_json::Value::Null,
        }
    }

    pub fn into_payload(self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Result of `mark_complete`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionOutcome {
    pub item: PhaseQueueItem,
    /// False when the phase was already completed (idempotent repeat).
    pub changed: bool,
    pub promoted: Option<PhaseQueueItem>,
}

/// Result of `mark_failed`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureOutcome {
    pub item: PhaseQueueItem,
    pub changed: bool,
    /// Every dependent newly moved to `blocked` by this failure.
    pub blocked: Vec<PhaseQueueItem>,
}

/// Result of an administrative removal.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemovalOutcome {
    pub group_id: Option<i64>,
    pub removed: Vec<String>,
}

/// Per-status counts for one group.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupSummary {
    pub group_id: i64,
    pub total: usize,
    pub queued: usize,
    pub ready: usize,
    pub running: usize,
    pub completed: usize,
    pub blocked: usize,
    pub failed: usize,
}

impl GroupSummary {
    pub fn from_items(group_id: i64, items: &[PhaseQueueItem]) -> Self {
        let mut summary = Self {
            group_id,
            total: items.len(),
            ..Default::default()
        };
        for item in items {
            match item.status {
                PhaseStatus::Queued => summary.queued += 1,
                PhaseStatus::Ready => summary.ready += 1,
                PhaseStatus::Running => summary.running += 1,
                PhaseStatus::Completed => summary.completed += 1,
                PhaseStatus::Blocked => summary.blocked += 1,
                PhaseStatus::Failed => summary.failed += 1,
            }
        }
        summary
    }

    /// Every phase has reached a terminal state.
    pub fn is_finished(&self) -> bool {
        self.total > 0 && self.completed + self.blocked + self.failed == self.total
    }

    pub fn has_failure(&self) -> bool {
        self.failed > 0
    }
}

// API view types
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupView {
    pub summary: GroupSummary,
    pub phases: Vec<PhaseQueueItem>,
}
