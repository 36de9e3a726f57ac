//! Queue row model and the status machine it moves through.
//!
//! One `TaskRow` is one unit of tenant-service work: "create tenant T on
//! IAM", "delete tenant T on IOT", and so on. Rows are inserted as
//! `Pending` by upstream ingestion and only ever leave `Pending` through
//! the scheduler's claim step. The legal transitions are encoded in
//! [`TaskStatus::can_transition`] and enforced at the store boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Operation requested against a downstream service.
///
/// Variant order is scheduling priority: Create runs before Update, Update
/// before Delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }

    /// Rank used for candidate ordering; lower runs first.
    pub fn priority_rank(&self) -> i16 {
        match self {
            Self::Create => 0,
            Self::Update => 1,
            Self::Delete => 2,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a queue row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Canceled,
    Skipped,
    Retrying,
    DeadLettered,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Skipped => "skipped",
            Self::Retrying => "retrying",
            Self::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            "skipped" => Some(Self::Skipped),
            "retrying" => Some(Self::Retrying),
            "dead_lettered" => Some(Self::DeadLettered),
            _ => None,
        }
    }

    /// Whether a row may move from `from` to `to`.
    ///
    /// `Pending -> InProgress` is the claim step and must be written as a
    /// compare-and-set. `Pending -> Skipped` is legal for audit writes but
    /// the poller never persists it.
    pub fn can_transition(from: TaskStatus, to: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (from, to),
            (Pending, InProgress)
                | (Pending, Skipped)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Canceled)
                | (InProgress, Retrying)
                | (Failed, Retrying)
                | (Failed, DeadLettered)
                | (Retrying, Pending)
        )
    }

    /// True when no legal transition leads out of this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Canceled | Self::Skipped | Self::DeadLettered)
    }

    /// Whether this edge increments `retry_count` when taken.
    pub fn bumps_retry_count(from: TaskStatus, to: TaskStatus) -> bool {
        matches!(
            (from, to),
            (TaskStatus::InProgress, TaskStatus::Failed)
                | (TaskStatus::InProgress, TaskStatus::Retrying)
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of tenant-service work in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRow {
    pub id: Uuid,
    /// Back-reference to the caller's workflow run.
    pub execution_instance_id: Uuid,
    /// Back-reference to the caller's step within that run.
    pub event_instance_id: Uuid,
    /// Logical tenant; at most one in-flight row per (service, tenant).
    pub tenant_id: String,
    /// Fairness partition key.
    pub product_sku: String,
    /// Selects the handler and concurrency policy.
    pub service_name: String,
    pub operation: Operation,
    pub status: TaskStatus,
    pub inserted_at: DateTime<Utc>,
    pub retry_count: i32,
}

/// Insert payload produced by upstream ingestion.
///
/// Producers only ever create `Pending` rows; status, timestamps and the
/// retry counter are assigned by the store.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub execution_instance_id: Uuid,
    pub event_instance_id: Uuid,
    pub tenant_id: String,
    pub product_sku: String,
    pub service_name: String,
    pub operation: Operation,
}
