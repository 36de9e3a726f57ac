//! Task store interfaces and implementations.
//!
//! The store is durable state plus a handful of read/write primitives; all
//! scheduling logic lives above it. Two implementations ship: Postgres for
//! production and an in-memory store for tests and local runs.

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use std::collections::HashSet;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::task::{NewTask, TaskRow, TaskStatus};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("illegal status transition: {from} -> {to}")]
    InvalidTransition { from: TaskStatus, to: TaskStatus },

    #[error("corrupt row {id}: {message}")]
    Corrupt { id: Uuid, message: String },
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Durable queue storage.
///
/// Mutations go through [`claim`](TaskStore::claim) and
/// [`transition`](TaskStore::transition); both are conditional on the row's
/// current status so concurrent pollers cannot double-drive a row.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new `Pending` row with `retry_count = 0`.
    async fn enqueue(&self, task: NewTask) -> StoreResult<TaskRow>;

    /// Read a single row back.
    async fn get(&self, id: Uuid) -> StoreResult<Option<TaskRow>>;

    /// Number of rows in progress for `service`.
    async fn count_in_progress(&self, service: &str) -> StoreResult<i64>;

    /// Number of pending rows for `service`.
    async fn count_pending(&self, service: &str) -> StoreResult<i64>;

    /// Distinct tenant ids with an in-progress row in `service`.
    async fn list_in_progress_tenants(&self, service: &str) -> StoreResult<HashSet<String>>;

    /// The top `per_sku_limit` pending rows within each product SKU of
    /// `service`, ranked by `(operation priority, inserted_at)` ascending.
    ///
    /// Ranks are computed in one atomic read so they are consistent with
    /// each other; the result is ordered by `(product_sku, rank)` so
    /// callers traverse SKUs deterministically.
    async fn rank_pending(&self, service: &str, per_sku_limit: i64) -> StoreResult<Vec<TaskRow>>;

    /// Compare-and-set `Pending -> InProgress`. Returns `false` when the
    /// row is no longer pending (racing claimer, manual intervention).
    async fn claim(&self, id: Uuid) -> StoreResult<bool>;

    /// Conditionally move a row from `from` to `to`.
    ///
    /// Rejects pairs outside the legal transition table with
    /// [`StoreError::InvalidTransition`]; returns `false` when the row's
    /// current status is not `from`. Increments `retry_count` on the
    /// `InProgress -> Failed` and `InProgress -> Retrying` edges.
    async fn transition(&self, id: Uuid, from: TaskStatus, to: TaskStatus) -> StoreResult<bool>;
}
