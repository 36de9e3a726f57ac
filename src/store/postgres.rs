//! Postgres-backed task store.
//!
//! One table, `queued_tasks`, with text status codes. The ranked read is a
//! single window-function query so per-SKU ranks are consistent with each
//! other, and every mutation is conditional on the row's current status.

use std::collections::HashSet;

use async_trait::async_trait;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use super::{StoreError, StoreResult, TaskStore};
use crate::task::{NewTask, Operation, TaskRow, TaskStatus};

const TASK_COLUMNS: &str = "id, execution_instance_id, event_instance_id, tenant_id, \
     product_sku, service_name, operation, status, inserted_at, retry_count";

/// Persist queue rows in Postgres.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect with the default pool size and run migrations.
    pub async fn connect(database_url: &str) -> StoreResult<Self> {
        Self::connect_with_pool_size(database_url, 10).await
    }

    /// Connect with a custom pool size and run migrations.
    pub async fn connect_with_pool_size(
        database_url: &str,
        max_connections: u32,
    ) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn decode_row(row: &PgRow) -> StoreResult<TaskRow> {
        let id: Uuid = row.get("id");
        let operation_code: String = row.get("operation");
        let status_code: String = row.get("status");

        let operation = Operation::parse(&operation_code).ok_or_else(|| StoreError::Corrupt {
            id,
            message: format!("unknown operation code {operation_code:?}"),
        })?;
        let status = TaskStatus::parse(&status_code).ok_or_else(|| StoreError::Corrupt {
            id,
            message: format!("unknown status code {status_code:?}"),
        })?;

        Ok(TaskRow {
            id,
            execution_instance_id: row.get("execution_instance_id"),
            event_instance_id: row.get("event_instance_id"),
            tenant_id: row.get("tenant_id"),
            product_sku: row.get("product_sku"),
            service_name: row.get("service_name"),
            operation,
            status,
            inserted_at: row.get("inserted_at"),
            retry_count: row.get("retry_count"),
        })
    }
}

#[async_trait]
impl TaskStore for PostgresStore {
    async fn enqueue(&self, task: NewTask) -> StoreResult<TaskRow> {
        let query = format!(
            "INSERT INTO queued_tasks \
                 (id, execution_instance_id, event_instance_id, tenant_id, \
                  product_sku, service_name, operation, status, inserted_at, retry_count) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending', NOW(), 0) \
             RETURNING {TASK_COLUMNS}"
        );
        let row = sqlx::query(&query)
            .bind(Uuid::new_v4())
            .bind(task.execution_instance_id)
            .bind(task.event_instance_id)
            .bind(&task.tenant_id)
            .bind(&task.product_sku)
            .bind(&task.service_name)
            .bind(task.operation.as_str())
            .fetch_one(&self.pool)
            .await?;

        Self::decode_row(&row)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<TaskRow>> {
        let query = format!("SELECT {TASK_COLUMNS} FROM queued_tasks WHERE id = $1");
        let row = sqlx::query(&query).bind(id).fetch_optional(&self.pool).await?;

        row.as_ref().map(Self::decode_row).transpose()
    }

    async fn count_in_progress(&self, service: &str) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM queued_tasks \
             WHERE service_name = $1 AND status = 'in_progress'",
        )
        .bind(service)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn count_pending(&self, service: &str) -> StoreResult<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM queued_tasks \
             WHERE service_name = $1 AND status = 'pending'",
        )
        .bind(service)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn list_in_progress_tenants(&self, service: &str) -> StoreResult<HashSet<String>> {
        let tenants = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT tenant_id FROM queued_tasks \
             WHERE service_name = $1 AND status = 'in_progress'",
        )
        .bind(service)
        .fetch_all(&self.pool)
        .await?;

        Ok(tenants.into_iter().collect())
    }

    async fn rank_pending(&self, service: &str, per_sku_limit: i64) -> StoreResult<Vec<TaskRow>> {
        // Create before Update before Delete, oldest first within each.
        let query = format!(
            "WITH ranked AS ( \
                 SELECT {TASK_COLUMNS}, \
                        ROW_NUMBER() OVER ( \
                            PARTITION BY product_sku \
                            ORDER BY CASE operation \
                                         WHEN 'create' THEN 0 \
                                         WHEN 'update' THEN 1 \
                                         ELSE 2 \
                                     END, \
                                     inserted_at \
                        ) AS sku_rank \
                 FROM queued_tasks \
                 WHERE service_name = $1 AND status = 'pending' \
             ) \
             SELECT {TASK_COLUMNS} FROM ranked \
             WHERE sku_rank <= $2 \
             ORDER BY product_sku, sku_rank"
        );
        let rows = sqlx::query(&query)
            .bind(service)
            .bind(per_sku_limit)
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(Self::decode_row).collect()
    }

    async fn claim(&self, id: Uuid) -> StoreResult<bool> {
        // The conditional update is the serialization point: a row claimed
        // by a racing poller is no longer pending and matches zero rows.
        let result = sqlx::query(
            "UPDATE queued_tasks \
             SET status = 'in_progress', updated_at = NOW() \
             WHERE id = $1 AND status = 'pending'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn transition(&self, id: Uuid, from: TaskStatus, to: TaskStatus) -> StoreResult<bool> {
        if !TaskStatus::can_transition(from, to) {
            return Err(StoreError::InvalidTransition { from, to });
        }
        let bump: i32 = if TaskStatus::bumps_retry_count(from, to) { 1 } else { 0 };

        let result = sqlx::query(
            "UPDATE queued_tasks \
             SET status = $2, retry_count = retry_count + $3, updated_at = NOW() \
             WHERE id = $1 AND status = $4",
        )
        .bind(id)
        .bind(to.as_str())
        .bind(bump)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
