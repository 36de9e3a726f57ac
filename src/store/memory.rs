//! In-memory task store for tests and local runs.
//!
//! Mirrors the Postgres implementation's semantics exactly: same ranking
//! order, same conditional mutations, same retry-count bookkeeping.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use super::{StoreError, StoreResult, TaskStore};
use crate::task::{NewTask, TaskRow, TaskStatus};

/// Store that keeps queue rows in memory.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tasks: Arc<Mutex<Vec<TaskRow>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fully specified row, bypassing the enqueue defaults.
    ///
    /// Test seam for seeding rows with explicit timestamps or statuses.
    pub fn insert(&self, row: TaskRow) {
        let mut tasks = self.tasks.lock().expect("task store poisoned");
        tasks.push(row);
    }

    /// Snapshot of every row in insertion order.
    pub fn snapshot(&self) -> Vec<TaskRow> {
        self.tasks.lock().expect("task store poisoned").clone()
    }

    /// Rows of `service` currently in `status`.
    pub fn rows_with_status(&self, service: &str, status: TaskStatus) -> Vec<TaskRow> {
        self.tasks
            .lock()
            .expect("task store poisoned")
            .iter()
            .filter(|row| row.service_name == service && row.status == status)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TaskStore for MemoryStore {
    async fn enqueue(&self, task: NewTask) -> StoreResult<TaskRow> {
        let row = TaskRow {
            id: Uuid::new_v4(),
            execution_instance_id: task.execution_instance_id,
            event_instance_id: task.event_instance_id,
            tenant_id: task.tenant_id,
            product_sku: task.product_sku,
            service_name: task.service_name,
            operation: task.operation,
            status: TaskStatus::Pending,
            inserted_at: Utc::now(),
            retry_count: 0,
        };
        let mut tasks = self.tasks.lock().expect("task store poisoned");
        tasks.push(row.clone());
        Ok(row)
    }

    async fn get(&self, id: Uuid) -> StoreResult<Option<TaskRow>> {
        let tasks = self.tasks.lock().expect("task store poisoned");
        Ok(tasks.iter().find(|row| row.id == id).cloned())
    }

    async fn count_in_progress(&self, service: &str) -> StoreResult<i64> {
        let tasks = self.tasks.lock().expect("task store poisoned");
        Ok(tasks
            .iter()
            .filter(|row| row.service_name == service && row.status == TaskStatus::InProgress)
            .count() as i64)
    }

    async fn count_pending(&self, service: &str) -> StoreResult<i64> {
        let tasks = self.tasks.lock().expect("task store poisoned");
        Ok(tasks
            .iter()
            .filter(|row| row.service_name == service && row.status == TaskStatus::Pending)
            .count() as i64)
    }

    async fn list_in_progress_tenants(&self, service: &str) -> StoreResult<HashSet<String>> {
        let tasks = self.tasks.lock().expect("task store poisoned");
        Ok(tasks
            .iter()
            .filter(|row| row.service_name == service && row.status == TaskStatus::InProgress)
            .map(|row| row.tenant_id.clone())
            .collect())
    }

    async fn rank_pending(&self, service: &str, per_sku_limit: i64) -> StoreResult<Vec<TaskRow>> {
        let tasks = self.tasks.lock().expect("task store poisoned");
        let mut partitions: BTreeMap<String, Vec<TaskRow>> = BTreeMap::new();
        for row in tasks
            .iter()
            .filter(|row| row.service_name == service && row.status == TaskStatus::Pending)
        {
            partitions
                .entry(row.product_sku.clone())
                .or_default()
                .push(row.clone());
        }

        let limit = per_sku_limit.max(0) as usize;
        let mut ranked = Vec::new();
        for mut rows in partitions.into_values() {
            // Stable sort keeps insertion order for equal keys, matching
            // the monotonic inserted_at assumption.
            rows.sort_by_key(|row| (row.operation.priority_rank(), row.inserted_at));
            rows.truncate(limit);
            ranked.extend(rows);
        }
        Ok(ranked)
    }

    async fn claim(&self, id: Uuid) -> StoreResult<bool> {
        let mut tasks = self.tasks.lock().expect("task store poisoned");
        match tasks.iter_mut().find(|row| row.id == id) {
            Some(row) if row.status == TaskStatus::Pending => {
                row.status = TaskStatus::InProgress;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn transition(&self, id: Uuid, from: TaskStatus, to: TaskStatus) -> StoreResult<bool> {
        if !TaskStatus::can_transition(from, to) {
            return Err(StoreError::InvalidTransition { from, to });
        }
        let mut tasks = self.tasks.lock().expect("task store poisoned");
        match tasks.iter_mut().find(|row| row.id == id) {
            Some(row) if row.status == from => {
                row.status = to;
                if TaskStatus::bumps_retry_count(from, to) {
                    row.retry_count += 1;
                }
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
