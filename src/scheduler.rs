//! Selection algorithm: which pending rows to claim this tick.
//!
//! The scheduler is pure with respect to its inputs (a store snapshot plus
//! the service policy) and enforces four disciplines at once:
//!
//! - the per-service cap on in-flight work,
//! - round-robin fairness across product SKUs (at most one row per SKU per
//!   tick, candidate supply capped by `per_sku_limit`),
//! - Create over Update over Delete priority within a SKU,
//! - at most one in-flight row per (service, tenant).
//!
//! Tenant filtering happens before the one-per-SKU pick, so a SKU whose
//! best candidate is tenant-locked may send its next-ranked free-tenant
//! candidate instead - but never more than one row.

use std::collections::HashSet;

use tracing::debug;

use crate::registry::ServicePolicy;
use crate::store::{StoreResult, TaskStore};
use crate::task::TaskRow;

/// Select the rows the poller should claim and dispatch for `policy` this
/// tick. Reads the store, never writes it.
pub async fn schedule(store: &dyn TaskStore, policy: &ServicePolicy) -> StoreResult<Vec<TaskRow>> {
    let service = policy.service_name.as_str();

    let in_progress = store.count_in_progress(service).await?;
    if in_progress >= policy.max_concurrency {
        debug!(
            service,
            in_progress,
            max_concurrency = policy.max_concurrency,
            "service at capacity, skipping tick"
        );
        return Ok(Vec::new());
    }
    let budget = (policy.max_concurrency - in_progress) as usize;

    let mut busy_tenants = store.list_in_progress_tenants(service).await?;
    let candidates = store.rank_pending(service, policy.per_sku_limit).await?;

    let mut taken_skus: HashSet<String> = HashSet::new();
    let mut selected = Vec::new();
    for row in candidates {
        if selected.len() == budget {
            break;
        }
        if busy_tenants.contains(&row.tenant_id) {
            debug!(
                service,
                task_id = %row.id,
                tenant_id = %row.tenant_id,
                "candidate tenant-locked, skipped this tick"
            );
            continue;
        }
        if !taken_skus.insert(row.product_sku.clone()) {
            continue;
        }
        // Reserve the tenant for the rest of the batch so two SKUs cannot
        // both send work for it.
        busy_tenants.insert(row.tenant_id.clone());
        selected.push(row);
    }

    Ok(selected)
}
