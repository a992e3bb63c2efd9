//! Flow registry: a store-side, TTL'd `flow-id → (workflow-name, root job id)` entry
//! used as a fast-path hint for `findJobByFlowId` (§6 "Flow registry key layout").
//!
//! Writing this entry is best-effort: a write failure is logged and otherwise ignored,
//! since [`super::WorkflowProvider::find_job_by_flow_id`]'s sequential-scan fallback
//! stays correct without it (§4.8.7, §8 "Flow registry fallback").

use std::hash::{Hash, Hasher};
use std::time::Duration;

use tracing::warn;

use crate::store::BackingStore;

const REGISTRY_TTL: Duration = Duration::from_secs(900);
const FIELD_SEPARATOR: char = '\u{1}';

fn short_hash(flow_id: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    flow_id.hash(&mut hasher);
    format!("{:x}", hasher.finish())
}

fn registry_key(queue_prefix: &str, flow_id: &str) -> String {
    format!("{queue_prefix}:fr:{}", short_hash(flow_id))
}

/// Writes `workflow_name`/`root_job_id` under `flow_id`'s registry key. Never returns an
/// error to the caller: a failed write only costs the reader the fast path.
pub async fn write_entry<S: BackingStore>(
    store: &S,
    queue_prefix: &str,
    flow_id: &str,
    workflow_name: &str,
    root_job_id: &str,
) {
    let key = registry_key(queue_prefix, flow_id);
    let value = format!("{workflow_name}{FIELD_SEPARATOR}{root_job_id}");
    if let Err(err) = store.kv_set(&key, &value, REGISTRY_TTL).await {
        warn!(%flow_id, %err, "failed to write flow registry entry, falling back to sequential scan");
    }
}

/// Reads back `(workflow_name, root_job_id)` for `flow_id`, if the entry still exists.
pub async fn lookup<S: BackingStore>(
    store: &S,
    queue_prefix: &str,
    flow_id: &str,
) -> Option<(String, String)> {
    let key = registry_key(queue_prefix, flow_id);
    let raw = store.kv_get(&key).await.ok().flatten()?;
    let (workflow_name, root_job_id) = raw.split_once(FIELD_SEPARATOR)?;
    Some((workflow_name.to_string(), root_job_id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryBackingStore;

    #[tokio::test]
    async fn write_then_lookup_round_trips() {
        let store = InMemoryBackingStore::new();
        write_entry(&store, "workflow", "flow-1", "onboarding", "flow-1").await;
        let (workflow_name, root_job_id) = lookup(&store, "workflow", "flow-1").await.unwrap();
        assert_eq!(workflow_name, "onboarding");
        assert_eq!(root_job_id, "flow-1");
    }

    #[tokio::test]
    async fn lookup_on_missing_entry_is_none() {
        let store = InMemoryBackingStore::new();
        assert!(lookup(&store, "workflow", "flow-missing").await.is_none());
    }
}
