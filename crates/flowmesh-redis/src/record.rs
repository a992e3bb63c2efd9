//! Wire representation of a [`flowmesh_core::store::JobSpec`] node as a Redis hash.
//!
//! Mirrors the field set `InMemoryBackingStore`'s `JobRecord` carries in-process (§6),
//! flattened to string fields so it round-trips through `HSET`/`HGETALL`.

use std::collections::HashMap;

use flowmesh_core::store::JobState;
use serde_json::Value;

#[derive(Debug, Clone)]
pub(crate) struct JobRecord {
    pub id: String,
    pub queue: String,
    pub name: String,
    pub data: Value,
    pub state: JobState,
    pub fail_parent_on_failure: bool,
    pub parent: Option<(String, String)>,
    pub children: Vec<(String, String)>,
    pub pending_children: usize,
    pub return_value: Option<Value>,
    pub failed_reason: Option<String>,
}

fn state_to_str(state: JobState) -> &'static str {
    match state {
        JobState::Completed => "completed",
        JobState::Failed => "failed",
        JobState::Active => "active",
        JobState::Waiting => "waiting",
        JobState::WaitingChildren => "waiting_children",
        JobState::Delayed => "delayed",
    }
}

fn str_to_state(s: &str) -> Option<JobState> {
    Some(match s {
        "completed" => JobState::Completed,
        "failed" => JobState::Failed,
        "active" => JobState::Active,
        "waiting" => JobState::Waiting,
        "waiting_children" => JobState::WaitingChildren,
        "delayed" => JobState::Delayed,
        _ => return None,
    })
}

impl JobRecord {
    /// Field list suitable for `HSET key f1 v1 f2 v2 ...`. Optional fields are only
    /// emitted when present; `from_fields` treats their absence as `None`.
    pub fn to_fields(&self) -> Vec<(&'static str, String)> {
        let mut fields = vec![
            ("queue", self.queue.clone()),
            ("name", self.name.clone()),
            ("data", self.data.to_string()),
            ("state", state_to_str(self.state).to_string()),
            ("fail_parent_on_failure", self.fail_parent_on_failure.to_string()),
            ("pending_children", self.pending_children.to_string()),
            ("children", serde_json::to_string(&self.children).unwrap_or_default()),
        ];
        if let Some((parent_queue, parent_id)) = &self.parent {
            fields.push(("parent_queue", parent_queue.clone()));
            fields.push(("parent_id", parent_id.clone()));
        }
        if let Some(return_value) = &self.return_value {
            fields.push(("return_value", return_value.to_string()));
        }
        if let Some(failed_reason) = &self.failed_reason {
            fields.push(("failed_reason", failed_reason.clone()));
        }
        fields
    }

    /// Rebuilds a record from a `HGETALL` result. Returns `None` when a required field
    /// is missing or unparseable, which `RedisBackingStore` treats the same way it
    /// treats an empty hash: "no such job".
    pub fn from_fields(id: &str, fields: &HashMap<String, String>) -> Option<Self> {
        let queue = fields.get("queue")?.clone();
        let name = fields.get("name")?.clone();
        let data: Value = serde_json::from_str(fields.get("data")?).ok()?;
        let state = str_to_state(fields.get("state")?)?;
        let fail_parent_on_failure = fields
            .get("fail_parent_on_failure")
            .map(|v| v == "true")
            .unwrap_or(false);
        let pending_children = fields
            .get("pending_children")
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let children = fields
            .get("children")
            .and_then(|v| serde_json::from_str(v).ok())
            .unwrap_or_default();
        let parent = match (fields.get("parent_queue"), fields.get("parent_id")) {
            (Some(q), Some(i)) => Some((q.clone(), i.clone())),
            _ => None,
        };
        let return_value = fields.get("return_value").and_then(|v| serde_json::from_str(v).ok());
        let failed_reason = fields.get("failed_reason").cloned();

        Some(Self {
            id: id.to_string(),
            queue,
            name,
            data,
            state,
            fail_parent_on_failure,
            parent,
            children,
            pending_children,
            return_value,
            failed_reason,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_fields() {
        let record = JobRecord {
            id: "job-1".to_string(),
            queue: "workflow.order".to_string(),
            name: "order".to_string(),
            data: serde_json::json!({"amount": 12}),
            state: JobState::WaitingChildren,
            fail_parent_on_failure: true,
            parent: Some(("workflow.order".to_string(), "root".to_string())),
            children: vec![("workflow.order.steps".to_string(), "child-1".to_string())],
            pending_children: 1,
            return_value: None,
            failed_reason: None,
        };

        let fields: HashMap<String, String> = record
            .to_fields()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        let restored = JobRecord::from_fields("job-1", &fields).unwrap();

        assert_eq!(restored.queue, record.queue);
        assert_eq!(restored.state, record.state);
        assert_eq!(restored.parent, record.parent);
        assert_eq!(restored.children, record.children);
        assert_eq!(restored.pending_children, record.pending_children);
    }

    #[test]
    fn missing_required_field_yields_none() {
        let fields = HashMap::new();
        assert!(JobRecord::from_fields("job-1", &fields).is_none());
    }
}
