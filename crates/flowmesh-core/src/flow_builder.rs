//! Flow Builder: translates an ordered list of step groups into a dependency-ordered
//! job tree rooted at a workflow job (§4.3).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::context::PropagationMeta;
use crate::reliability::RetryPolicy;
use crate::store::{BackoffKind, BackoffSpec, JobOptions, JobSpec};

/// A step group: an ordered chain where each step waits on the previous, or an
/// unordered set that all run concurrently (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepGroup {
    Sequential(Vec<String>),
    Parallel(Vec<String>),
}

/// Tagged workflow-job payload (§9 "Dispatch and variants").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowJobData {
    pub kind: &'static str,
    pub version: u32,
    pub flow_id: String,
    pub workflow_data: Value,
    pub meta: Option<PropagationMeta>,
}

/// Payload every step job (and the parallel synthetic job) carries alongside its
/// dependency wiring: the flow-id, the original workflow input, and propagation meta —
/// everything the step worker needs to rebuild a [`crate::context::WorkflowContext`]
/// without a second round-trip to the root workflow job (§4.8.2). `root_job_id` lets a
/// step worker running on the same instance that submitted the flow reject that flow's
/// pending latch directly on failure, without waiting on the `fail_parent_on_failure`
/// cascade to reach the root and round-trip through the durable event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepJobData {
    pub kind: &'static str,
    pub flow_id: String,
    pub root_job_id: String,
    pub workflow_data: Value,
    pub meta: Option<PropagationMeta>,
}

/// Everything the Workflow Provider needs to install a pending latch before submission
/// and then submit the tree (§4.3 "mintable before submission").
pub struct FlowPlan {
    pub tree: JobSpec,
    pub root_job_id: String,
    pub workflow_queue: String,
    pub step_queue: String,
}

pub fn workflow_queue_name(queue_prefix: &str, workflow_name: &str) -> String {
    format!("{queue_prefix}.{workflow_name}")
}

pub fn step_queue_name(queue_prefix: &str, workflow_name: &str) -> String {
    format!("{queue_prefix}.{workflow_name}.steps")
}

/// Synthetic step name for a parallel group, e.g. `__parallel__:mul2,mul3` (§4.3, §6).
pub fn parallel_step_name(members: &[String]) -> String {
    format!("__parallel__:{}", members.join(","))
}

/// True if `name` names a parallel-group synthetic job (§4.8.2).
pub fn is_parallel_step_name(name: &str) -> bool {
    name.starts_with("__parallel__:")
}

/// Parses the member names out of a parallel-group synthetic step name.
pub fn parallel_members(name: &str) -> Vec<String> {
    name.trim_start_matches("__parallel__:")
        .split(',')
        .map(str::to_string)
        .filter(|s| !s.is_empty())
        .collect()
}

fn retry_to_opts(retry: Option<&RetryPolicy>) -> (Option<u32>, Option<BackoffSpec>) {
    match retry {
        Some(policy) => (
            Some(policy.max_attempts),
            Some(BackoffSpec {
                kind: BackoffKind::Exponential,
                base: policy.initial_interval,
            }),
        ),
        None => (None, None),
    }
}

/// Derives a step job's deterministic id from an idempotency key (§4.3, §4.8.8). Colons
/// in a parallel synthetic step's name are replaced because the backing store reserves
/// `:` as its own internal delimiter — only `-` separates key, `step`, and name.
fn derived_step_id(idempotency_key: Option<&str>, step_name: &str) -> Option<String> {
    idempotency_key.map(|key| format!("{key}-step-{}", step_name.replace(':', "_")))
}

fn make_step_job(
    step_queue: &str,
    step_name: &str,
    data: Value,
    children: Vec<JobSpec>,
    idempotency_key: Option<&str>,
    retry: Option<&RetryPolicy>,
) -> JobSpec {
    let (attempts, backoff) = retry_to_opts(retry);
    JobSpec {
        name: step_name.to_string(),
        queue_name: step_queue.to_string(),
        data,
        opts: JobOptions {
            job_id: derived_step_id(idempotency_key, step_name),
            attempts,
            backoff,
            fail_parent_on_failure: true,
            ..Default::default()
        },
        children,
    }
}

/// Builds the dependency-ordered job tree for one flow execution (§4.3).
///
/// `groups` are processed left to right; each group's local chain is built deepest
/// node first, and the previous group's top node becomes a child of the next group's
/// deepest node, so the final top node is the single child of the root workflow job.
pub fn build(
    workflow_name: &str,
    flow_id: &str,
    queue_prefix: &str,
    groups: &[StepGroup],
    workflow_data: Value,
    meta: Option<PropagationMeta>,
    idempotency_key: Option<&str>,
    retry: Option<&RetryPolicy>,
) -> FlowPlan {
    let workflow_queue = workflow_queue_name(queue_prefix, workflow_name);
    let step_queue = step_queue_name(queue_prefix, workflow_name);
    let root_job_id = idempotency_key
        .map(str::to_string)
        .unwrap_or_else(|| flow_id.to_string());

    let step_data = serde_json::to_value(StepJobData {
        kind: "step",
        flow_id: flow_id.to_string(),
        root_job_id: root_job_id.clone(),
        workflow_data: workflow_data.clone(),
        meta: meta.clone(),
    })
    .expect("step job data always serializes");

    let mut top: Option<JobSpec> = None;
    for group in groups {
        top = Some(match group {
            StepGroup::Sequential(names) => {
                let mut node: Option<JobSpec> = None;
                for (i, name) in names.iter().enumerate() {
                    let children = if i == 0 {
                        top.take().into_iter().collect()
                    } else {
                        vec![node.take().expect("previous sequential node")]
                    };
                    node = Some(make_step_job(
                        &step_queue,
                        name,
                        step_data.clone(),
                        children,
                        idempotency_key,
                        retry,
                    ));
                }
                node.expect("sequential group has at least one step")
            }
            StepGroup::Parallel(members) => {
                let synthetic_name = parallel_step_name(members);
                let children = top.take().into_iter().collect();
                make_step_job(
                    &step_queue,
                    &synthetic_name,
                    step_data.clone(),
                    children,
                    idempotency_key,
                    retry,
                )
            }
        });
    }

    let root_data = serde_json::to_value(WorkflowJobData {
        kind: "workflow",
        version: 1,
        flow_id: flow_id.to_string(),
        workflow_data,
        meta,
    })
    .expect("workflow job data always serializes");

    let tree = JobSpec {
        name: workflow_name.to_string(),
        queue_name: workflow_queue.clone(),
        data: root_data,
        opts: JobOptions {
            job_id: Some(root_job_id.clone()),
            ..Default::default()
        },
        children: top.into_iter().collect(),
    };

    FlowPlan {
        tree,
        root_job_id,
        workflow_queue,
        step_queue,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_names(spec: &JobSpec) -> Vec<String> {
        let mut order = Vec::new();
        fn walk(spec: &JobSpec, order: &mut Vec<String>) {
            for child in &spec.children {
                walk(child, order);
            }
            order.push(spec.name.clone());
        }
        walk(spec, &mut order);
        order
    }

    #[test]
    fn sequential_chain_is_deepest_first() {
        let groups = vec![StepGroup::Sequential(vec![
            "double".into(),
            "add10".into(),
        ])];
        let plan = build("w", "flow-1", "workflow", &groups, Value::Null, None, None, None);
        // deepest (earliest-running) child of root is `double`, topmost is `add10`
        let root_child = &plan.tree.children[0];
        assert_eq!(root_child.name, "add10");
        assert_eq!(root_child.children[0].name, "double");
    }

    #[test]
    fn plan_order_matches_spec_example() {
        // seq[A,B,C], par[X,Y], seq[D]
        let groups = vec![
            StepGroup::Sequential(vec!["a".into(), "b".into(), "c".into()]),
            StepGroup::Parallel(vec!["x".into(), "y".into()]),
            StepGroup::Sequential(vec!["d".into()]),
        ];
        let plan = build("w", "flow-1", "workflow", &groups, Value::Null, None, None, None);
        let order = leaf_names(&plan.tree);
        // a before b before c before the parallel synthetic job before d
        let pos = |n: &str| order.iter().position(|x| x == n).unwrap();
        assert!(pos("a") < pos("b"));
        assert!(pos("b") < pos("c"));
        assert!(pos("c") < pos("__parallel__:x,y"));
        assert!(pos("__parallel__:x,y") < pos("d"));
    }

    #[test]
    fn idempotency_key_derives_root_and_step_ids() {
        let groups = vec![StepGroup::Sequential(vec!["double".into()])];
        let plan = build(
            "w",
            "flow-1",
            "workflow",
            &groups,
            Value::Null,
            None,
            Some("order-42"),
            None,
        );
        assert_eq!(plan.root_job_id, "order-42");
        assert_eq!(
            plan.tree.children[0].opts.job_id,
            Some("order-42-step-double".to_string())
        );
    }

    #[test]
    fn parallel_synthetic_step_id_replaces_colon() {
        let groups = vec![StepGroup::Parallel(vec!["x".into(), "y".into()])];
        let plan = build(
            "w",
            "flow-1",
            "workflow",
            &groups,
            Value::Null,
            None,
            Some("key"),
            None,
        );
        let step_id = plan.tree.children[0].opts.job_id.clone().unwrap();
        assert!(!step_id.contains(':'));
        assert_eq!(step_id, "key-step-__parallel___x,y");
    }

    #[test]
    fn retry_policy_propagates_to_step_jobs_only() {
        let groups = vec![StepGroup::Sequential(vec!["double".into()])];
        let retry = RetryPolicy::exponential().with_max_attempts(7);
        let plan = build(
            "w",
            "flow-1",
            "workflow",
            &groups,
            Value::Null,
            None,
            None,
            Some(&retry),
        );
        assert_eq!(plan.tree.children[0].opts.attempts, Some(7));
        assert_eq!(plan.tree.opts.attempts, None);
    }

    #[test]
    fn every_step_job_fails_its_parent() {
        let groups = vec![StepGroup::Sequential(vec!["a".into(), "b".into()])];
        let plan = build("w", "flow-1", "workflow", &groups, Value::Null, None, None, None);
        assert!(plan.tree.children[0].opts.fail_parent_on_failure);
        assert!(plan.tree.children[0].children[0].opts.fail_parent_on_failure);
    }

    #[test]
    fn queue_names_follow_the_naming_scheme() {
        assert_eq!(workflow_queue_name("workflow", "onboarding"), "workflow.onboarding");
        assert_eq!(
            step_queue_name("workflow", "onboarding"),
            "workflow.onboarding.steps"
        );
    }

    #[test]
    fn parallel_member_parsing_round_trips() {
        let name = parallel_step_name(&["mul2".to_string(), "mul3".to_string()]);
        assert_eq!(name, "__parallel__:mul2,mul3");
        assert!(is_parallel_step_name(&name));
        assert_eq!(parallel_members(&name), vec!["mul2", "mul3"]);
    }
}
