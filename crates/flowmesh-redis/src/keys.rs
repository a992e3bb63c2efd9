//! Key and channel naming for the Redis-backed store. Centralized so every caller
//! agrees on the same namespace under a configured prefix.

pub(crate) fn job_key(prefix: &str, queue: &str, job_id: &str) -> String {
    format!("{prefix}:job:{{{queue}}}:{job_id}")
}

pub(crate) fn ready_key(prefix: &str, queue: &str) -> String {
    format!("{prefix}:ready:{{{queue}}}")
}

pub(crate) fn events_channel(prefix: &str, queue: &str) -> String {
    format!("{prefix}:events:{queue}")
}

pub(crate) fn schedules_key(prefix: &str, queue: &str) -> String {
    format!("{prefix}:schedules:{{{queue}}}")
}

pub(crate) fn dlq_key(prefix: &str, queue: &str) -> String {
    format!("{prefix}:dlq:{{{queue}}}")
}

pub(crate) fn kv_key(prefix: &str, key: &str) -> String {
    format!("{prefix}:kv:{key}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_under_the_prefix() {
        assert_eq!(job_key("fm", "q", "j1"), "fm:job:{q}:j1");
        assert_eq!(ready_key("fm", "q"), "fm:ready:{q}");
        assert_eq!(events_channel("fm", "q"), "fm:events:q");
        assert_eq!(kv_key("fm", "flow:abc"), "fm:kv:flow:abc");
    }
}
