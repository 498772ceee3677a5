//! Label vocabulary stamped on every driver-created resource.
//!
//! Labels are the sole means the garbage collector uses to identify its own
//! resources; unlabelled resources are never touched. The key set is shared
//! by both drivers, prefixed per platform (`bay.owner`, `bay.session_id`,
//! ...). The `instance_id` label is this Bay process's fence token and is
//! compared literally by the strict-mode orphan GC.

use std::collections::BTreeMap;

pub type LabelMap = BTreeMap<String, String>;

pub const OWNER: &str = "owner";
pub const SANDBOX_ID: &str = "sandbox_id";
pub const SESSION_ID: &str = "session_id";
pub const CARGO_ID: &str = "cargo_id";
pub const PROFILE_ID: &str = "profile_id";
pub const RUNTIME_PORT: &str = "runtime_port";
pub const INSTANCE_ID: &str = "instance_id";
pub const MANAGED: &str = "managed";
pub const CONTAINER_NAME: &str = "container_name";
pub const RUNTIME_TYPE: &str = "runtime_type";

/// Literal value of the `managed` label.
pub const MANAGED_TRUE: &str = "true";

/// Default label prefix. Kubernetes deployments may override it via
/// `label_prefix`; Docker always uses the default.
pub const DEFAULT_PREFIX: &str = "bay";

/// Builds a platform label key (`bay.session_id`). Drivers prefix on the
/// way out and strip on the way in; the kernel only ever sees bare keys.
pub fn key(prefix: &str, name: &str) -> String {
    format!("{prefix}.{name}")
}

/// Trust predicate used by the strict-mode orphan GC: only resources this
/// process created (managed + matching fence token) may be reclaimed.
pub fn is_trusted(labels: &LabelMap, instance_id: &str) -> bool {
    labels.get(MANAGED).map(String::as_str) == Some(MANAGED_TRUE)
        && labels.get(INSTANCE_ID).map(String::as_str) == Some(instance_id)
}

/// Session id carried by a labelled resource, if any.
pub fn session_id(labels: &LabelMap) -> Option<&str> {
    labels.get(SESSION_ID).map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labelled(pairs: &[(&str, &str)]) -> LabelMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn trust_requires_managed_and_matching_fence() {
        let trusted = labelled(&[("managed", "true"), ("instance_id", "bay-host-1")]);
        assert!(is_trusted(&trusted, "bay-host-1"));

        let other_fence = labelled(&[("managed", "true"), ("instance_id", "other")]);
        assert!(!is_trusted(&other_fence, "bay-host-1"));

        let unmanaged = labelled(&[("instance_id", "bay-host-1")]);
        assert!(!is_trusted(&unmanaged, "bay-host-1"));
    }

    #[test]
    fn session_id_is_read_from_bare_keys() {
        let labels = labelled(&[("session_id", "sess-abc")]);
        assert_eq!(session_id(&labels), Some("sess-abc"));
        assert_eq!(session_id(&LabelMap::new()), None);
    }
}
