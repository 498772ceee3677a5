//! Capability routing: which runtime container gets the call.
//!
//! Enforcement happens before any compute is started: a request for a
//! capability the profile does not declare is rejected without provisioning
//! a container.

use bay_db::SessionRecord;
use bay_driver::{ContainerSpec, Profile};

use crate::error::{BayError, BayResult};

/// The routing decision for one capability call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCapability {
    pub container_name: String,
    pub runtime_type: String,
    pub endpoint: String,
}

/// Validates the capability against the profile without touching compute.
pub fn require_capability(profile: &Profile, capability: &str) -> BayResult<ContainerSpec> {
    profile
        .find_container_for_capability(capability)
        .ok_or_else(|| BayError::CapabilityNotSupported {
            capability: capability.to_string(),
            profile_id: profile.id.clone(),
            available: profile.available_capabilities(),
        })
}

/// Routes a capability call on a session to the serving container's
/// endpoint. The session must be ready; a missing endpoint means the
/// caller raced a startup or teardown and should retry.
pub fn resolve_endpoint(
    profile: &Profile,
    session: &SessionRecord,
    capability: &str,
) -> BayResult<ResolvedCapability> {
    let spec = require_capability(profile, capability)?;

    let endpoint = match &session.containers {
        Some(descriptors) => descriptors
            .iter()
            .find(|d| d.name == spec.name)
            .and_then(|d| d.endpoint.clone()),
        None => session.endpoint.clone(),
    };

    match endpoint {
        Some(endpoint) => Ok(ResolvedCapability {
            container_name: spec.name,
            runtime_type: spec.runtime_type,
            endpoint,
        }),
        None => Err(BayError::SessionNotReady {
            sandbox_id: session.sandbox_id.clone(),
            retry_after_ms: 1000,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bay_db::{ContainerDescriptor, SessionState};
    use bay_driver::ContainerSpec as Spec;
    use chrono::Utc;

    fn session_with(
        endpoint: Option<&str>,
        containers: Option<Vec<ContainerDescriptor>>,
    ) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            id: "sess-1".into(),
            sandbox_id: "sandbox-1".into(),
            profile_id: "p".into(),
            runtime_type: "ship".into(),
            desired_state: SessionState::Running,
            observed_state: SessionState::Running,
            container_id: Some("cid-1".into()),
            endpoint: endpoint.map(str::to_string),
            containers,
            created_at: now,
            last_active_at: now,
            last_observed_at: None,
        }
    }

    fn browser_python_profile() -> Profile {
        Profile::multi(
            "browser-python",
            vec![
                Spec::new("ship", "ship:latest")
                    .with_capabilities(&["python", "shell", "filesystem"])
                    .with_primary_for(&["filesystem"]),
                Spec::new("browser", "gull:latest")
                    .with_runtime_type("browser")
                    .with_capabilities(&["browser", "filesystem"]),
            ],
        )
    }

    #[test]
    fn rejects_undeclared_capability_with_available_set() {
        let profile = Profile::single("python-default", "ship:latest");
        let err = require_capability(&profile, "browser").unwrap_err();
        match err {
            BayError::CapabilityNotSupported { available, .. } => {
                assert!(available.iter().any(|c| c == "python"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn single_container_routes_to_session_endpoint() {
        let profile = Profile::single("python-default", "ship:latest");
        let session = session_with(Some("http://10.0.0.2:8123"), None);

        let resolved = resolve_endpoint(&profile, &session, "python").unwrap();
        assert_eq!(resolved.endpoint, "http://10.0.0.2:8123");
        assert_eq!(resolved.container_name, "primary");
    }

    #[test]
    fn multi_container_routes_by_capability() {
        let profile = browser_python_profile();
        let session = session_with(
            Some("http://10.0.0.2:8123"),
            Some(vec![
                ContainerDescriptor {
                    name: "ship".into(),
                    container_id: "cid-ship".into(),
                    runtime_type: "ship".into(),
                    capabilities: vec!["python".into(), "shell".into(), "filesystem".into()],
                    endpoint: Some("http://10.0.0.2:8123".into()),
                    status: "running".into(),
                },
                ContainerDescriptor {
                    name: "browser".into(),
                    container_id: "cid-browser".into(),
                    runtime_type: "browser".into(),
                    capabilities: vec!["browser".into(), "filesystem".into()],
                    endpoint: Some("http://10.0.0.3:8123".into()),
                    status: "running".into(),
                },
            ]),
        );

        let python = resolve_endpoint(&profile, &session, "python").unwrap();
        assert_eq!(python.container_name, "ship");
        assert_eq!(python.endpoint, "http://10.0.0.2:8123");

        let browser = resolve_endpoint(&profile, &session, "browser").unwrap();
        assert_eq!(browser.container_name, "browser");
        assert_eq!(browser.endpoint, "http://10.0.0.3:8123");

        // primary_for beats declaration order for shared capabilities.
        let filesystem = resolve_endpoint(&profile, &session, "filesystem").unwrap();
        assert_eq!(filesystem.container_name, "ship");
    }

    #[test]
    fn missing_endpoint_is_a_retryable_not_ready() {
        let profile = Profile::single("python-default", "ship:latest");
        let session = session_with(None, None);

        let err = resolve_endpoint(&profile, &session, "python").unwrap_err();
        assert_eq!(err.code(), "session_not_ready");
    }
}
