use bay_driver::DriverError;
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use thiserror::Error;

pub type BayResult<T> = Result<T, BayError>;

/// Error taxonomy surfaced to callers. Every variant carries a stable
/// machine-readable code (see [`BayError::code`]); retry-safe variants carry
/// an advisory delay.
#[derive(Debug, Error)]
pub enum BayError {
    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("sandbox {sandbox_id} has expired")]
    SandboxExpired {
        sandbox_id: String,
        expires_at: DateTime<Utc>,
    },

    #[error("sandbox {sandbox_id} has no TTL to extend")]
    SandboxTtlInfinite { sandbox_id: String },

    #[error("session for sandbox {sandbox_id} is starting")]
    SessionNotReady {
        sandbox_id: String,
        retry_after_ms: u64,
    },

    #[error("capability '{capability}' is not supported by profile {profile_id}")]
    CapabilityNotSupported {
        capability: String,
        profile_id: String,
        available: Vec<String>,
    },

    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl BayError {
    pub fn code(&self) -> &'static str {
        match self {
            BayError::NotFound(_) => "not_found",
            BayError::Conflict(_) => "conflict",
            BayError::SandboxExpired { .. } => "sandbox_expired",
            BayError::SandboxTtlInfinite { .. } => "sandbox_ttl_infinite",
            BayError::SessionNotReady { .. } => "session_not_ready",
            BayError::CapabilityNotSupported { .. } => "capability_not_supported",
            BayError::Validation(_) => "validation_error",
            BayError::Driver(_) => "driver_error",
            BayError::Internal(_) => "internal_error",
        }
    }

    /// Structured details attached to the error body, if any.
    pub fn details(&self) -> Option<Value> {
        match self {
            BayError::SandboxExpired {
                sandbox_id,
                expires_at,
            } => Some(json!({
                "sandbox_id": sandbox_id,
                "expires_at": expires_at.to_rfc3339(),
            })),
            BayError::SandboxTtlInfinite { sandbox_id } => {
                Some(json!({ "sandbox_id": sandbox_id }))
            }
            BayError::SessionNotReady {
                sandbox_id,
                retry_after_ms,
            } => Some(json!({
                "sandbox_id": sandbox_id,
                "retry_after_ms": retry_after_ms,
            })),
            BayError::CapabilityNotSupported { available, .. } => {
                Some(json!({ "available_capabilities": available }))
            }
            BayError::Driver(err) => Some(json!({
                "driver": err.driver_kind(),
                "platform_status": err.platform_status(),
            })),
            _ => None,
        }
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            BayError::SessionNotReady { retry_after_ms, .. } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(BayError::NotFound("x".into()).code(), "not_found");
        assert_eq!(
            BayError::SessionNotReady {
                sandbox_id: "sandbox-1".into(),
                retry_after_ms: 1000,
            }
            .code(),
            "session_not_ready"
        );
        assert_eq!(
            BayError::SandboxTtlInfinite {
                sandbox_id: "sandbox-1".into()
            }
            .code(),
            "sandbox_ttl_infinite"
        );
    }

    #[test]
    fn capability_details_carry_available_set() {
        let err = BayError::CapabilityNotSupported {
            capability: "browser".into(),
            profile_id: "python-default".into(),
            available: vec!["python".into(), "shell".into()],
        };
        let details = err.details().unwrap();
        assert_eq!(
            details["available_capabilities"],
            serde_json::json!(["python", "shell"])
        );
    }

    #[test]
    fn retry_hint_only_on_session_not_ready() {
        let not_ready = BayError::SessionNotReady {
            sandbox_id: "sandbox-1".into(),
            retry_after_ms: 1500,
        };
        assert_eq!(not_ready.retry_after_ms(), Some(1500));
        assert_eq!(BayError::Validation("bad".into()).retry_after_ms(), None);
    }
}
