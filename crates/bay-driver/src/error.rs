use thiserror::Error;

pub type DriverResult<T> = Result<T, DriverError>;

/// Errors surfaced by driver implementations.
///
/// A platform-level 404 is translated to [`DriverError::NotFound`] so callers
/// can distinguish "already gone" (loggable, ignorable on stop/destroy) from
/// genuine platform failures, which propagate unchanged.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("{driver}: {resource} not found")]
    NotFound { driver: &'static str, resource: String },

    #[error("{driver}: {message}")]
    Platform {
        driver: &'static str,
        status: Option<u16>,
        message: String,
    },

    /// Terminal startup failure (pod entered Failed, readiness budget spent).
    #[error("{driver}: {message}")]
    Startup { driver: &'static str, message: String },
}

impl DriverError {
    pub fn driver_kind(&self) -> &'static str {
        match self {
            DriverError::NotFound { driver, .. }
            | DriverError::Platform { driver, .. }
            | DriverError::Startup { driver, .. } => driver,
        }
    }

    pub fn platform_status(&self) -> Option<u16> {
        match self {
            DriverError::NotFound { .. } => Some(404),
            DriverError::Platform { status, .. } => *status,
            DriverError::Startup { .. } => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, DriverError::NotFound { .. })
    }
}
