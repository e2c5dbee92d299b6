//! Error taxonomy for the session and realtime-channel core.
//!
//! Failures that only affect one operation are returned to the immediate
//! caller; failures that invalidate the session's trustworthiness cascade
//! into a full logout at the `SessionManager` level. Channel failures are
//! surfaced as connection state and bus events, never panics.

use std::time::Duration;
use thiserror::Error;

/// Result alias used throughout the crate
pub type CoreResult<T> = Result<T, CoreError>;

/// Unified error type for session and channel operations
#[derive(Error, Debug)]
pub enum CoreError {
    /// Primary credential check failed (bad email/password)
    #[error("Authentication failed: {message}")]
    Authentication {
        /// Error message
        message: String,
        /// Optional context
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// One-time code rejected; the pending challenge remains usable
    #[error("MFA verification failed: {message}")]
    MfaVerification {
        /// Error message
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// No refresh token is stored, so no refresh call was attempted
    #[error("No refresh token available")]
    NoRefreshToken,

    /// The refresh exchange itself failed; forces a logout
    #[error("Token refresh failed: {message}")]
    Refresh {
        /// Error message
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Profile fetch failed after a successful refresh; forces a logout
    #[error("Profile fetch failed: {message}")]
    ProfileFetch {
        /// Error message
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The backend rejected the access token (HTTP 401). Consumed by the
    /// retry wrapper, which refreshes once and retries the request.
    #[error("Request not authorized: {message}")]
    Unauthorized {
        /// Error message
        message: String,
    },

    /// Transport-level channel failure
    #[error("Connection error: {message}")]
    Connection {
        /// Error message
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The reconnect attempt budget was exhausted
    #[error("Reconnect attempts exhausted after {attempts} tries")]
    ReconnectExhausted {
        /// Number of attempts made before giving up
        attempts: u32,
    },

    /// An operation was invoked in a state that does not permit it
    #[error("Operation '{operation}' is not valid in state '{state}'")]
    IllegalState {
        /// The operation that was attempted
        operation: &'static str,
        /// The state the component was in
        state: String,
    },

    /// Generic REST collaborator failure
    #[error("API error: {message}")]
    Api {
        /// Error message
        message: String,
        /// Status code if available
        status: Option<u16>,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Durable token store failure
    #[error("Storage error: {message}")]
    Storage {
        /// Error message
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Rate limited by the backend
    #[error("Rate limited, retry after {retry_after:?}")]
    RateLimited {
        /// Suggested wait before retrying, if the server provided one
        retry_after: Option<Duration>,
    },
}

// Implement Clone manually since we can't derive it due to the error trait
// object; sources are dropped during cloning.
impl Clone for CoreError {
    fn clone(&self) -> Self {
        match self {
            Self::Authentication { message, .. } => Self::Authentication {
                message: message.clone(),
                source: None,
            },
            Self::MfaVerification { message, .. } => Self::MfaVerification {
                message: message.clone(),
                source: None,
            },
            Self::NoRefreshToken => Self::NoRefreshToken,
            Self::Refresh { message, .. } => Self::Refresh {
                message: message.clone(),
                source: None,
            },
            Self::ProfileFetch { message, .. } => Self::ProfileFetch {
                message: message.clone(),
                source: None,
            },
            Self::Unauthorized { message } => Self::Unauthorized {
                message: message.clone(),
            },
            Self::Connection { message, .. } => Self::Connection {
                message: message.clone(),
                source: None,
            },
            Self::ReconnectExhausted { attempts } => Self::ReconnectExhausted {
                attempts: *attempts,
            },
            Self::IllegalState { operation, state } => Self::IllegalState {
                operation,
                state: state.clone(),
            },
            Self::Api {
                message, status, ..
            } => Self::Api {
                message: message.clone(),
                status: *status,
                source: None,
            },
            Self::Storage { message, .. } => Self::Storage {
                message: message.clone(),
                source: None,
            },
            Self::RateLimited { retry_after } => Self::RateLimited {
                retry_after: *retry_after,
            },
        }
    }
}

impl CoreError {
    /// Create a new authentication error
    pub fn authentication(message: impl Into<String>) -> Self {
        Self::Authentication {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new MFA verification error
    pub fn mfa_verification(message: impl Into<String>) -> Self {
        Self::MfaVerification {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new refresh error
    pub fn refresh(message: impl Into<String>) -> Self {
        Self::Refresh {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new refresh error with a source
    pub fn refresh_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Refresh {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new profile fetch error
    pub fn profile_fetch(message: impl Into<String>) -> Self {
        Self::ProfileFetch {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new unauthorized error
    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized {
            message: message.into(),
        }
    }

    /// Create a new connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new connection error with a source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a new illegal state error
    pub fn illegal_state(operation: &'static str, state: impl Into<String>) -> Self {
        Self::IllegalState {
            operation,
            state: state.into(),
        }
    }

    /// Create a new API error
    pub fn api(message: impl Into<String>) -> Self {
        Self::Api {
            message: message.into(),
            status: None,
            source: None,
        }
    }

    /// Create a new API error with a status code
    pub fn api_with_status(message: impl Into<String>, status: u16) -> Self {
        Self::Api {
            message: message.into(),
            status: Some(status),
            source: None,
        }
    }

    /// Create a new storage error
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new storage error with a source
    pub fn storage_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Check if this is an authentication error
    pub fn is_authentication(&self) -> bool {
        matches!(self, Self::Authentication { .. })
    }

    /// Check if this is an unauthorized (401) error
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Self::Unauthorized { .. })
    }

    /// Check if this is a connection error
    pub fn is_connection(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. } | Self::ReconnectExhausted { .. }
        )
    }

    /// Check if this error invalidates the session and must cascade into a
    /// full logout
    pub fn forces_logout(&self) -> bool {
        matches!(
            self,
            Self::NoRefreshToken | Self::Refresh { .. } | Self::ProfileFetch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_drops_source_but_keeps_message() {
        let err = CoreError::refresh_with_source(
            "exchange rejected",
            std::io::Error::new(std::io::ErrorKind::Other, "boom"),
        );
        let cloned = err.clone();
        match cloned {
            CoreError::Refresh { message, source } => {
                assert_eq!(message, "exchange rejected");
                assert!(source.is_none());
            }
            other => panic!("unexpected variant: {other:?}"),
        }
    }

    #[test]
    fn forces_logout_covers_session_invalidating_failures() {
        assert!(CoreError::NoRefreshToken.forces_logout());
        assert!(CoreError::refresh("x").forces_logout());
        assert!(CoreError::profile_fetch("x").forces_logout());
        assert!(!CoreError::authentication("bad credentials").forces_logout());
        assert!(!CoreError::connection("reset").forces_logout());
    }

    #[test]
    fn display_includes_state_for_illegal_transitions() {
        let err = CoreError::illegal_state("verify_mfa", "Unauthenticated");
        assert_eq!(
            err.to_string(),
            "Operation 'verify_mfa' is not valid in state 'Unauthenticated'"
        );
    }
}
