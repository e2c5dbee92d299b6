use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use uuid::Uuid;

/// Identity record for the current user. Replaced wholesale on every
/// successful authentication or profile update, never partially mutated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Stable user identifier
    pub id: String,
    /// Login email
    pub email: String,
    /// Name shown in the UI
    pub display_name: String,
    /// Optional avatar image URL
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// Credentials for a primary login attempt
#[derive(Debug, Clone, Serialize)]
pub struct Credentials {
    /// Login email
    pub email: String,
    /// Plaintext password, sent over the platform-secured transport
    pub password: String,
}

/// Access/refresh token pair held in memory while authenticated.
///
/// `expires_at` is always derived as `issued_at + expires_in`; a refresh
/// preserves the existing refresh token unless the server issues a new one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthTokens {
    /// Bearer token for API requests
    pub access_token: String,
    /// Token used to obtain new access tokens
    pub refresh_token: String,
    /// When the access token expires
    pub expires_at: DateTime<Utc>,
}

impl AuthTokens {
    /// Build a token pair from a server response that reports a lifetime
    pub fn from_expires_in(
        access_token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_in_secs: u64,
    ) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: refresh_token.into(),
            expires_at: Utc::now() + Duration::seconds(expires_in_secs as i64),
        }
    }

    /// Check if the access token is expired
    pub fn is_expired(&self) -> bool {
        self.expires_at <= Utc::now()
    }

    /// Seconds until the access token expires (negative once expired)
    pub fn seconds_until_expiration(&self) -> i64 {
        (self.expires_at - Utc::now()).num_seconds()
    }

    /// Whether the scheduled renewal should refresh this token at `now`.
    /// Fires once the remaining lifetime drops to `threshold_secs`.
    pub fn needs_renewal_at(&self, now: DateTime<Utc>, threshold_secs: i64) -> bool {
        (self.expires_at - now).num_seconds() <= threshold_secs
    }
}

/// MFA step-up challenge returned by a login attempt the backend marked as
/// requiring a second factor. Consumed exactly once by a successful
/// verification; never persisted durably.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MfaChallenge {
    /// User the challenge was issued for
    pub user_id: String,
    /// Tenant scope of the challenge
    pub tenant_id: String,
    /// Opaque correlation identifier for the pending verification
    #[serde(default = "new_challenge_id")]
    pub challenge_id: String,
}

fn new_challenge_id() -> String {
    Uuid::new_v4().to_string()
}

/// Discriminated session state; exactly one member is active at a time.
/// Transitioning into any state other than `Authenticating` clears a
/// previously pending MFA challenge.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionState {
    /// No valid session
    Unauthenticated,
    /// A login request is in flight
    Authenticating,
    /// Primary credentials accepted, second factor outstanding
    MfaPending(MfaChallenge),
    /// Fully authenticated
    Authenticated {
        /// Current user identity
        user: User,
        /// In-memory mirror of the durable token pair
        tokens: AuthTokens,
        /// Permission strings granted to the user
        permissions: HashSet<String>,
    },
}

impl SessionState {
    /// Lightweight discriminant for events and error messages
    pub fn kind(&self) -> SessionStateKind {
        match self {
            SessionState::Unauthenticated => SessionStateKind::Unauthenticated,
            SessionState::Authenticating => SessionStateKind::Authenticating,
            SessionState::MfaPending(_) => SessionStateKind::MfaPending,
            SessionState::Authenticated { .. } => SessionStateKind::Authenticated,
        }
    }

    /// Whether a user is currently authenticated
    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated { .. })
    }
}

/// Serializable discriminant of [`SessionState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStateKind {
    /// No valid session
    Unauthenticated,
    /// A login request is in flight
    Authenticating,
    /// Awaiting a second factor
    MfaPending,
    /// Fully authenticated
    Authenticated,
}

impl std::fmt::Display for SessionStateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionStateKind::Unauthenticated => "Unauthenticated",
            SessionStateKind::Authenticating => "Authenticating",
            SessionStateKind::MfaPending => "MfaPending",
            SessionStateKind::Authenticated => "Authenticated",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_derive_expiry_from_lifetime() {
        let tokens = AuthTokens::from_expires_in("at", "rt", 3600);
        let remaining = tokens.seconds_until_expiration();
        assert!((3595..=3600).contains(&remaining));
        assert!(!tokens.is_expired());
    }

    #[test]
    fn renewal_fires_at_or_below_threshold_only() {
        let now = Utc::now();
        let just_inside = AuthTokens {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            expires_at: now + Duration::seconds(4 * 60 + 59),
        };
        let just_outside = AuthTokens {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            expires_at: now + Duration::seconds(5 * 60 + 1),
        };
        assert!(just_inside.needs_renewal_at(now, 300));
        assert!(!just_outside.needs_renewal_at(now, 300));
    }

    #[test]
    fn expired_token_reports_expired() {
        let tokens = AuthTokens {
            access_token: "at".into(),
            refresh_token: "rt".into(),
            expires_at: Utc::now() - Duration::seconds(10),
        };
        assert!(tokens.is_expired());
        assert!(tokens.seconds_until_expiration() < 0);
    }

    #[test]
    fn state_kind_matches_variant() {
        assert_eq!(
            SessionState::Unauthenticated.kind(),
            SessionStateKind::Unauthenticated
        );
        let pending = SessionState::MfaPending(MfaChallenge {
            user_id: "u1".into(),
            tenant_id: "t1".into(),
            challenge_id: "c1".into(),
        });
        assert_eq!(pending.kind(), SessionStateKind::MfaPending);
        assert!(!pending.is_authenticated());
    }
}
