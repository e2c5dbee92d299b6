//! REST collaborator consumed by the session machine.
//!
//! The endpoints themselves are backend-owned; this module only models the
//! requests the session lifecycle needs and hides them behind the [`AuthApi`]
//! trait so tests can swap in a scripted implementation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

use crate::auth::token::{Credentials, MfaChallenge, User};
use crate::config::ApiConfig;
use crate::error::{CoreError, CoreResult};

/// Header carrying the opaque per-device identifier for anomaly tracking
const DEVICE_FINGERPRINT_HEADER: &str = "x-device-fingerprint";
/// Header scoping every request to one tenant
const TENANT_HEADER: &str = "x-tenant-id";

/// Token payload as the server reports it. `expires_in` is a lifetime in
/// seconds; the absolute expiry is derived client-side at receipt time. A
/// missing `refresh_token` means the server did not rotate it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Bearer token for API requests
    pub access_token: String,
    /// New refresh token, if the server rotated it
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Access token lifetime in seconds
    pub expires_in: u64,
}

/// Fully authenticated login or verification response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthenticatedSession {
    /// Canonical user record
    pub user: User,
    /// Permission strings granted to the user
    #[serde(default)]
    pub permissions: Vec<String>,
    /// Issued token pair
    pub tokens: TokenResponse,
}

/// The two disjoint success shapes of a login attempt
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    /// Credentials accepted, session established
    Completed(AuthenticatedSession),
    /// Credentials accepted but a second factor is required.
    /// Not an error; no tokens exist yet.
    MfaRequired(MfaChallenge),
}

/// Canonical profile response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserProfile {
    /// Canonical user record
    pub user: User,
    /// Permission strings granted to the user
    #[serde(default)]
    pub permissions: Vec<String>,
}

/// Partial profile update; only the present fields change server-side. The
/// server's canonical response replaces the local record wholesale.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProfileUpdate {
    /// New display name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    /// New login email
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// New avatar URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,
}

/// Enrollment material returned by `POST /auth/mfa/setup`. The secret is
/// shown to the user once and never stored by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MfaSetup {
    /// TOTP shared secret to enroll in an authenticator app
    pub secret: String,
    /// Ready-made `otpauth://` provisioning URL, if the server builds one
    #[serde(default)]
    pub otpauth_url: Option<String>,
}

/// One active session as reported by `GET /auth/sessions`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Server-side session identifier
    pub id: String,
    /// Device description recorded at login
    #[serde(default)]
    pub device: Option<String>,
    /// When the session was established (RFC 3339)
    #[serde(default)]
    pub created_at: Option<String>,
    /// Whether this is the calling session
    #[serde(default)]
    pub current: bool,
}

/// The auth endpoints the session machine consumes
#[async_trait]
pub trait AuthApi: Send + Sync {
    /// `POST /auth/login`
    async fn login(&self, credentials: &Credentials) -> CoreResult<LoginOutcome>;

    /// `POST /auth/mfa/verify`
    async fn verify_mfa(
        &self,
        challenge: &MfaChallenge,
        code: &str,
    ) -> CoreResult<AuthenticatedSession>;

    /// `POST /auth/refresh`
    async fn refresh(&self, refresh_token: &str) -> CoreResult<TokenResponse>;

    /// `POST /auth/logout`
    async fn logout(&self, access_token: &str, all_devices: bool) -> CoreResult<()>;

    /// `GET /auth/me`
    async fn fetch_profile(&self, access_token: &str) -> CoreResult<UserProfile>;

    /// `PUT /auth/me`
    async fn update_profile(
        &self,
        access_token: &str,
        update: &ProfileUpdate,
    ) -> CoreResult<UserProfile>;

    /// `POST /auth/mfa/setup`
    async fn mfa_setup(&self, access_token: &str) -> CoreResult<MfaSetup>;

    /// `POST /auth/mfa/enable`
    async fn mfa_enable(&self, access_token: &str, code: &str) -> CoreResult<()>;

    /// `POST /auth/mfa/disable`
    async fn mfa_disable(&self, access_token: &str, code: &str) -> CoreResult<()>;

    /// `GET /auth/sessions`
    async fn sessions(&self, access_token: &str) -> CoreResult<Vec<SessionInfo>>;

    /// `POST /auth/sessions/terminate`
    async fn terminate_session(&self, access_token: &str, session_id: &str) -> CoreResult<()>;
}

/// [`AuthApi`] implementation over reqwest
pub struct HttpAuthClient {
    client: reqwest::Client,
    config: ApiConfig,
}

enum Method {
    Get,
    Post,
    Put,
}

impl HttpAuthClient {
    /// Create a client for the configured backend
    pub fn new(config: ApiConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    /// Create a client with a custom reqwest instance
    pub fn with_client(client: reqwest::Client, config: ApiConfig) -> Self {
        Self { client, config }
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        bearer: Option<&str>,
        body: Option<Value>,
    ) -> CoreResult<Value> {
        let url = format!("{}{}", self.config.base_url, path);
        let mut request = match method {
            Method::Get => self.client.get(&url),
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
        };

        request = request.header(TENANT_HEADER, &self.config.tenant_id);
        if let Some(fingerprint) = &self.config.device_fingerprint {
            request = request.header(DEVICE_FINGERPRINT_HEADER, fingerprint);
        }
        if let Some(token) = bearer {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| CoreError::connection_with_source("request failed", e))?;
        let status = response.status();
        let retry_after = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs);
        let text = response
            .text()
            .await
            .map_err(|e| CoreError::connection_with_source("failed to read response body", e))?;

        debug!(path = %path, status = status.as_u16(), "Auth API response");

        if status.as_u16() == 401 {
            return Err(CoreError::unauthorized(truncate(&text)));
        }
        if status.as_u16() == 429 {
            return Err(CoreError::RateLimited { retry_after });
        }
        if !status.is_success() {
            return Err(CoreError::api_with_status(truncate(&text), status.as_u16()));
        }
        if text.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| {
            CoreError::Api {
                message: "response body is not valid JSON".into(),
                status: Some(status.as_u16()),
                source: Some(Box::new(e)),
            }
        })
    }
}

fn truncate(body: &str) -> String {
    const LIMIT: usize = 200;
    if body.len() <= LIMIT {
        return body.to_string();
    }
    let mut cut = LIMIT;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}…", &body[..cut])
}

/// A 400/422 on an MFA management call means the one-time code was wrong.
/// 401 is left alone so the caller's refresh-and-retry still applies.
fn map_mfa_code_error(e: CoreError) -> CoreError {
    match e {
        CoreError::Api {
            message,
            status: Some(400 | 422),
            ..
        } => CoreError::mfa_verification(message),
        other => other,
    }
}

fn decode<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> CoreResult<T> {
    serde_json::from_value(value)
        .map_err(|e| CoreError::api(format!("malformed {what} payload: {e}")))
}

#[async_trait]
impl AuthApi for HttpAuthClient {
    async fn login(&self, credentials: &Credentials) -> CoreResult<LoginOutcome> {
        let body = json!({
            "email": credentials.email,
            "password": credentials.password,
        });
        let value = self
            .request(Method::Post, "/auth/login", None, Some(body))
            .await
            .map_err(|e| match e {
                // A 401 on login is bad credentials, not an expired session
                CoreError::Unauthorized { message } => CoreError::authentication(message),
                other => other,
            })?;

        if value
            .get("mfa_required")
            .and_then(Value::as_bool)
            .unwrap_or(false)
        {
            let challenge = value
                .get("challenge")
                .cloned()
                .ok_or_else(|| CoreError::api("MFA-required response without a challenge"))?;
            return Ok(LoginOutcome::MfaRequired(decode(challenge, "challenge")?));
        }
        Ok(LoginOutcome::Completed(decode(value, "login")?))
    }

    async fn verify_mfa(
        &self,
        challenge: &MfaChallenge,
        code: &str,
    ) -> CoreResult<AuthenticatedSession> {
        let body = json!({
            "user_id": challenge.user_id,
            "tenant_id": challenge.tenant_id,
            "challenge_id": challenge.challenge_id,
            "code": code,
        });
        let value = self
            .request(Method::Post, "/auth/mfa/verify", None, Some(body))
            .await
            .map_err(|e| match e {
                CoreError::Unauthorized { message } => CoreError::mfa_verification(message),
                CoreError::Api {
                    message,
                    status: Some(400 | 422),
                    ..
                } => CoreError::mfa_verification(message),
                other => other,
            })?;
        decode(value, "verification")
    }

    async fn refresh(&self, refresh_token: &str) -> CoreResult<TokenResponse> {
        let body = json!({ "refresh_token": refresh_token });
        let value = self
            .request(Method::Post, "/auth/refresh", None, Some(body))
            .await?;
        decode(value, "refresh")
    }

    async fn logout(&self, access_token: &str, all_devices: bool) -> CoreResult<()> {
        let body = json!({ "all_devices": all_devices });
        self.request(Method::Post, "/auth/logout", Some(access_token), Some(body))
            .await?;
        Ok(())
    }

    async fn fetch_profile(&self, access_token: &str) -> CoreResult<UserProfile> {
        let value = self
            .request(Method::Get, "/auth/me", Some(access_token), None)
            .await?;
        decode(value, "profile")
    }

    async fn update_profile(
        &self,
        access_token: &str,
        update: &ProfileUpdate,
    ) -> CoreResult<UserProfile> {
        let body = serde_json::to_value(update)
            .map_err(|e| CoreError::api(format!("failed to serialize profile update: {e}")))?;
        let value = self
            .request(Method::Put, "/auth/me", Some(access_token), Some(body))
            .await?;
        decode(value, "profile")
    }

    async fn mfa_setup(&self, access_token: &str) -> CoreResult<MfaSetup> {
        let value = self
            .request(Method::Post, "/auth/mfa/setup", Some(access_token), None)
            .await?;
        decode(value, "MFA setup")
    }

    async fn mfa_enable(&self, access_token: &str, code: &str) -> CoreResult<()> {
        let body = json!({ "code": code });
        self.request(Method::Post, "/auth/mfa/enable", Some(access_token), Some(body))
            .await
            .map_err(map_mfa_code_error)?;
        Ok(())
    }

    async fn mfa_disable(&self, access_token: &str, code: &str) -> CoreResult<()> {
        let body = json!({ "code": code });
        self.request(Method::Post, "/auth/mfa/disable", Some(access_token), Some(body))
            .await
            .map_err(map_mfa_code_error)?;
        Ok(())
    }

    async fn sessions(&self, access_token: &str) -> CoreResult<Vec<SessionInfo>> {
        let value = self
            .request(Method::Get, "/auth/sessions", Some(access_token), None)
            .await?;
        decode(value, "sessions")
    }

    async fn terminate_session(&self, access_token: &str, session_id: &str) -> CoreResult<()> {
        let body = json!({ "session_id": session_id });
        self.request(
            Method::Post,
            "/auth/sessions/terminate",
            Some(access_token),
            Some(body),
        )
        .await?;
        Ok(())
    }
}
