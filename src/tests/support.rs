//! Scripted collaborators shared by the scenario tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::auth::api::{
    AuthApi, AuthenticatedSession, LoginOutcome, MfaSetup, ProfileUpdate, SessionInfo,
    TokenResponse, UserProfile,
};
use crate::auth::token::{Credentials, MfaChallenge, User};
use crate::error::{CoreError, CoreResult};
use crate::event_bus::CoreEvent;
use crate::realtime::protocol::{InboundMessage, OutboundFrame};
use crate::realtime::transport::{ChannelConnection, ChannelTransport};

pub fn test_user() -> User {
    User {
        id: "user-1".to_string(),
        email: "ops@example.com".to_string(),
        display_name: "Ops Person".to_string(),
        avatar_url: None,
    }
}

pub fn completed_session(access: &str, refresh: &str) -> AuthenticatedSession {
    AuthenticatedSession {
        user: test_user(),
        permissions: vec!["invoices:read".to_string(), "imports:*".to_string()],
        tokens: TokenResponse {
            access_token: access.to_string(),
            refresh_token: Some(refresh.to_string()),
            expires_in: 3600,
        },
    }
}

pub fn test_challenge() -> MfaChallenge {
    MfaChallenge {
        user_id: "user-1".to_string(),
        tenant_id: "tenant-1".to_string(),
        challenge_id: "challenge-1".to_string(),
    }
}

pub fn test_profile() -> UserProfile {
    UserProfile {
        user: test_user(),
        permissions: vec!["invoices:read".to_string()],
    }
}

/// Drain every event currently buffered on a bus receiver
pub fn drain_events(rx: &mut broadcast::Receiver<CoreEvent>) -> Vec<CoreEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

/// Scripted [`AuthApi`]: each call pops the next queued result and panics if
/// the test did not script one
#[derive(Default)]
pub struct MockAuthApi {
    login_results: Mutex<VecDeque<CoreResult<LoginOutcome>>>,
    verify_results: Mutex<VecDeque<CoreResult<AuthenticatedSession>>>,
    refresh_results: Mutex<VecDeque<CoreResult<TokenResponse>>>,
    profile_results: Mutex<VecDeque<CoreResult<UserProfile>>>,
    update_results: Mutex<VecDeque<CoreResult<UserProfile>>>,
    mfa_setup_results: Mutex<VecDeque<CoreResult<MfaSetup>>>,
    refresh_delay: Mutex<Option<Duration>>,
    pub refresh_calls: AtomicUsize,
    pub logout_calls: AtomicUsize,
    pub profile_calls: AtomicUsize,
}

impl MockAuthApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script_login(&self, result: CoreResult<LoginOutcome>) {
        self.login_results.lock().unwrap().push_back(result);
    }

    pub fn script_verify(&self, result: CoreResult<AuthenticatedSession>) {
        self.verify_results.lock().unwrap().push_back(result);
    }

    pub fn script_refresh(&self, result: CoreResult<TokenResponse>) {
        self.refresh_results.lock().unwrap().push_back(result);
    }

    pub fn script_profile(&self, result: CoreResult<UserProfile>) {
        self.profile_results.lock().unwrap().push_back(result);
    }

    pub fn script_update(&self, result: CoreResult<UserProfile>) {
        self.update_results.lock().unwrap().push_back(result);
    }

    pub fn script_mfa_setup(&self, result: CoreResult<MfaSetup>) {
        self.mfa_setup_results.lock().unwrap().push_back(result);
    }

    /// Hold each refresh exchange open for `delay` so concurrent callers
    /// can pile onto the in-flight attempt
    pub fn set_refresh_delay(&self, delay: Duration) {
        *self.refresh_delay.lock().unwrap() = Some(delay);
    }
}

#[async_trait]
impl AuthApi for MockAuthApi {
    async fn login(&self, _credentials: &Credentials) -> CoreResult<LoginOutcome> {
        self.login_results
            .lock()
            .unwrap()
            .pop_front()
            .expect("unscripted login call")
    }

    async fn verify_mfa(
        &self,
        _challenge: &MfaChallenge,
        _code: &str,
    ) -> CoreResult<AuthenticatedSession> {
        self.verify_results
            .lock()
            .unwrap()
            .pop_front()
            .expect("unscripted verify_mfa call")
    }

    async fn refresh(&self, _refresh_token: &str) -> CoreResult<TokenResponse> {
        self.refresh_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.refresh_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.refresh_results
            .lock()
            .unwrap()
            .pop_front()
            .expect("unscripted refresh call")
    }

    async fn logout(&self, _access_token: &str, _all_devices: bool) -> CoreResult<()> {
        self.logout_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn fetch_profile(&self, _access_token: &str) -> CoreResult<UserProfile> {
        self.profile_calls.fetch_add(1, Ordering::SeqCst);
        self.profile_results
            .lock()
            .unwrap()
            .pop_front()
            .expect("unscripted fetch_profile call")
    }

    async fn update_profile(
        &self,
        _access_token: &str,
        _update: &ProfileUpdate,
    ) -> CoreResult<UserProfile> {
        self.update_results
            .lock()
            .unwrap()
            .pop_front()
            .expect("unscripted update_profile call")
    }

    async fn mfa_setup(&self, _access_token: &str) -> CoreResult<MfaSetup> {
        self.mfa_setup_results
            .lock()
            .unwrap()
            .pop_front()
            .expect("unscripted mfa_setup call")
    }

    async fn mfa_enable(&self, _access_token: &str, _code: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn mfa_disable(&self, _access_token: &str, _code: &str) -> CoreResult<()> {
        Ok(())
    }

    async fn sessions(&self, _access_token: &str) -> CoreResult<Vec<SessionInfo>> {
        Ok(Vec::new())
    }

    async fn terminate_session(&self, _access_token: &str, _session_id: &str) -> CoreResult<()> {
        Ok(())
    }
}

/// What one scripted dial attempt should do
pub enum DialScript {
    /// The dial itself fails
    Fail,
    /// The dial succeeds; the connection serves `inbound` one message per
    /// read, then errors out if `then_error`, otherwise stays idle
    Connect {
        inbound: Vec<InboundMessage>,
        then_error: bool,
    },
}

/// Scripted [`ChannelTransport`] recording every dial and sent frame
#[derive(Default)]
pub struct MockChannelTransport {
    scripts: Mutex<VecDeque<DialScript>>,
    pub dial_times: Mutex<Vec<tokio::time::Instant>>,
    pub sent: Arc<Mutex<Vec<OutboundFrame>>>,
}

impl MockChannelTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, dial: DialScript) {
        self.scripts.lock().unwrap().push_back(dial);
    }

    pub fn dial_count(&self) -> usize {
        self.dial_times.lock().unwrap().len()
    }

    pub fn sent_frames(&self) -> Vec<OutboundFrame> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelTransport for MockChannelTransport {
    async fn connect(&self, _url: &str) -> CoreResult<Box<dyn ChannelConnection>> {
        self.dial_times
            .lock()
            .unwrap()
            .push(tokio::time::Instant::now());
        // An exhausted script behaves like an unreachable endpoint
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(DialScript::Fail);
        match script {
            DialScript::Fail => Err(CoreError::connection("scripted dial failure")),
            DialScript::Connect {
                inbound,
                then_error,
            } => Ok(Box::new(MockConnection {
                inbound: inbound.into(),
                then_error,
                sent: Arc::clone(&self.sent),
            })),
        }
    }
}

struct MockConnection {
    inbound: VecDeque<InboundMessage>,
    then_error: bool,
    sent: Arc<Mutex<Vec<OutboundFrame>>>,
}

#[async_trait]
impl ChannelConnection for MockConnection {
    async fn send(&mut self, frame: &OutboundFrame) -> CoreResult<()> {
        self.sent.lock().unwrap().push(frame.clone());
        Ok(())
    }

    async fn next_message(&mut self) -> CoreResult<Option<InboundMessage>> {
        if let Some(message) = self.inbound.pop_front() {
            return Ok(Some(message));
        }
        if self.then_error {
            self.then_error = false;
            return Err(CoreError::connection("scripted connection drop"));
        }
        futures::future::pending().await
    }

    async fn close(&mut self) {}
}
