//! Authentication: tokens, durable storage, permission checks, coordinated
//! refresh and the session state machine.

pub mod api;
pub mod permissions;
pub mod refresh;
pub mod session;
pub mod storage;
pub mod token;

pub use api::{
    AuthApi, AuthenticatedSession, HttpAuthClient, LoginOutcome, MfaSetup, ProfileUpdate,
    SessionInfo, TokenResponse, UserProfile,
};
pub use refresh::TokenRefreshCoordinator;
pub use session::SessionManager;
pub use storage::{JsonFileTokenStore, MemoryTokenStore, StoreEvent, StoredTokens, TokenStore};
pub use token::{
    AuthTokens, Credentials, MfaChallenge, SessionState, SessionStateKind, User,
};
