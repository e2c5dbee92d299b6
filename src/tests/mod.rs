//! Scenario tests exercising the session machine, the refresh coordinator
//! and the realtime channel against scripted collaborators.

mod channel_test;
mod support;

use std::sync::Once;

static TRACING: Once = Once::new();

/// Install a test subscriber once per process so failing tests print the
/// structured logs leading up to the failure
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "trimatch_core=debug".into()),
            )
            .with_test_writer()
            .try_init();
    });
}
