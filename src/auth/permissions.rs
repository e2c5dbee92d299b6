//! Structural permission evaluation.
//!
//! Permissions are plain strings of the form `resource:action`, the wildcard
//! `resource:*`, or the superuser token `system:*`. Exactly one wildcard
//! level is supported; deeper hierarchies are intentionally unsupported.

use std::collections::HashSet;

/// The superuser escape hatch; grants everything unconditionally
pub const SUPERUSER_PERMISSION: &str = "system:*";

/// Check whether a held permission set satisfies one required permission
pub fn evaluate(held: &HashSet<String>, required: &str) -> bool {
    if held.contains(SUPERUSER_PERMISSION) {
        return true;
    }
    if held.contains(required) {
        return true;
    }
    match required.split_once(':') {
        Some((resource, _action)) => held.contains(&format!("{resource}:*")),
        // A permission without a resource prefix only matches exactly
        None => false,
    }
}

/// Logical OR of [`evaluate`] over the required permissions
pub fn has_any(held: &HashSet<String>, required: &[&str]) -> bool {
    required.iter().any(|permission| evaluate(held, permission))
}

/// Logical AND of [`evaluate`] over the required permissions
pub fn has_all(held: &HashSet<String>, required: &[&str]) -> bool {
    required.iter().all(|permission| evaluate(held, permission))
}
