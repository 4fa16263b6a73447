//! Identifier generation for lock owners and store instances.

use uuid::Uuid;

/// Generates an identifier for this process's store instance.
#[must_use]
pub fn generate_instance_id() -> String {
    format!("execstore-{}", Uuid::now_v7().simple())
}

/// Generates a fresh lock owner token scoped to an instance.
///
/// Tokens are unique per acquisition, so a stale handle from an earlier
/// acquisition by the same instance never matches a newer one.
#[must_use]
pub fn generate_owner_token(instance_id: &str) -> String {
    format!("{instance_id}:{}", Uuid::new_v4())
}
