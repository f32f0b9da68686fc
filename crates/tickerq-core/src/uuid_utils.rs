//! UUIDv7 helpers.
//!
//! Job ids and event ids are UUIDv7, so ids sort by creation time.

use uuid::Uuid;

/// Generate a new time-ordered identifier.
///
/// ```
/// use tickerq_core::uuid_utils::{is_v7, new_v7};
///
/// assert!(is_v7(&new_v7()));
/// ```
#[inline]
pub fn new_v7() -> Uuid {
    Uuid::now_v7()
}

/// Check if a UUID is version 7.
#[inline]
pub fn is_v7(uuid: &Uuid) -> bool {
    uuid.get_version_num() == 7
}
