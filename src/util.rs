//! Misc utility functions.

use std::any::Any;

/// Helper function used for default boolean values in [`serde`].
///
/// Always returns `true`.
#[must_use]
#[inline]
pub(crate) fn default_true() -> bool {
    true
}

/// Extract human-readable message from a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "<non-string panic payload>"
    }
}
