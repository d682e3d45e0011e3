//! Replayer error type.

use mirror_core::ImageError;
use thiserror::Error;

/// Terminal status recorded by the replayer.
///
/// Carries an errno-style code plus a human-readable description, matching
/// what [`Replayer::error_code`]/[`Replayer::error_description`] expose to
/// the supervisor. A code of `0` marks a terminal-success reason ("remote
/// image demoted", "force promoted"); such values never escape the public
/// entry points, which only surface codes `< 0`.
///
/// [`Replayer::error_code`]: crate::Replayer::error_code
/// [`Replayer::error_description`]: crate::Replayer::error_description
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{description} (code {code})")]
pub struct ReplayError {
    pub code: i32,
    pub description: String,
}

impl ReplayError {
    pub fn new(code: i32, description: impl Into<String>) -> Self {
        Self {
            code,
            description: description.into(),
        }
    }

    /// Wrap a backend error under the step description that gets recorded.
    pub fn from_image_error(err: &ImageError, description: impl Into<String>) -> Self {
        Self::new(err.code(), description)
    }
}
