//! Chat core error types.

use thiserror::Error;

/// Errors returned by controller housekeeping verbs.
///
/// Turn failures are not reported through this type: a failed turn is rolled
/// back and its message recorded as the controller's last error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// The operation is not allowed while a reply is streaming.
    #[error("a turn is already in flight")]
    TurnInFlight,
}
