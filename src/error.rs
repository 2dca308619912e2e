use thiserror::Error;

/// Error value carried by a failed promise: a domain/category plus a
/// human-readable message, opaque beyond that.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PromiseError {
    /// Domain failure produced by a reaction or handed to [`error`].
    ///
    /// [`error`]: crate::Promise::error
    #[error("{domain}: {message}")]
    Failure { domain: String, message: String },

    /// Outcome of the argument-less [`error_unspecified`] convenience.
    ///
    /// [`error_unspecified`]: crate::Promise::error_unspecified
    #[error("failed with unspecified error")]
    Unspecified,
}

impl PromiseError {
    /// Builds a domain failure.
    ///
    /// # Examples
    ///
    /// ```
    /// use promise_link::PromiseError;
    /// let err = PromiseError::failure("io", "connection reset");
    /// assert_eq!(err.to_string(), "io: connection reset");
    /// ```
    pub fn failure(domain: impl Into<String>, message: impl Into<String>) -> Self {
        PromiseError::Failure {
            domain: domain.into(),
            message: message.into(),
        }
    }
}

/// `resolve`/`error` was called on a promise whose outcome slot is already
/// claimed. This is a usage bug on the caller's side and is always surfaced,
/// never swallowed.
///
/// Deliberately a separate type from [`PromiseError`]: it reports a misuse of
/// the resolution surface and can never be stored as a promise's outcome.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("promise already resolved")]
pub struct AlreadyResolved;
