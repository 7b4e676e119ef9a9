//! Public error taxonomy

use thiserror::Error;

/// Errors surfaced across the public portal API.
///
/// Internal failures (transport errors, malformed messages, broken
/// invariants) are never surfaced directly; they manifest as peer closure on
/// the affected portals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ApiError {
    /// A handle was invalid or a size out of range.
    #[error("invalid argument")]
    InvalidArgument,

    /// The operation cannot be performed in the object's current state, e.g.
    /// arming an already-satisfied trap or committing a get that was never
    /// begun.
    #[error("failed precondition")]
    FailedPrecondition,

    /// A conflicting operation is already in progress, e.g. a second
    /// two-phase operation on the same portal.
    #[error("already exists")]
    AlreadyExists,

    /// Queue limits would be exceeded, or an output buffer was too small.
    #[error("resource exhausted")]
    ResourceExhausted,

    /// Nothing to retrieve right now, but the peer may still send.
    #[error("unavailable")]
    Unavailable,

    /// Nothing to retrieve and the peer has closed; nothing will ever
    /// arrive.
    #[error("not found")]
    NotFound,

    /// The feature is recognized but not implemented.
    #[error("unimplemented")]
    Unimplemented,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_strings() {
        assert_eq!(ApiError::Unavailable.to_string(), "unavailable");
        assert_eq!(ApiError::NotFound.to_string(), "not found");
    }
}
