//! The error surface of the library.

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TestctrError>;

/// All failure modes reported by backends, the registry and the container
/// handle.
///
/// Every variant carries a human readable message; [kind](TestctrError::kind)
/// exposes the machine-matchable classification so callers can branch without
/// destructuring. Backend operations never panic - they return one of these.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TestctrError {
    /// The referenced container, backend or resource does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// A resource with the same name already exists on the runtime.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The underlying CLI or daemon failed; the message preserves stderr.
    #[error("runtime failure: {0}")]
    Runtime(String),

    /// An operation exceeded its deadline or was cancelled.
    #[error("deadline exceeded: {0}")]
    Deadline(String),

    /// The selected backend cannot provide the requested feature.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Caller error: empty image, malformed port, missing mount path.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The operation was issued before the container reached the required
    /// state, e.g. a port that is not yet bound.
    #[error("not ready: {0}")]
    NotReady(String),
}

/// The classification of a [TestctrError].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    Runtime,
    Deadline,
    Unsupported,
    InvalidConfig,
    NotReady,
}

impl TestctrError {
    /// The kind of this error, for matching without destructuring.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::Runtime(_) => ErrorKind::Runtime,
            Self::Deadline(_) => ErrorKind::Deadline,
            Self::Unsupported(_) => ErrorKind::Unsupported,
            Self::InvalidConfig(_) => ErrorKind::InvalidConfig,
            Self::NotReady(_) => ErrorKind::NotReady,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_matches_variant() {
        assert_eq!(
            TestctrError::NotFound("x".to_string()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            TestctrError::AlreadyExists("x".to_string()).kind(),
            ErrorKind::AlreadyExists
        );
        assert_eq!(
            TestctrError::Runtime("x".to_string()).kind(),
            ErrorKind::Runtime
        );
        assert_eq!(
            TestctrError::Deadline("x".to_string()).kind(),
            ErrorKind::Deadline
        );
        assert_eq!(
            TestctrError::Unsupported("x".to_string()).kind(),
            ErrorKind::Unsupported
        );
        assert_eq!(
            TestctrError::InvalidConfig("x".to_string()).kind(),
            ErrorKind::InvalidConfig
        );
        assert_eq!(
            TestctrError::NotReady("x".to_string()).kind(),
            ErrorKind::NotReady
        );
    }

    #[test]
    fn display_preserves_message() {
        let e = TestctrError::Runtime("stderr tail".to_string());
        assert_eq!(e.to_string(), "runtime failure: stderr tail");
    }
}
