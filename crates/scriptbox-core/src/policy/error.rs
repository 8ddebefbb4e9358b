//! Error types for the policy module.

/// Errors produced while resolving a security policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PolicyError {
    #[error("unknown security level \"{0}\": must be Minimal, Standard, Elevated, or Maximum")]
    UnknownLevel(String),

    #[error("invalid custom policy: {0}")]
    InvalidCustom(String),
}

/// Result type for policy operations.
pub type PolicyResult<T> = std::result::Result<T, PolicyError>;
