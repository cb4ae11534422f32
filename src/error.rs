//! Error types for the intent assurance core.
//!
//! Every fallible operation returns an explicit [`Result`]. Rejections that
//! are expected outcomes of verification (a denied action, an invalid proof)
//! are *not* errors - see [`crate::verify::Verdict`]. Errors here signal
//! contract violations: malformed input, failed cryptography, or an
//! unavailable signer.

use thiserror::Error;

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse error taxonomy for transport-layer mapping.
///
/// Each kind has a stable kebab-case name and an HTTP status so that SDK
/// consumers can programmatically branch ("refresh your token" vs. "fix
/// your plan" vs. "you're not authorized").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad plan or policy structure. Recoverable by fixing the input.
    MalformedInput,
    /// Signature invalid or signer unavailable. Never retried silently.
    CryptographicFailure,
    /// Token past its expiry. Recoverable only by issuing a new token.
    Expired,
    /// Merkle proof or value digest mismatch: a potential tampering signal.
    IntegrityViolation,
    /// Denied by allow/deny/rate/IP/time rules. A routine "no".
    PolicyViolation,
}

impl ErrorKind {
    /// Machine-readable name (kebab-case), stable across releases.
    pub fn name(self) -> &'static str {
        match self {
            Self::MalformedInput => "malformed-input",
            Self::CryptographicFailure => "cryptographic-failure",
            Self::Expired => "token-expired",
            Self::IntegrityViolation => "integrity-violation",
            Self::PolicyViolation => "policy-denied",
        }
    }

    /// HTTP status a transport should surface for this kind.
    pub fn http_status(self) -> u16 {
        match self {
            Self::MalformedInput => 400,
            Self::CryptographicFailure => 401,
            Self::Expired => 401,
            Self::IntegrityViolation => 409,
            Self::PolicyViolation => 403,
        }
    }
}

/// Errors that can occur in core operations.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Input validation
    // =========================================================================
    /// Plan failed structural validation (empty, or a step missing
    /// `action`/`service`). No partial output is produced.
    #[error("malformed plan: {0}")]
    MalformedPlan(String),

    /// Policy failed structural validation (bad glob, bad CIDR, hour out of
    /// range). No token is issued over a malformed policy.
    #[error("invalid policy: {0}")]
    InvalidPolicy(String),

    /// Token validity window is not positive.
    #[error("invalid validity: {0}")]
    InvalidValidity(String),

    /// Claimed canonical path does not match the `/steps/[i]` grammar.
    #[error("malformed path: {0}")]
    MalformedPath(String),

    /// Invalid token or delegation ID format.
    #[error("invalid id: {0}")]
    InvalidId(String),

    /// Missing required field.
    #[error("missing required field: {0}")]
    MissingField(String),

    // =========================================================================
    // Cryptography
    // =========================================================================
    /// Token signature verification failed.
    #[error("signature verification failed: {0}")]
    SignatureInvalid(String),

    /// The external signer failed or was unreachable. No partial token is
    /// returned. Retrying a signer outage is a transport concern.
    #[error("signing failed: {0}")]
    SigningFailed(String),

    /// Cryptographic operation failed (bad key bytes, bad PEM).
    #[error("cryptographic error: {0}")]
    CryptoError(String),

    // =========================================================================
    // Lifecycle
    // =========================================================================
    /// Token has expired (unix seconds of the expiry boundary).
    #[error("token expired at {0}")]
    TokenExpired(i64),

    // =========================================================================
    // Delegation
    // =========================================================================
    /// Requested delegation actions are not a subset of the parent's
    /// effective allow set.
    #[error("delegation scope violation: {0}")]
    DelegationScopeViolation(String),

    // =========================================================================
    // Serialization
    // =========================================================================
    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("deserialization error: {0}")]
    DeserializationError(String),

    /// Wire format version not supported by this build.
    #[error("unsupported token version: {0}")]
    UnsupportedVersion(u8),

    /// Serialized token exceeds the size limit.
    #[error("token size {size} bytes exceeds maximum {max} bytes")]
    TokenTooLarge { size: usize, max: usize },
}

impl Error {
    /// Map this error to its taxonomy kind.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedPlan(_)
            | Self::InvalidPolicy(_)
            | Self::InvalidValidity(_)
            | Self::MalformedPath(_)
            | Self::InvalidId(_)
            | Self::MissingField(_)
            | Self::SerializationError(_)
            | Self::DeserializationError(_)
            | Self::UnsupportedVersion(_)
            | Self::TokenTooLarge { .. } => ErrorKind::MalformedInput,

            Self::SignatureInvalid(_) | Self::SigningFailed(_) | Self::CryptoError(_) => {
                ErrorKind::CryptographicFailure
            }

            Self::TokenExpired(_) => ErrorKind::Expired,

            Self::DelegationScopeViolation(_) => ErrorKind::PolicyViolation,
        }
    }

    /// Stable kebab-case name for transports.
    pub fn name(&self) -> &'static str {
        self.kind().name()
    }

    /// HTTP status for this error.
    pub fn http_status(&self) -> u16 {
        self.kind().http_status()
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for Error {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        Error::SerializationError(e.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for Error {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        Error::DeserializationError(e.to_string())
    }
}

impl From<ed25519_dalek::SignatureError> for Error {
    fn from(e: ed25519_dalek::SignatureError) -> Self {
        Error::CryptoError(e.to_string())
    }
}
