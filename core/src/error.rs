//! Error types for the transport-authentication layer.
//!
//! # Design
//! Every variant is reported synchronously to the immediate caller. Nothing
//! here is retried internally: whether to re-send a challenged request is the
//! caller's decision, this layer only makes the retry correct.

use std::fmt;

use thiserror::Error;

/// Boxed error produced by user-supplied factories and validators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T> = std::result::Result<T, TransportError>;

/// Why a certificate chain was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// `now` is past the certificate's not-after instant.
    Expired,
    /// `now` is before the certificate's not-before instant.
    NotYetValid,
    /// The chain could not be linked to a trusted root.
    ChainInvalid(String),
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::Expired => write!(f, "certificate expired"),
            RejectReason::NotYetValid => write!(f, "certificate not yet valid"),
            RejectReason::ChainInvalid(detail) => write!(f, "chain invalid: {detail}"),
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    /// A 401 response could not be processed. Session state is unchanged.
    #[error("challenge processing failed: {0}")]
    ChallengeProcessing(String),

    /// A required constructor input was missing.
    #[error("invalid argument: {0} is required")]
    InvalidArgument(&'static str),

    /// The TLS layer must abort the connection.
    #[error("certificate rejected: {reason}")]
    CertificateRejected { reason: RejectReason },

    /// A lazy factory failed; the value stays unconstructed.
    #[error("factory failed: {0}")]
    FactoryFailure(#[source] BoxError),

    /// The call already completed or was cancelled.
    #[error("call already settled")]
    CallSettled,

    #[error("configuration error: {0}")]
    Config(String),
}
