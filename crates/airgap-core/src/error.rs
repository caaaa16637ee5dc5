//! Error types for air-gapped signing flows

use crate::types::Address;
use thiserror::Error;
use ur_fragments::UrError;

/// Result type alias for signing flow operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while moving a transaction across the air gap
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// Invalid flow configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation not allowed in the current state
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        state: &'static str,
        operation: &'static str,
    },

    /// Fragment codec failure
    #[error(transparent)]
    Codec(#[from] UrError),

    /// A signature payload that was already accepted was scanned again
    #[error("Signature already collected")]
    DuplicateSignature,

    /// More signatures arrived than the round can take
    #[error("Signature count exceeded: round needs {required}, got {received}")]
    SignatureCountExceeded { required: usize, received: usize },

    /// Decoded payload could not be understood
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// The payload says no further signature is expected
    #[error("Payload requests no further signatures")]
    NothingToSign,

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Key derivation error
    #[error("Key derivation error: {0}")]
    Derivation(String),

    /// The payload targets a different wallet root
    #[error("Payload root path {requested} does not belong to this wallet ({expected})")]
    ForeignRootPath { expected: String, requested: String },

    /// Chain family not handled by this component
    #[error("Unsupported chain: {0}")]
    UnsupportedChain(String),

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Not enough signatures to submit
    #[error("Threshold not met: required {required}, got {actual}")]
    ThresholdNotMet { required: usize, actual: usize },

    /// Signature failed to parse or recover
    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    /// Recovered signer is not an owner of the multisig
    #[error("Signer {0} is not an authorized owner")]
    UnauthorizedSigner(Address),

    /// The same owner signed more than once
    #[error("Signer {0} signed more than once")]
    RepeatedSigner(Address),

    /// Proposal nonce no longer matches the contract
    #[error("Stale proposal: contract nonce is {expected}, proposal uses {found}")]
    NonceMismatch { expected: u64, found: u64 },

    /// Fee payer cannot cover the transaction fee
    #[error("Insufficient balance for fee: balance {balance}, fee {fee}")]
    InsufficientBalance { balance: u128, fee: u128 },

    /// Broadcast or contract call rejected by the network
    #[error("Network error: {0}")]
    Network(String),

    /// Display timer could not be started
    #[error("Display error: {0}")]
    Display(String),

    /// The flow was closed by the user
    #[error("Cancelled")]
    Cancelled,
}

/// Error categories, deciding how far an error propagates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad or corrupted scan; absorbed by the scanner, re-scan
    Transport,
    /// Round cannot continue; restart from building the payload
    Protocol,
    /// Key derivation or signing failed
    Signing,
    /// Collected signatures failed pre-submission checks
    Validation,
    /// Broadcast rejected; signatures remain valid for a retry
    Network,
    /// Flow closed by the user
    Cancelled,
    /// Caller misuse or bad configuration
    Usage,
}

impl Error {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Codec(e) if e.is_malformed() || e.is_session_fatal() => ErrorKind::Transport,
            Error::Codec(_) => ErrorKind::Protocol,
            Error::DuplicateSignature => ErrorKind::Transport,
            Error::SignatureCountExceeded { .. }
            | Error::MalformedPayload(_)
            | Error::NothingToSign
            | Error::Serialization(_) => ErrorKind::Protocol,
            Error::Derivation(_)
            | Error::ForeignRootPath { .. }
            | Error::UnsupportedChain(_)
            | Error::Crypto(_) => ErrorKind::Signing,
            Error::ThresholdNotMet { .. }
            | Error::InvalidSignature(_)
            | Error::UnauthorizedSigner(_)
            | Error::RepeatedSigner(_)
            | Error::NonceMismatch { .. }
            | Error::InsufficientBalance { .. } => ErrorKind::Validation,
            Error::Network(_) => ErrorKind::Network,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::InvalidConfig(_) | Error::InvalidState { .. } | Error::Display(_) => {
                ErrorKind::Usage
            }
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

/// Terminal failure of a flow, as shown to the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Failure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&Error> for Failure {
    fn from(e: &Error) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_errors_split_by_severity() {
        let malformed = Error::from(UrError::Malformed("noise".into()));
        let conflict = Error::from(UrError::DigestConflict {
            expected: "a".into(),
            found: "b".into(),
        });
        let mismatch = Error::from(UrError::DigestMismatch {
            expected: "a".into(),
            actual: "b".into(),
        });

        assert_eq!(malformed.kind(), ErrorKind::Transport);
        assert_eq!(mismatch.kind(), ErrorKind::Transport);
        assert_eq!(conflict.kind(), ErrorKind::Protocol);
    }

    #[test]
    fn test_failure_keeps_message() {
        let failure = Failure::from(&Error::Network("nonce too low".into()));
        assert_eq!(failure.kind, ErrorKind::Network);
        assert!(failure.message.contains("nonce too low"));
    }
}
