//! Error types shared across the control plane

use std::io;
use thiserror::Error;

/// Errors raised while encoding or decoding game protocol packets
#[derive(Debug, Error)]
pub enum CodecError {
    /// A varint continued past the 10-byte limit
    #[error("malformed data: varint longer than {max} bytes")]
    VarIntTooLong { max: usize },
    /// The packet ended before a field could be read
    #[error("unexpected end of packet: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEnd { needed: usize, remaining: usize },
    /// A declared length was negative, zero where forbidden, or above the limit
    #[error("invalid packet length: {0}")]
    InvalidLength(i64),
    /// A packet id other than the one expected
    #[error("unexpected packet id {0:#04x}")]
    UnexpectedPacket(i32),
    /// A handshake asked for a state other than status or login
    #[error("unsupported next state {0}")]
    UnsupportedState(i32),
    /// A string field was not valid UTF-8
    #[error("invalid utf-8 in string field")]
    InvalidString,
    /// Transport failure
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl CodecError {
    /// True when the failure came from the peer closing or the deadline passing
    pub fn is_io(&self) -> bool {
        matches!(self, CodecError::Io(_))
    }
}

/// Errors raised by the control-channel cipher
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    /// Key was not the expected length
    #[error("invalid key length: expected {expected} bytes, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },
    /// Key was not valid hex
    #[error("encryption key is not valid hex")]
    InvalidKeyEncoding,
    /// Ciphertext shorter than one cipher block
    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),
    /// Decrypted payload was not valid base64
    #[error("decrypted payload is not valid base64")]
    InvalidPayload,
}

/// Errors returned by a cloud provider backend
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Transport or connection failure talking to the API
    #[error("provider request failed: {0}")]
    Transport(String),
    /// The API answered with a non-success status
    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },
    /// The requested resource does not exist
    #[error("not found: {0}")]
    NotFound(String),
    /// The response could not be understood
    #[error("unexpected provider response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ProviderError::Decode(err.to_string())
        } else {
            ProviderError::Transport(err.to_string())
        }
    }
}

/// Errors on the control channel between control plane and agent
#[derive(Debug, Error)]
pub enum ControlError {
    /// Could not reach the agent after all attempts
    #[error("agent at {addr} unreachable after {attempts} attempts: {last}")]
    Unreachable {
        addr: String,
        attempts: u32,
        last: String,
    },
    /// Server has no instance address to talk to
    #[error("server {0} has no instance address")]
    NoAddress(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Errors from cloud lifecycle operations
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Refused to destroy a protected instance
    #[error("safety check failed: refusing to destroy protected instance {instance_id}")]
    SafetyCheck { instance_id: u64 },
    /// No snapshot exists to restore from
    #[error("no snapshots found for {0}")]
    NoSnapshot(String),
    /// The server has no running instance
    #[error("no running instance for {0}")]
    NotRunning(String),
    /// Retries were exhausted
    #[error("{operation} gave up after {attempts} attempts: {last}")]
    Exhausted {
        operation: &'static str,
        attempts: u32,
        last: String,
    },
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl LifecycleError {
    /// Whether another attempt could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Provider(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safety_check_message() {
        let err = LifecycleError::SafetyCheck { instance_id: 42 };
        assert_eq!(
            err.to_string(),
            "safety check failed: refusing to destroy protected instance 42"
        );
    }

    #[test]
    fn test_exhausted_message() {
        let err = LifecycleError::Exhausted {
            operation: "destroy",
            attempts: 5,
            last: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "destroy gave up after 5 attempts: boom");
    }

    #[test]
    fn test_only_provider_errors_retry() {
        assert!(LifecycleError::from(ProviderError::Transport("reset".into())).is_retryable());
        assert!(!LifecycleError::SafetyCheck { instance_id: 1 }.is_retryable());
        assert!(!LifecycleError::NoSnapshot("srv".into()).is_retryable());
    }

    #[test]
    fn test_codec_error_is_io() {
        let err = CodecError::from(io::Error::new(io::ErrorKind::TimedOut, "deadline"));
        assert!(err.is_io());
        assert!(!CodecError::InvalidString.is_io());
    }
}
