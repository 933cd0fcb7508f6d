use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that cross the verification service boundary.
///
/// Expected protocol outcomes (timeouts, mismatches, peer cancellations) are
/// never surfaced here; they are delivered as terminal state transitions with
/// a [`CancelCode`] through the observer channel. Only programming-contract
/// violations fail loudly to the caller.
#[derive(Error, Debug)]
pub enum VerificationError {
    /// No request with this flow id is known to the store
    #[error("Unknown verification flow: {flow_id}")]
    UnknownFlow { flow_id: String },

    /// The requested action is not valid in the request's current state
    #[error("Action '{action}' is invalid for flow {flow_id} in state {state}")]
    InvalidState {
        flow_id: String,
        action: &'static str,
        state: String,
    },

    /// The chosen method was not part of the negotiated capabilities
    #[error("Method {method} is not mutually supported for flow {flow_id}")]
    MethodNotNegotiated { flow_id: String, method: String },

    /// An operation that requires an active transaction found none
    #[error("No active transaction for flow {flow_id}")]
    NoActiveTransaction { flow_id: String },
}

/// Result type for verification operations
pub type Result<T> = std::result::Result<T, VerificationError>;

/// Structured reason attached to every cancelled or expired ceremony.
///
/// Codes carry their wire identifier and a default human-readable reason so
/// the UI can distinguish security-relevant outcomes from benign ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CancelCode {
    /// The user explicitly declined or aborted the ceremony
    User,
    /// No peer activity within the allowed window
    Timeout,
    /// The two method sets share no usable method or QR pairing
    NoCommonMethod,
    /// The compared short authentication strings differ
    MismatchedSas,
    /// A commitment or MAC check failed
    MismatchedKeys,
    /// A scanned QR payload failed to decode or named the wrong peer
    InvalidQrCode,
    /// A message arrived that is invalid for the current state
    UnexpectedMessage,
    /// The peer asked for a method we do not know
    UnknownMethod,
    /// Sending or receiving over the transport failed
    Transport { retryable: bool },
    /// Another device of ours answered this request first
    Accepted,
}

impl CancelCode {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            CancelCode::User => "m.user",
            CancelCode::Timeout => "m.timeout",
            CancelCode::NoCommonMethod => "m.no_common_method",
            CancelCode::MismatchedSas => "m.mismatched_sas",
            CancelCode::MismatchedKeys => "m.key_mismatch",
            CancelCode::InvalidQrCode => "m.qr_code.invalid",
            CancelCode::UnexpectedMessage => "m.unexpected_message",
            CancelCode::UnknownMethod => "m.unknown_method",
            CancelCode::Transport { .. } => "m.transport_failed",
            CancelCode::Accepted => "m.accepted",
        }
    }

    /// Default human-readable reason sent alongside the code
    pub fn default_reason(&self) -> &'static str {
        match self {
            CancelCode::User => "The user cancelled the verification",
            CancelCode::Timeout => "The verification timed out",
            CancelCode::NoCommonMethod => "No common verification method",
            CancelCode::MismatchedSas => "The short authentication strings did not match",
            CancelCode::MismatchedKeys => "A key commitment or MAC did not verify",
            CancelCode::InvalidQrCode => "The scanned QR code was invalid",
            CancelCode::UnexpectedMessage => "Unexpected message for the current state",
            CancelCode::UnknownMethod => "Unknown or unsupported verification method",
            CancelCode::Transport { .. } => "The transport failed to deliver a message",
            CancelCode::Accepted => "The request was accepted by a different device",
        }
    }

    /// Codes the UI must warn strongly about, as opposed to benign outcomes
    /// like a timeout or an explicit decline.
    pub fn is_security_relevant(&self) -> bool {
        matches!(
            self,
            CancelCode::MismatchedSas | CancelCode::MismatchedKeys | CancelCode::InvalidQrCode
        )
    }

    /// Whether offering the user a fresh request makes sense
    pub fn is_retryable(&self) -> bool {
        match self {
            CancelCode::Transport { retryable } => *retryable,
            CancelCode::Timeout => true,
            _ => false,
        }
    }
}

/// Failure to decode a scanned QR payload, reported by the crypto engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Invalid QR payload: {0}")]
pub struct InvalidQrPayload(pub String);
