//! Transport boundary.
//!
//! The service hands fully-formed events to an injected transport and never
//! waits for delivery: local state advances optimistically and a failed send
//! comes back as a cancellation event, not as a failed transition.

use crate::types::{TransportChannel, VerificationPayload};
use async_trait::async_trait;
use thiserror::Error;

/// A verification event queued for delivery to the peer
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingVerificationEvent {
    pub to_user_id: String,
    pub channel: TransportChannel,
    pub flow_id: String,
    pub payload: VerificationPayload,
}

/// Delivery failure reported by the transport
#[derive(Error, Debug, Clone)]
#[error("Transport failure ({}): {message}", if *.retryable { "retryable" } else { "permanent" })]
pub struct TransportError {
    pub retryable: bool,
    pub message: String,
}

impl TransportError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self { retryable: true, message: message.into() }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self { retryable: false, message: message.into() }
    }
}

/// Asynchronous delivery of verification events.
///
/// Implementations deliver to a device directly or through a shared
/// conversation depending on the event's channel; no ordering guarantee is
/// assumed beyond what the state machines' idempotency rules tolerate.
#[async_trait]
pub trait VerificationTransport: Send + Sync {
    async fn send_verification_event(
        &self,
        event: OutgoingVerificationEvent,
    ) -> Result<(), TransportError>;
}
