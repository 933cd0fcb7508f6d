//! Device verification for end-to-end encrypted messaging.
//!
//! Manages the lifecycle of interactive verification ceremonies between two
//! devices: capability negotiation, the request state machine, and the SAS
//! (short-authentication-string) and QR code sub-protocols. Transport and
//! cryptography are injected behind traits so the crate stays independent of
//! any concrete network or key store.
//!
//! The entry point is [`VerificationService`]: UI code calls its operations
//! and subscribes to snapshot events, the transport layer feeds inbound
//! events into [`VerificationService::handle_event`].

pub mod config;
pub mod crypto;
pub mod error;
pub mod negotiate;
pub mod qr;
pub mod request;
pub mod sas;
pub mod service;
pub mod store;
pub mod transaction;
pub mod transport;
pub mod types;

pub use config::VerificationConfig;
pub use crypto::{CryptoEngine, FakeCryptoEngine, QrPayload, ShortAuthString};
pub use error::{CancelCode, Result, VerificationError};
pub use negotiate::{has_common_method, negotiate};
pub use qr::{QrRole, QrState, QrTransaction};
pub use request::{
    ReadyDisposition,
    RequestState,
    StartDisposition,
    VerificationRequest,
    VerificationRequestSnapshot,
};
pub use sas::{SasRole, SasState, SasTransaction};
pub use service::{VerificationService, VerificationServiceEvent};
pub use store::VerificationStore;
pub use transaction::{
    ProtoAction,
    TransactionDetails,
    VerificationTransaction,
    VerificationTransactionSnapshot,
};
pub use transport::{OutgoingVerificationEvent, TransportError, VerificationTransport};
pub use types::{
    NegotiatedCapabilities,
    TransportChannel,
    VerificationEvent,
    VerificationMethod,
    VerificationPayload,
};
