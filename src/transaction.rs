//! Tagged union over the two sub-protocol transactions.
//!
//! Behavior that differs between SAS and QR is matched exhaustively here
//! rather than hidden behind open-ended subclassing.

use crate::crypto::ShortAuthString;
use crate::error::CancelCode;
use crate::qr::{QrRole, QrState, QrTransaction};
use crate::sas::{SasRole, SasState, SasTransaction};
use crate::types::{VerificationMethod, VerificationPayload};
use chrono::{DateTime, Utc};

/// Side effect requested by a state-machine step.
///
/// The machines stay pure with respect to I/O; the service executes these
/// after the mutation completes.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtoAction {
    /// Queue an event for the peer
    Send(VerificationPayload),
    /// Record the peer device as verified in the trust store
    MarkVerified,
    /// The transaction reached its terminal success state
    Completed,
    /// The transaction cancelled itself; the parent request follows
    Cancelled(CancelCode),
}

/// The concrete sub-protocol owned by a started request
pub enum VerificationTransaction {
    Sas(SasTransaction),
    Qr(QrTransaction),
}

impl VerificationTransaction {
    pub fn flow_id(&self) -> &str {
        match self {
            VerificationTransaction::Sas(sas) => sas.flow_id(),
            VerificationTransaction::Qr(qr) => qr.flow_id(),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        match self {
            VerificationTransaction::Sas(sas) => sas.started_at(),
            VerificationTransaction::Qr(qr) => qr.started_at(),
        }
    }

    pub fn cancel_code(&self) -> Option<CancelCode> {
        match self {
            VerificationTransaction::Sas(sas) => sas.cancel_code(),
            VerificationTransaction::Qr(qr) => qr.cancel_code(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        match self {
            VerificationTransaction::Sas(sas) => sas.state().is_terminal(),
            VerificationTransaction::Qr(qr) => qr.state().is_terminal(),
        }
    }

    /// Whether a peer's start for `method` is the complement of what this
    /// transaction is already doing, rather than a competing start.
    ///
    /// A responder-side SAS transaction pairs with a re-delivery of the
    /// start it was created from; two initiator-side SAS starts are
    /// concurrent and left to the caller's tiebreak. A showing QR
    /// transaction pairs with the peer's scan start and vice versa.
    pub fn accepts_remote_start(&self, method: VerificationMethod) -> bool {
        match (self, method) {
            (VerificationTransaction::Sas(sas), VerificationMethod::Sas) => {
                sas.role() == SasRole::Responder
            },
            (VerificationTransaction::Qr(qr), VerificationMethod::QrCodeScan) => {
                qr.role() == QrRole::Show
            },
            (VerificationTransaction::Qr(qr), VerificationMethod::QrCodeShow) => {
                qr.role() == QrRole::Scan
            },
            _ => false,
        }
    }

    pub fn cancel(&mut self, code: CancelCode) -> bool {
        match self {
            VerificationTransaction::Sas(sas) => sas.cancel(code),
            VerificationTransaction::Qr(qr) => qr.cancel(code),
        }
    }

    /// Immutable value copy for observers
    pub fn snapshot(&self) -> VerificationTransactionSnapshot {
        let details = match self {
            VerificationTransaction::Sas(sas) => TransactionDetails::Sas {
                role: sas.role(),
                state: sas.state(),
                short_auth_string: sas.short_auth_string().cloned(),
            },
            VerificationTransaction::Qr(qr) => TransactionDetails::Qr {
                role: qr.role(),
                state: qr.state(),
                qr_code_bytes: qr.qr_code_bytes(),
            },
        };
        VerificationTransactionSnapshot {
            flow_id: self.flow_id().to_string(),
            started_at: self.started_at(),
            cancel_code: self.cancel_code(),
            details,
        }
    }
}

/// Sub-protocol specific half of a transaction snapshot
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionDetails {
    Sas {
        role: SasRole,
        state: SasState,
        short_auth_string: Option<ShortAuthString>,
    },
    Qr {
        role: QrRole,
        state: QrState,
        qr_code_bytes: Option<Vec<u8>>,
    },
}

/// Immutable copy of a transaction's externally visible state
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationTransactionSnapshot {
    pub flow_id: String,
    pub started_at: DateTime<Utc>,
    pub cancel_code: Option<CancelCode>,
    pub details: TransactionDetails,
}

impl VerificationTransactionSnapshot {
    /// The short authentication string, when this is a SAS transaction that
    /// has derived one
    pub fn short_auth_string(&self) -> Option<&ShortAuthString> {
        match &self.details {
            TransactionDetails::Sas { short_auth_string, .. } => short_auth_string.as_ref(),
            TransactionDetails::Qr { .. } => None,
        }
    }

    /// The renderable QR code, when this is a showing QR transaction
    pub fn qr_code_bytes(&self) -> Option<&[u8]> {
        match &self.details {
            TransactionDetails::Qr { qr_code_bytes, .. } => qr_code_bytes.as_deref(),
            TransactionDetails::Sas { .. } => None,
        }
    }
}
