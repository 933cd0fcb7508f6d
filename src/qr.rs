//! QR show/scan transaction state machine.
//!
//! The two roles are asymmetric: the scanning side confirms autonomously
//! the moment its camera read checks out, while the showing side must wait
//! for the scanner's explicit confirmation message before advancing.

use crate::crypto::{CryptoEngine, QrPayload};
use crate::error::{CancelCode, Result, VerificationError};
use crate::transaction::ProtoAction;
use crate::types::{DoneContent, QrConfirmContent, VerificationPayload};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Which side of the QR exchange this device is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QrRole {
    /// This device renders the code
    Show,
    /// This device scans the peer's code
    Scan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QrState {
    Created,
    /// The code is on screen waiting for the peer. Only the showing side
    /// passes through this state; a successful camera read takes the
    /// scanner straight from `Created` to `Confirmed`.
    CodeExchanged,
    Confirmed,
    Done,
    Cancelled,
}

impl QrState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, QrState::Done | QrState::Cancelled)
    }
}

impl fmt::Display for QrState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            QrState::Created => "created",
            QrState::CodeExchanged => "code_exchanged",
            QrState::Confirmed => "confirmed",
            QrState::Done => "done",
            QrState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One running QR exchange
pub struct QrTransaction {
    flow_id: String,
    role: QrRole,
    state: QrState,
    payload: Option<QrPayload>,
    started_at: DateTime<Utc>,
    cancel_code: Option<CancelCode>,
}

impl QrTransaction {
    /// Showing side: derive the payload and make the code renderable
    pub fn show(flow_id: String, engine: &dyn CryptoEngine) -> Self {
        let payload = engine.derive_qr_secret(&flow_id);
        Self {
            flow_id,
            role: QrRole::Show,
            state: QrState::CodeExchanged,
            payload: Some(payload),
            started_at: Utc::now(),
            cancel_code: None,
        }
    }

    /// Scanning side: wait for the camera read
    pub fn scan_pending(flow_id: String) -> Self {
        Self {
            flow_id,
            role: QrRole::Scan,
            state: QrState::Created,
            payload: None,
            started_at: Utc::now(),
            cancel_code: None,
        }
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn role(&self) -> QrRole {
        self.role
    }

    pub fn state(&self) -> QrState {
        self.state
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn cancel_code(&self) -> Option<CancelCode> {
        self.cancel_code
    }

    /// Bytes the UI renders as the QR image. Only the showing side has them.
    pub fn qr_code_bytes(&self) -> Option<Vec<u8>> {
        match self.role {
            QrRole::Show => self.payload.as_ref().map(QrPayload::encode),
            QrRole::Scan => None,
        }
    }

    /// Camera read on the scanning side. Confirms autonomously on success:
    /// seeing the secret is the proof.
    pub fn submit_scanned(
        &mut self,
        engine: &dyn CryptoEngine,
        bytes: &[u8],
        expected_fingerprint: &str,
    ) -> Result<Vec<ProtoAction>> {
        if self.role != QrRole::Scan || self.state != QrState::Created {
            return Err(VerificationError::InvalidState {
                flow_id: self.flow_id.clone(),
                action: "submit_scanned_qr",
                state: self.state.to_string(),
            });
        }

        let payload = match engine.decode_qr_payload(bytes) {
            Ok(payload) => payload,
            Err(error) => {
                warn!("Failed to decode QR payload on flow {}: {}", self.flow_id, error);
                return Ok(self.fail(CancelCode::InvalidQrCode));
            },
        };
        if payload.fingerprint != expected_fingerprint {
            warn!("Scanned QR code names an unexpected device on flow {}", self.flow_id);
            return Ok(self.fail(CancelCode::InvalidQrCode));
        }

        let confirm = QrConfirmContent::new(BASE64.encode(&payload.secret));
        self.payload = Some(payload);
        self.state = QrState::Confirmed;
        debug!("QR scan confirmed on flow {}", self.flow_id);
        Ok(vec![ProtoAction::Send(VerificationPayload::QrConfirm(confirm))])
    }

    /// The scanner's confirmation arrived on the showing side
    pub fn handle_confirm(&mut self, content: &QrConfirmContent) -> Vec<ProtoAction> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        if self.role != QrRole::Show || self.state != QrState::CodeExchanged {
            return self.fail(CancelCode::UnexpectedMessage);
        }

        let derived_secret = self.payload.as_ref().map(|payload| payload.secret.as_slice());
        let claimed = BASE64.decode(&content.secret).ok();
        if claimed.as_deref() != derived_secret {
            warn!("Scanner returned a foreign secret on flow {}", self.flow_id);
            return self.fail(CancelCode::InvalidQrCode);
        }

        // Confirmed collapses into Done here: the confirmation message is
        // the last thing the showing side waits for.
        self.state = QrState::Done;
        debug!("QR show side complete on flow {}", self.flow_id);
        vec![
            ProtoAction::Send(VerificationPayload::Done(DoneContent::new())),
            ProtoAction::MarkVerified,
            ProtoAction::Completed,
        ]
    }

    /// The showing side finished; completes the scanner
    pub fn handle_done(&mut self) -> Vec<ProtoAction> {
        match (self.role, self.state) {
            (QrRole::Scan, QrState::Confirmed) => {
                self.state = QrState::Done;
                debug!("QR scan side complete on flow {}", self.flow_id);
                vec![ProtoAction::MarkVerified, ProtoAction::Completed]
            },
            (_, state) if state.is_terminal() => Vec::new(),
            _ => self.fail(CancelCode::UnexpectedMessage),
        }
    }

    pub fn cancel(&mut self, code: CancelCode) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = QrState::Cancelled;
        self.cancel_code = Some(code);
        true
    }

    fn fail(&mut self, code: CancelCode) -> Vec<ProtoAction> {
        self.cancel(code);
        vec![ProtoAction::Cancelled(code)]
    }
}
