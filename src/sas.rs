//! Short-authentication-string transaction state machine.
//!
//! Sequences the key exchange, commitment check and MAC exchange through
//! the crypto engine facade and surfaces the derived code for the user to
//! compare. The machine itself never touches key material beyond opaque
//! strings.

use crate::crypto::{CryptoEngine, ShortAuthString};
use crate::error::{CancelCode, Result, VerificationError};
use crate::transaction::ProtoAction;
use crate::types::{KeyContent, MacContent, VerificationPayload};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, warn};

/// Which side of the SAS exchange this device is on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SasRole {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SasState {
    Created,
    /// Keys swapped but the code not yet derived. The code is derived in
    /// the same mutation as the key arrival, so observers only ever see
    /// `CommitmentReceived`.
    KeyExchanged,
    CommitmentReceived,
    MacExchanged,
    Done,
    Cancelled,
}

impl SasState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SasState::Done | SasState::Cancelled)
    }
}

impl fmt::Display for SasState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SasState::Created => "created",
            SasState::KeyExchanged => "key_exchanged",
            SasState::CommitmentReceived => "commitment_received",
            SasState::MacExchanged => "mac_exchanged",
            SasState::Done => "done",
            SasState::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// One running SAS exchange
pub struct SasTransaction {
    flow_id: String,
    role: SasRole,
    state: SasState,
    our_key: String,
    their_key: Option<String>,
    short_auth_string: Option<ShortAuthString>,
    sas_confirmed: bool,
    mac_sent: bool,
    mac_verified: bool,
    done_received: bool,
    started_at: DateTime<Utc>,
    cancel_code: Option<CancelCode>,
}

impl SasTransaction {
    /// Create the initiating side. The caller sends the start event.
    pub fn start(flow_id: String, engine: &dyn CryptoEngine) -> Self {
        let our_key = engine.begin_key_agreement(&flow_id);
        Self::new(flow_id, SasRole::Initiator, our_key)
    }

    /// Create the responding side. Emits our key together with the
    /// commitment over it, which the initiator will check.
    pub fn accept(flow_id: String, engine: &dyn CryptoEngine) -> (Self, Vec<ProtoAction>) {
        let our_key = engine.begin_key_agreement(&flow_id);
        let commitment = engine.compute_commitment(&flow_id, &our_key);
        let key = KeyContent::new(our_key.clone(), Some(commitment));
        let transaction = Self::new(flow_id, SasRole::Responder, our_key);
        (transaction, vec![ProtoAction::Send(VerificationPayload::Key(key))])
    }

    fn new(flow_id: String, role: SasRole, our_key: String) -> Self {
        Self {
            flow_id,
            role,
            state: SasState::Created,
            our_key,
            their_key: None,
            short_auth_string: None,
            sas_confirmed: false,
            mac_sent: false,
            mac_verified: false,
            done_received: false,
            started_at: Utc::now(),
            cancel_code: None,
        }
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn role(&self) -> SasRole {
        self.role
    }

    pub fn state(&self) -> SasState {
        self.state
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn cancel_code(&self) -> Option<CancelCode> {
        self.cancel_code
    }

    /// The code to show the user, available once the commitment step is done
    pub fn short_auth_string(&self) -> Option<&ShortAuthString> {
        self.short_auth_string.as_ref()
    }

    /// Peer's ephemeral key arrived
    pub fn handle_key(&mut self, engine: &dyn CryptoEngine, content: &KeyContent) -> Vec<ProtoAction> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        if self.their_key.as_deref() == Some(content.key.as_str()) {
            debug!("Ignoring duplicate key event for flow {}", self.flow_id);
            return Vec::new();
        }
        if self.state != SasState::Created || self.their_key.is_some() {
            return self.fail(CancelCode::UnexpectedMessage);
        }

        let mut actions = Vec::new();
        if self.role == SasRole::Initiator {
            // The responder's key message must carry a valid commitment
            let expected = engine.compute_commitment(&self.flow_id, &content.key);
            if content.commitment.as_deref() != Some(expected.as_str()) {
                warn!("Commitment mismatch for flow {}", self.flow_id);
                return self.fail(CancelCode::MismatchedKeys);
            }
            let our_key = KeyContent::new(self.our_key.clone(), None);
            actions.push(ProtoAction::Send(VerificationPayload::Key(our_key)));
        }

        self.their_key = Some(content.key.clone());
        self.short_auth_string =
            Some(engine.compute_short_auth_string(&self.flow_id, &content.key));
        self.state = SasState::CommitmentReceived;
        debug!("SAS ready for comparison on flow {}", self.flow_id);
        actions
    }

    /// The user compared the codes. A mismatch is security-critical and
    /// must cancel without ever touching the trust store.
    pub fn confirm(
        &mut self,
        engine: &dyn CryptoEngine,
        matched: bool,
    ) -> Result<Vec<ProtoAction>> {
        if self.state != SasState::CommitmentReceived || self.sas_confirmed {
            return Err(VerificationError::InvalidState {
                flow_id: self.flow_id.clone(),
                action: "confirm",
                state: self.state.to_string(),
            });
        }
        if !matched {
            warn!("User reported SAS mismatch on flow {}", self.flow_id);
            return Ok(self.fail(CancelCode::MismatchedSas));
        }

        self.sas_confirmed = true;
        self.mac_sent = true;
        let mac = engine.compute_mac(&self.flow_id);
        let mut actions = vec![ProtoAction::Send(VerificationPayload::Mac(mac))];
        actions.extend(self.try_advance());
        Ok(actions)
    }

    /// Peer's MACs arrived
    pub fn handle_mac(&mut self, engine: &dyn CryptoEngine, content: &MacContent) -> Vec<ProtoAction> {
        if self.state.is_terminal() || self.mac_verified {
            return Vec::new();
        }
        if self.state != SasState::CommitmentReceived {
            return self.fail(CancelCode::UnexpectedMessage);
        }
        if !engine.verify_mac(&self.flow_id, content) {
            warn!("MAC verification failed on flow {}", self.flow_id);
            return self.fail(CancelCode::MismatchedKeys);
        }
        self.mac_verified = true;
        self.try_advance()
    }

    /// Peer finished on its side. May arrive before our own MAC step
    /// completes; the flag is folded in once we catch up.
    pub fn handle_done(&mut self) -> Vec<ProtoAction> {
        self.done_received = true;
        if self.state == SasState::MacExchanged {
            return self.finish();
        }
        Vec::new()
    }

    pub fn cancel(&mut self, code: CancelCode) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        self.state = SasState::Cancelled;
        self.cancel_code = Some(code);
        true
    }

    fn try_advance(&mut self) -> Vec<ProtoAction> {
        if self.state == SasState::CommitmentReceived
            && self.sas_confirmed
            && self.mac_sent
            && self.mac_verified
        {
            self.state = SasState::MacExchanged;
            let mut actions =
                vec![ProtoAction::Send(VerificationPayload::Done(crate::types::DoneContent::new()))];
            if self.done_received {
                actions.extend(self.finish());
            }
            return actions;
        }
        Vec::new()
    }

    fn finish(&mut self) -> Vec<ProtoAction> {
        self.state = SasState::Done;
        debug!("SAS transaction complete for flow {}", self.flow_id);
        vec![ProtoAction::MarkVerified, ProtoAction::Completed]
    }

    fn fail(&mut self, code: CancelCode) -> Vec<ProtoAction> {
        self.cancel(code);
        vec![ProtoAction::Cancelled(code)]
    }
}
