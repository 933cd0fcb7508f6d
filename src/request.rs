//! Verification request state machine.
//!
//! One instance tracks a ceremony from creation to its terminal state and
//! owns the active sub-protocol transaction once one is chosen. All
//! transitions are strict precondition checks: whichever event applies
//! first wins, later contradicting events are rejected rather than
//! reordered.

use crate::error::CancelCode;
use crate::negotiate::negotiate;
use crate::sas::SasRole;
use crate::transaction::VerificationTransaction;
use crate::types::{NegotiatedCapabilities, TransportChannel, VerificationMethod};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    Requested,
    Ready,
    Started,
    Done,
    Cancelled,
    Expired,
}

impl RequestState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RequestState::Done | RequestState::Cancelled | RequestState::Expired)
    }
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestState::Requested => "requested",
            RequestState::Ready => "ready",
            RequestState::Started => "started",
            RequestState::Done => "done",
            RequestState::Cancelled => "cancelled",
            RequestState::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// How an inbound ready event was applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyDisposition {
    /// Methods accepted, request is now ready
    Ready,
    /// Methods accepted but nothing is mutually usable; request cancelled
    NoCommonMethod,
    /// Identical re-delivery, ignored
    DuplicateIgnored,
    /// Request already terminal, ignored
    StaleIgnored,
    /// A different device answered after one was already pinned
    WrongDevice,
    /// Contradicts the current state; the caller cancels the request
    Violation,
}

/// Whether a peer's start may proceed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartDisposition {
    /// Attach a new transaction for this method
    Start,
    /// The existing transaction already covers this start
    DuplicateIgnored,
    /// Request already terminal, ignored
    StaleIgnored,
    /// Both sides started the same method at once; the caller resolves
    /// the tiebreak
    Glare,
    /// Competing or out-of-order start; the caller cancels the request
    Violation,
}

/// One verification ceremony between us and a peer device
pub struct VerificationRequest {
    flow_id: String,
    initiated_by_us: bool,
    other_user_id: String,
    other_device_id: Option<String>,
    local_methods: Vec<VerificationMethod>,
    remote_methods: Vec<VerificationMethod>,
    state: RequestState,
    channel: TransportChannel,
    capabilities: NegotiatedCapabilities,
    active_transaction_id: Option<String>,
    cancel_code: Option<CancelCode>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    transaction: Option<VerificationTransaction>,
}

impl VerificationRequest {
    /// A request we are sending to a peer
    pub fn new_outgoing(
        flow_id: String,
        other_user_id: String,
        local_methods: Vec<VerificationMethod>,
        channel: TransportChannel,
    ) -> Self {
        Self {
            flow_id,
            initiated_by_us: true,
            other_user_id,
            other_device_id: None,
            local_methods,
            remote_methods: Vec::new(),
            state: RequestState::Requested,
            channel,
            capabilities: NegotiatedCapabilities::default(),
            active_transaction_id: None,
            cancel_code: None,
            created_at: Utc::now(),
            completed_at: None,
            transaction: None,
        }
    }

    /// A request received from a peer; its advertised methods are our
    /// remote set, ours stay empty until the user accepts
    pub fn new_incoming(
        flow_id: String,
        other_user_id: String,
        other_device_id: String,
        remote_methods: Vec<VerificationMethod>,
        channel: TransportChannel,
    ) -> Self {
        Self {
            flow_id,
            initiated_by_us: false,
            other_user_id,
            other_device_id: Some(other_device_id),
            local_methods: Vec::new(),
            remote_methods,
            state: RequestState::Requested,
            channel,
            capabilities: NegotiatedCapabilities::default(),
            active_transaction_id: None,
            cancel_code: None,
            created_at: Utc::now(),
            completed_at: None,
            transaction: None,
        }
    }

    pub fn flow_id(&self) -> &str {
        &self.flow_id
    }

    pub fn initiated_by_us(&self) -> bool {
        self.initiated_by_us
    }

    pub fn other_user_id(&self) -> &str {
        &self.other_user_id
    }

    pub fn other_device_id(&self) -> Option<&str> {
        self.other_device_id.as_deref()
    }

    pub fn state(&self) -> RequestState {
        self.state
    }

    pub fn channel(&self) -> &TransportChannel {
        &self.channel
    }

    pub fn capabilities(&self) -> NegotiatedCapabilities {
        self.capabilities
    }

    pub fn cancel_code(&self) -> Option<CancelCode> {
        self.cancel_code
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// When the request reached a terminal state, for retention pruning
    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn transaction(&self) -> Option<&VerificationTransaction> {
        self.transaction.as_ref()
    }

    pub fn transaction_mut(&mut self) -> Option<&mut VerificationTransaction> {
        self.transaction.as_mut()
    }

    /// Accept an inbound request, declaring our methods. Returns `false`
    /// when nothing is mutually usable, in which case the request has
    /// auto-cancelled and the caller reports `NoCommonMethod` to the peer.
    ///
    /// Only valid on an incoming request still in `Requested`.
    pub fn accept(&mut self, local_methods: Vec<VerificationMethod>) -> Option<bool> {
        if self.initiated_by_us || self.state != RequestState::Requested {
            return None;
        }
        self.local_methods = local_methods;
        self.capabilities = negotiate(&self.local_methods, &self.remote_methods);
        if !self.capabilities.any() {
            info!("No common verification method on flow {}", self.flow_id);
            self.cancel(CancelCode::NoCommonMethod);
            return Some(false);
        }
        self.state = RequestState::Ready;
        debug!("Request {} is ready", self.flow_id);
        Some(true)
    }

    /// Apply the peer's ready event.
    ///
    /// The first responding device wins: it is pinned as the counterparty
    /// and later ready events from its siblings are rejected untouched.
    pub fn handle_ready(
        &mut self,
        from_device: &str,
        methods: &[VerificationMethod],
    ) -> ReadyDisposition {
        if self.state.is_terminal() {
            return ReadyDisposition::StaleIgnored;
        }
        match self.state {
            RequestState::Requested if self.initiated_by_us => {
                if let Some(pinned) = self.other_device_id.as_deref() {
                    if pinned != from_device {
                        return ReadyDisposition::WrongDevice;
                    }
                }
                self.other_device_id = Some(from_device.to_string());
                self.remote_methods = methods.to_vec();
                self.capabilities = negotiate(&self.local_methods, &self.remote_methods);
                if !self.capabilities.any() {
                    info!("No common verification method on flow {}", self.flow_id);
                    self.cancel(CancelCode::NoCommonMethod);
                    return ReadyDisposition::NoCommonMethod;
                }
                self.state = RequestState::Ready;
                debug!("Request {} is ready", self.flow_id);
                ReadyDisposition::Ready
            },
            // A ready aimed at the responder contradicts the protocol
            RequestState::Requested => ReadyDisposition::Violation,
            RequestState::Ready | RequestState::Started => {
                if self.other_device_id.as_deref() != Some(from_device) {
                    return ReadyDisposition::WrongDevice;
                }
                if self.remote_methods == methods {
                    ReadyDisposition::DuplicateIgnored
                } else {
                    warn!(
                        "Conflicting ready with different methods on flow {} in state {}",
                        self.flow_id, self.state
                    );
                    ReadyDisposition::Violation
                }
            },
            RequestState::Done | RequestState::Cancelled | RequestState::Expired => {
                ReadyDisposition::StaleIgnored
            },
        }
    }

    /// Check whether a peer's start for `method` may proceed
    pub fn remote_start_disposition(&self, method: VerificationMethod) -> StartDisposition {
        if self.state.is_terminal() {
            return StartDisposition::StaleIgnored;
        }
        match self.state {
            RequestState::Ready => StartDisposition::Start,
            RequestState::Started => match &self.transaction {
                Some(transaction) if transaction.accepts_remote_start(method) => {
                    StartDisposition::DuplicateIgnored
                },
                Some(VerificationTransaction::Sas(sas))
                    if method == VerificationMethod::Sas
                        && sas.role() == SasRole::Initiator =>
                {
                    StartDisposition::Glare
                },
                _ => StartDisposition::Violation,
            },
            _ => StartDisposition::Violation,
        }
    }

    /// Attach the chosen transaction and move to `Started`. Rejected when
    /// the request is not ready or a transaction already exists.
    pub fn start_transaction(&mut self, transaction: VerificationTransaction) -> bool {
        if self.state != RequestState::Ready || self.transaction.is_some() {
            return false;
        }
        self.active_transaction_id = Some(transaction.flow_id().to_string());
        self.transaction = Some(transaction);
        self.state = RequestState::Started;
        info!("Verification started on flow {}", self.flow_id);
        true
    }

    /// Swap the active transaction after losing a concurrent-start
    /// tiebreak. Only valid while `Started`.
    pub fn adopt_transaction(&mut self, transaction: VerificationTransaction) -> bool {
        if self.state != RequestState::Started {
            return false;
        }
        debug!("Adopting the peer's transaction on flow {}", self.flow_id);
        self.active_transaction_id = Some(transaction.flow_id().to_string());
        self.transaction = Some(transaction);
        true
    }

    /// The owned transaction reached its success state
    pub fn complete(&mut self) -> bool {
        if self.state != RequestState::Started {
            return false;
        }
        self.state = RequestState::Done;
        self.completed_at = Some(Utc::now());
        info!("Verification complete on flow {}", self.flow_id);
        true
    }

    /// Move to `Cancelled`, cancelling the owned transaction with it.
    /// Returns `false` if already terminal.
    pub fn cancel(&mut self, code: CancelCode) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        if let Some(transaction) = self.transaction.as_mut() {
            transaction.cancel(code);
        }
        self.state = RequestState::Cancelled;
        self.cancel_code = Some(code);
        self.completed_at = Some(Utc::now());
        info!("Verification cancelled on flow {} ({})", self.flow_id, code.as_wire_str());
        true
    }

    /// Local-only terminal state for a request nobody ever answered
    pub fn expire(&mut self) -> bool {
        if self.state.is_terminal() {
            return false;
        }
        if let Some(transaction) = self.transaction.as_mut() {
            transaction.cancel(CancelCode::Timeout);
        }
        self.state = RequestState::Expired;
        self.cancel_code = Some(CancelCode::Timeout);
        self.completed_at = Some(Utc::now());
        info!("Verification request {} expired without an answer", self.flow_id);
        true
    }

    /// Immutable value copy for observers
    pub fn snapshot(&self) -> VerificationRequestSnapshot {
        VerificationRequestSnapshot {
            flow_id: self.flow_id.clone(),
            initiated_by_us: self.initiated_by_us,
            other_user_id: self.other_user_id.clone(),
            other_device_id: self.other_device_id.clone(),
            local_methods: self.local_methods.clone(),
            remote_methods: self.remote_methods.clone(),
            state: self.state,
            channel: self.channel.clone(),
            capabilities: self.capabilities,
            active_transaction_id: self.active_transaction_id.clone(),
            cancel_code: self.cancel_code,
        }
    }
}

/// Immutable copy of a request's externally visible state
#[derive(Debug, Clone, PartialEq)]
pub struct VerificationRequestSnapshot {
    pub flow_id: String,
    pub initiated_by_us: bool,
    pub other_user_id: String,
    pub other_device_id: Option<String>,
    pub local_methods: Vec<VerificationMethod>,
    pub remote_methods: Vec<VerificationMethod>,
    pub state: RequestState,
    pub channel: TransportChannel,
    pub capabilities: NegotiatedCapabilities,
    pub active_transaction_id: Option<String>,
    pub cancel_code: Option<CancelCode>,
}
