//! Verification service façade.
//!
//! The single entry point for UI and for inbound transport events. It owns
//! nothing beyond the store, the injected capabilities and the listener
//! channel; every mutation goes through the per-record lock in the store
//! and observers only ever see immutable snapshots.

use crate::config::VerificationConfig;
use crate::crypto::CryptoEngine;
use crate::error::{CancelCode, Result, VerificationError};
use crate::qr::{QrRole, QrTransaction};
use crate::request::{
    ReadyDisposition,
    RequestState,
    StartDisposition,
    VerificationRequest,
    VerificationRequestSnapshot,
};
use crate::sas::SasTransaction;
use crate::store::VerificationStore;
use crate::transaction::{ProtoAction, VerificationTransaction, VerificationTransactionSnapshot};
use crate::transport::{OutgoingVerificationEvent, VerificationTransport};
use crate::types::{
    CancelContent,
    ReadyContent,
    RequestContent,
    StartContent,
    TransportChannel,
    VerificationEvent,
    VerificationMethod,
    VerificationPayload,
};
use chrono::Utc;
use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Snapshot notifications fanned out to observers
#[derive(Debug, Clone)]
pub enum VerificationServiceEvent {
    RequestCreated(VerificationRequestSnapshot),
    RequestUpdated(VerificationRequestSnapshot),
    TransactionUpdated(VerificationTransactionSnapshot),
}

/// Public façade over the verification subsystem of one device
pub struct VerificationService {
    user_id: String,
    device_id: String,
    config: VerificationConfig,
    store: VerificationStore,
    crypto: Arc<dyn CryptoEngine>,
    transport: Arc<dyn VerificationTransport>,
    events_tx: broadcast::Sender<VerificationServiceEvent>,
    timeouts: Mutex<HashMap<String, JoinHandle<()>>>,
    // Handed to spawned tasks so they never keep the service alive
    weak_self: Weak<Self>,
}

impl VerificationService {
    pub fn new(
        user_id: &str,
        device_id: &str,
        crypto: Arc<dyn CryptoEngine>,
        transport: Arc<dyn VerificationTransport>,
        config: VerificationConfig,
    ) -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(1000);
        Arc::new_cyclic(|weak_self| Self {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            store: VerificationStore::new(config.terminal_retention),
            config,
            crypto,
            transport,
            events_tx,
            timeouts: Mutex::new(HashMap::new()),
            weak_self: weak_self.clone(),
        })
    }

    /// Subscribe to snapshot notifications. Dropping the receiver
    /// unsubscribes; a slow observer loses old events rather than stalling
    /// the state machines.
    pub fn subscribe(&self) -> broadcast::Receiver<VerificationServiceEvent> {
        self.events_tx.subscribe()
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Start a new ceremony towards a peer, returning its flow id
    pub async fn request(
        &self,
        methods: Vec<VerificationMethod>,
        other_user_id: &str,
        channel: TransportChannel,
    ) -> Result<String> {
        let flow_id = Uuid::new_v4().to_string();
        let request = VerificationRequest::new_outgoing(
            flow_id.clone(),
            other_user_id.to_string(),
            methods.clone(),
            channel.clone(),
        );
        let Some(record) = self.store.insert(request).await else {
            return Err(VerificationError::InvalidState {
                flow_id,
                action: "request",
                state: "duplicate flow id".to_string(),
            });
        };

        let snapshot = record.read().await.snapshot();
        self.emit(VerificationServiceEvent::RequestCreated(snapshot));

        let content = RequestContent::new(
            self.device_id.clone(),
            methods,
            Utc::now().timestamp_millis(),
        );
        self.send_to_peer(
            other_user_id,
            channel,
            &flow_id,
            VerificationPayload::Request(content),
        );
        self.schedule_timeout(&flow_id, self.config.requested_timeout);
        info!("Requested verification of {} on flow {}", other_user_id, flow_id);
        Ok(flow_id)
    }

    /// Accept an inbound request, declaring the methods we support
    pub async fn ready(&self, flow_id: &str, methods: Vec<VerificationMethod>) -> Result<()> {
        let record = self.lookup(flow_id).await?;
        let mut request = record.write().await;

        match request.accept(methods.clone()) {
            None => Err(VerificationError::InvalidState {
                flow_id: flow_id.to_string(),
                action: "ready",
                state: request.state().to_string(),
            }),
            Some(true) => {
                let content = ReadyContent::new(self.device_id.clone(), methods);
                self.send_to_peer(
                    request.other_user_id(),
                    request.channel().clone(),
                    flow_id,
                    VerificationPayload::Ready(content),
                );
                self.schedule_timeout(flow_id, self.config.requested_timeout);
                self.emit_updated(&request);
                Ok(())
            },
            Some(false) => {
                self.send_cancel(&request, CancelCode::NoCommonMethod);
                self.clear_timeout(flow_id);
                self.emit_updated(&request);
                Ok(())
            },
        }
    }

    /// Begin the chosen sub-protocol on a ready request
    pub async fn start(
        &self,
        flow_id: &str,
        method: VerificationMethod,
    ) -> Result<()> {
        let record = self.lookup(flow_id).await?;
        let mut request = record.write().await;

        if request.state() != RequestState::Ready {
            return Err(VerificationError::InvalidState {
                flow_id: flow_id.to_string(),
                action: "start",
                state: request.state().to_string(),
            });
        }
        let capabilities = request.capabilities();
        let negotiated = match method {
            VerificationMethod::Sas => capabilities.sas_supported,
            // We show, so the peer must be able to scan, and vice versa
            VerificationMethod::QrCodeShow => capabilities.other_can_scan_qr_code,
            VerificationMethod::QrCodeScan => capabilities.other_can_show_qr_code,
        };
        if !negotiated {
            return Err(VerificationError::MethodNotNegotiated {
                flow_id: flow_id.to_string(),
                method: method.to_string(),
            });
        }

        let transaction = match method {
            VerificationMethod::Sas => VerificationTransaction::Sas(SasTransaction::start(
                flow_id.to_string(),
                self.crypto.as_ref(),
            )),
            VerificationMethod::QrCodeShow => VerificationTransaction::Qr(QrTransaction::show(
                flow_id.to_string(),
                self.crypto.as_ref(),
            )),
            VerificationMethod::QrCodeScan => {
                VerificationTransaction::Qr(QrTransaction::scan_pending(flow_id.to_string()))
            },
        };
        if !request.start_transaction(transaction) {
            return Err(VerificationError::InvalidState {
                flow_id: flow_id.to_string(),
                action: "start",
                state: request.state().to_string(),
            });
        }

        let content = StartContent::new(self.device_id.clone(), method);
        self.send_to_peer(
            request.other_user_id(),
            request.channel().clone(),
            flow_id,
            VerificationPayload::Start(content),
        );
        self.schedule_timeout(flow_id, self.config.started_timeout);
        self.emit_updated(&request);
        Ok(())
    }

    /// Cancel a ceremony on behalf of the local user
    pub async fn cancel(&self, flow_id: &str, code: CancelCode) -> Result<()> {
        let record = self.lookup(flow_id).await?;
        let mut request = record.write().await;

        if !request.cancel(code) {
            return Err(VerificationError::InvalidState {
                flow_id: flow_id.to_string(),
                action: "cancel",
                state: request.state().to_string(),
            });
        }
        self.send_cancel(&request, code);
        self.clear_timeout(flow_id);
        self.emit_updated(&request);
        Ok(())
    }

    /// Confirm the active SAS comparison; shorthand for
    /// [`match_sas_code`](Self::match_sas_code) with `matched = true`
    pub async fn confirm(&self, flow_id: &str) -> Result<()> {
        self.match_sas_code(flow_id, true).await
    }

    /// Report the user's comparison of the short authentication strings
    pub async fn match_sas_code(&self, flow_id: &str, matched: bool) -> Result<()> {
        let record = self.lookup(flow_id).await?;
        let mut request = record.write().await;

        let actions = match request.transaction_mut() {
            Some(VerificationTransaction::Sas(sas)) => {
                sas.confirm(self.crypto.as_ref(), matched)?
            },
            Some(VerificationTransaction::Qr(_)) => {
                return Err(VerificationError::InvalidState {
                    flow_id: flow_id.to_string(),
                    action: "match_sas_code",
                    state: "qr transaction".to_string(),
                });
            },
            None => {
                return Err(VerificationError::NoActiveTransaction {
                    flow_id: flow_id.to_string(),
                });
            },
        };
        self.apply_actions(&mut request, actions);
        self.emit_updated(&request);
        Ok(())
    }

    /// Feed the camera read into the ceremony. Starts the QR scan
    /// transaction if the peer has not started one for us already.
    pub async fn submit_scanned_qr(&self, flow_id: &str, bytes: &[u8]) -> Result<()> {
        let record = self.lookup(flow_id).await?;
        let mut request = record.write().await;

        if request.transaction().is_none() {
            if request.state() != RequestState::Ready {
                return Err(VerificationError::InvalidState {
                    flow_id: flow_id.to_string(),
                    action: "submit_scanned_qr",
                    state: request.state().to_string(),
                });
            }
            if !request.capabilities().other_can_show_qr_code {
                return Err(VerificationError::MethodNotNegotiated {
                    flow_id: flow_id.to_string(),
                    method: VerificationMethod::QrCodeScan.to_string(),
                });
            }
            let transaction =
                VerificationTransaction::Qr(QrTransaction::scan_pending(flow_id.to_string()));
            request.start_transaction(transaction);
            let content = StartContent::new(self.device_id.clone(), VerificationMethod::QrCodeScan);
            self.send_to_peer(
                request.other_user_id(),
                request.channel().clone(),
                flow_id,
                VerificationPayload::Start(content),
            );
            self.schedule_timeout(flow_id, self.config.started_timeout);
        }

        let Some(other_device_id) = request.other_device_id().map(str::to_string) else {
            return Err(VerificationError::InvalidState {
                flow_id: flow_id.to_string(),
                action: "submit_scanned_qr",
                state: "no peer device resolved".to_string(),
            });
        };
        let expected = self
            .crypto
            .expected_fingerprint(request.other_user_id(), &other_device_id);

        let actions = match request.transaction_mut() {
            Some(VerificationTransaction::Qr(qr)) if qr.role() == QrRole::Scan => {
                qr.submit_scanned(self.crypto.as_ref(), bytes, &expected)?
            },
            Some(_) => {
                return Err(VerificationError::InvalidState {
                    flow_id: flow_id.to_string(),
                    action: "submit_scanned_qr",
                    state: "not a scanning transaction".to_string(),
                });
            },
            None => {
                return Err(VerificationError::NoActiveTransaction {
                    flow_id: flow_id.to_string(),
                });
            },
        };
        self.apply_actions(&mut request, actions);
        self.emit_updated(&request);
        Ok(())
    }

    /// Current snapshot of a request, if known
    pub async fn get_request(
        &self,
        user_id: &str,
        flow_id: &str,
    ) -> Option<VerificationRequestSnapshot> {
        self.store.get_request(user_id, flow_id).await
    }

    /// Current snapshot of the active transaction, if any
    pub async fn get_transaction(
        &self,
        user_id: &str,
        flow_id: &str,
    ) -> Option<VerificationTransactionSnapshot> {
        self.store.get_transaction(user_id, flow_id).await
    }

    /// Route an inbound transport event to the right request.
    ///
    /// Never fails loudly: unexpected events resolve into state-machine
    /// dispositions, at worst cancelling the ceremony they belong to.
    pub async fn handle_event(&self, event: VerificationEvent) {
        match &event.payload {
            VerificationPayload::Request(content) => {
                self.handle_inbound_request(&event, content.clone()).await;
            },
            VerificationPayload::Ready(content) => {
                let Some(record) = self.store.get(&event.sender_user_id, &event.flow_id).await
                else {
                    debug!("Dropping ready for unknown flow {}", event.flow_id);
                    return;
                };
                let mut request = record.write().await;
                match request.handle_ready(&content.from_device, &content.methods) {
                    ReadyDisposition::Ready => self.emit_updated(&request),
                    ReadyDisposition::NoCommonMethod => {
                        self.send_cancel(&request, CancelCode::NoCommonMethod);
                        self.clear_timeout(&event.flow_id);
                        self.emit_updated(&request);
                    },
                    ReadyDisposition::DuplicateIgnored | ReadyDisposition::StaleIgnored => {},
                    ReadyDisposition::WrongDevice => {
                        // Another device already answered this request; tell
                        // the late sibling directly so it can dismiss its UI
                        info!(
                            "Request {} was already answered by another device",
                            event.flow_id
                        );
                        self.send_to_peer(
                            &event.sender_user_id,
                            TransportChannel::ToDevice {
                                device_id: content.from_device.clone(),
                            },
                            &event.flow_id,
                            VerificationPayload::Cancel(CancelContent::new(CancelCode::Accepted)),
                        );
                    },
                    ReadyDisposition::Violation => {
                        self.cancel_for_violation(&mut request, &event.flow_id);
                    },
                }
            },
            VerificationPayload::Start(content) => {
                self.handle_inbound_start(&event, content.from_device.clone(), content.method)
                    .await;
            },
            VerificationPayload::Key(content) => {
                let content = content.clone();
                self.with_transaction(&event, "key", |service, request| {
                    match request.transaction_mut() {
                        Some(VerificationTransaction::Sas(sas)) => {
                            Some(sas.handle_key(service.crypto.as_ref(), &content))
                        },
                        _ => None,
                    }
                })
                .await;
            },
            VerificationPayload::Mac(content) => {
                let content = content.clone();
                self.with_transaction(&event, "mac", |service, request| {
                    match request.transaction_mut() {
                        Some(VerificationTransaction::Sas(sas)) => {
                            Some(sas.handle_mac(service.crypto.as_ref(), &content))
                        },
                        _ => None,
                    }
                })
                .await;
            },
            VerificationPayload::QrConfirm(content) => {
                let content = content.clone();
                self.with_transaction(&event, "qr confirmation", |_, request| {
                    match request.transaction_mut() {
                        Some(VerificationTransaction::Qr(qr)) => {
                            Some(qr.handle_confirm(&content))
                        },
                        _ => None,
                    }
                })
                .await;
            },
            VerificationPayload::Done(_) => {
                self.with_transaction(&event, "done", |_, request| {
                    match request.transaction_mut() {
                        Some(VerificationTransaction::Sas(sas)) => Some(sas.handle_done()),
                        Some(VerificationTransaction::Qr(qr)) => Some(qr.handle_done()),
                        None => None,
                    }
                })
                .await;
            },
            VerificationPayload::Cancel(content) => {
                let Some(record) = self.store.get(&event.sender_user_id, &event.flow_id).await
                else {
                    debug!("Dropping cancel for unknown flow {}", event.flow_id);
                    return;
                };
                let mut request = record.write().await;
                if request.cancel(content.code) {
                    info!(
                        "Peer cancelled flow {} ({}): {}",
                        event.flow_id,
                        content.code.as_wire_str(),
                        content.reason
                    );
                    self.clear_timeout(&event.flow_id);
                    self.emit_updated(&request);
                }
            },
        }
    }

    async fn handle_inbound_request(&self, event: &VerificationEvent, content: RequestContent) {
        if self.store.get(&event.sender_user_id, &event.flow_id).await.is_some() {
            debug!("Ignoring duplicate verification request {}", event.flow_id);
            return;
        }
        // Replies go back where the request came from; for direct delivery
        // that means the sending device, not our own.
        let reply_channel = match &event.channel {
            TransportChannel::ToDevice { .. } => {
                TransportChannel::ToDevice { device_id: content.from_device.clone() }
            },
            TransportChannel::InRoom { room_id } => {
                TransportChannel::InRoom { room_id: room_id.clone() }
            },
        };
        let request = VerificationRequest::new_incoming(
            event.flow_id.clone(),
            event.sender_user_id.clone(),
            content.from_device,
            content.methods,
            reply_channel,
        );
        let Some(record) = self.store.insert(request).await else {
            return;
        };
        let snapshot = record.read().await.snapshot();
        info!(
            "Received verification request {} from {}",
            event.flow_id, event.sender_user_id
        );
        self.emit(VerificationServiceEvent::RequestCreated(snapshot));
        self.schedule_timeout(&event.flow_id, self.config.requested_timeout);
    }

    async fn handle_inbound_start(
        &self,
        event: &VerificationEvent,
        from_device: String,
        method: VerificationMethod,
    ) {
        let Some(record) = self.store.get(&event.sender_user_id, &event.flow_id).await else {
            debug!("Dropping start for unknown flow {}", event.flow_id);
            return;
        };
        let mut request = record.write().await;

        if request.other_device_id().is_some_and(|pinned| pinned != from_device) {
            info!("Ignoring start from non-pinned device on flow {}", event.flow_id);
            return;
        }
        match request.remote_start_disposition(method) {
            StartDisposition::DuplicateIgnored | StartDisposition::StaleIgnored => return,
            StartDisposition::Violation => {
                self.cancel_for_violation(&mut request, &event.flow_id);
                return;
            },
            StartDisposition::Glare => {
                // Both sides started at once. The start from the
                // lexicographically smaller user id wins; between two
                // devices of the same user, the smaller device id.
                let peer_wins = match event.sender_user_id.as_str().cmp(&self.user_id) {
                    Ordering::Less => true,
                    Ordering::Greater => false,
                    Ordering::Equal => event
                        .sender_device_id
                        .as_deref()
                        .is_some_and(|device| device < self.device_id.as_str()),
                };
                if peer_wins {
                    info!("Yielding to the peer's concurrent start on flow {}", event.flow_id);
                    let (sas, actions) =
                        SasTransaction::accept(event.flow_id.clone(), self.crypto.as_ref());
                    if request.adopt_transaction(VerificationTransaction::Sas(sas)) {
                        self.apply_actions(&mut request, actions);
                        self.emit_updated(&request);
                    }
                } else {
                    debug!(
                        "Discarding the peer's concurrent start on flow {}, ours wins",
                        event.flow_id
                    );
                }
                return;
            },
            StartDisposition::Start => {},
        }

        let capabilities = request.capabilities();
        // The peer's chosen method implies our own role in it
        let (negotiated, transaction, actions) = match method {
            VerificationMethod::Sas => {
                let (sas, actions) =
                    SasTransaction::accept(event.flow_id.clone(), self.crypto.as_ref());
                (capabilities.sas_supported, VerificationTransaction::Sas(sas), actions)
            },
            VerificationMethod::QrCodeShow => (
                capabilities.other_can_show_qr_code,
                VerificationTransaction::Qr(QrTransaction::scan_pending(event.flow_id.clone())),
                Vec::new(),
            ),
            VerificationMethod::QrCodeScan => (
                capabilities.other_can_scan_qr_code,
                VerificationTransaction::Qr(QrTransaction::show(
                    event.flow_id.clone(),
                    self.crypto.as_ref(),
                )),
                Vec::new(),
            ),
        };
        if !negotiated {
            warn!(
                "Peer started non-negotiated method {} on flow {}",
                method, event.flow_id
            );
            if request.cancel(CancelCode::UnknownMethod) {
                self.send_cancel(&request, CancelCode::UnknownMethod);
                self.clear_timeout(&event.flow_id);
                self.emit_updated(&request);
            }
            return;
        }

        if !request.start_transaction(transaction) {
            self.cancel_for_violation(&mut request, &event.flow_id);
            return;
        }
        self.schedule_timeout(&event.flow_id, self.config.started_timeout);
        self.apply_actions(&mut request, actions);
        self.emit_updated(&request);
    }

    /// Run a transaction-level handler, treating the absence of a
    /// compatible transaction on a live request as a protocol violation.
    async fn with_transaction<F>(&self, event: &VerificationEvent, what: &str, handler: F)
    where
        F: FnOnce(&Self, &mut VerificationRequest) -> Option<Vec<ProtoAction>>,
    {
        let Some(record) = self.store.get(&event.sender_user_id, &event.flow_id).await else {
            debug!("Dropping {} for unknown flow {}", what, event.flow_id);
            return;
        };
        let mut request = record.write().await;
        match handler(self, &mut request) {
            Some(actions) => {
                self.apply_actions(&mut request, actions);
                self.emit_updated(&request);
            },
            None => {
                if !request.state().is_terminal() {
                    warn!(
                        "Received {} with no matching transaction on flow {}",
                        what, event.flow_id
                    );
                    self.cancel_for_violation(&mut request, &event.flow_id);
                }
            },
        }
    }

    /// Execute the side effects a state-machine step asked for
    fn apply_actions(&self, request: &mut VerificationRequest, actions: Vec<ProtoAction>) {
        for action in actions {
            match action {
                ProtoAction::Send(payload) => {
                    self.send_to_peer(
                        request.other_user_id(),
                        request.channel().clone(),
                        request.flow_id(),
                        payload,
                    );
                },
                ProtoAction::MarkVerified => match request.other_device_id() {
                    Some(device_id) => {
                        self.crypto.mark_device_verified(request.other_user_id(), device_id);
                    },
                    None => {
                        warn!(
                            "Cannot mark unresolved peer device verified on flow {}",
                            request.flow_id()
                        );
                    },
                },
                ProtoAction::Completed => {
                    let flow_id = request.flow_id().to_string();
                    request.complete();
                    self.clear_timeout(&flow_id);
                },
                ProtoAction::Cancelled(code) => {
                    let flow_id = request.flow_id().to_string();
                    request.cancel(code);
                    self.send_cancel(request, code);
                    self.clear_timeout(&flow_id);
                },
            }
        }
    }

    fn cancel_for_violation(&self, request: &mut VerificationRequest, flow_id: &str) {
        warn!("Protocol violation on flow {}, cancelling", flow_id);
        if request.cancel(CancelCode::UnexpectedMessage) {
            self.send_cancel(request, CancelCode::UnexpectedMessage);
            self.clear_timeout(flow_id);
            self.emit_updated(request);
        }
    }

    fn send_cancel(&self, request: &VerificationRequest, code: CancelCode) {
        self.send_to_peer(
            request.other_user_id(),
            request.channel().clone(),
            request.flow_id(),
            VerificationPayload::Cancel(CancelContent::new(code)),
        );
    }

    /// Queue an event for delivery. Local state has already advanced;
    /// delivery failure comes back through
    /// [`on_transport_failure`](Self::on_transport_failure).
    fn send_to_peer(
        &self,
        to_user_id: &str,
        channel: TransportChannel,
        flow_id: &str,
        payload: VerificationPayload,
    ) {
        let event = OutgoingVerificationEvent {
            to_user_id: to_user_id.to_string(),
            channel,
            flow_id: flow_id.to_string(),
            payload,
        };
        debug!(
            "Queued {} for {} on flow {}",
            event.payload.kind().as_wire_str(),
            to_user_id,
            flow_id
        );
        let transport = self.transport.clone();
        let service = self.weak_self.clone();
        let flow_id = flow_id.to_string();
        tokio::spawn(async move {
            if let Err(error) = transport.send_verification_event(event).await {
                warn!("Transport failure on flow {}: {}", flow_id, error);
                if let Some(service) = service.upgrade() {
                    service.on_transport_failure(&flow_id, error.retryable).await;
                }
            }
        });
    }

    async fn on_transport_failure(&self, flow_id: &str, retryable: bool) {
        let Some(record) = self.store.find_by_flow(flow_id).await else {
            return;
        };
        let mut request = record.write().await;
        if request.cancel(CancelCode::Transport { retryable }) {
            self.clear_timeout(flow_id);
            self.emit_updated(&request);
        }
    }

    /// Arm (or re-arm) the ceremony timer. Firing goes through the normal
    /// cancellation path, never around it.
    fn schedule_timeout(&self, flow_id: &str, duration: Duration) {
        let service = self.weak_self.clone();
        let flow_id_owned = flow_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            if let Some(service) = service.upgrade() {
                service.on_timeout(&flow_id_owned).await;
            }
        });
        let mut timeouts = self.timeouts.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(previous) = timeouts.insert(flow_id.to_string(), handle) {
            previous.abort();
        }
    }

    fn clear_timeout(&self, flow_id: &str) {
        let mut timeouts = self.timeouts.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = timeouts.remove(flow_id) {
            handle.abort();
        }
    }

    async fn on_timeout(&self, flow_id: &str) {
        self.timeouts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(flow_id);
        let Some(record) = self.store.find_by_flow(flow_id).await else {
            return;
        };
        let mut request = record.write().await;
        match request.state() {
            // Nobody ever answered: local-only expiry, nothing on the wire
            RequestState::Requested => {
                if request.expire() {
                    self.emit_updated(&request);
                }
            },
            RequestState::Ready | RequestState::Started => {
                if request.cancel(CancelCode::Timeout) {
                    self.send_cancel(&request, CancelCode::Timeout);
                    self.emit_updated(&request);
                }
            },
            _ => {},
        }
    }

    async fn lookup(
        &self,
        flow_id: &str,
    ) -> Result<Arc<tokio::sync::RwLock<VerificationRequest>>> {
        self.store
            .find_by_flow(flow_id)
            .await
            .ok_or_else(|| VerificationError::UnknownFlow { flow_id: flow_id.to_string() })
    }

    fn emit(&self, event: VerificationServiceEvent) {
        // Nobody listening is fine
        let _ = self.events_tx.send(event);
    }

    fn emit_updated(&self, request: &VerificationRequest) {
        self.emit(VerificationServiceEvent::RequestUpdated(request.snapshot()));
        if let Some(transaction) = request.transaction() {
            self.emit(VerificationServiceEvent::TransactionUpdated(transaction.snapshot()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::FakeCryptoEngine;
    use crate::transport::TransportError;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    const ALICE: &str = "@alice:example.org";
    const BOB: &str = "@bob:example.org";

    /// Transport that records outgoing events, optionally failing every send
    struct RecordingTransport {
        sent: Mutex<Vec<OutgoingVerificationEvent>>,
        fail: bool,
    }

    impl RecordingTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self { sent: Mutex::new(Vec::new()), fail: false })
        }

        fn failing() -> Arc<Self> {
            Arc::new(Self { sent: Mutex::new(Vec::new()), fail: true })
        }

        fn sent(&self) -> Vec<OutgoingVerificationEvent> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl VerificationTransport for RecordingTransport {
        async fn send_verification_event(
            &self,
            event: OutgoingVerificationEvent,
        ) -> std::result::Result<(), TransportError> {
            if self.fail {
                return Err(TransportError::retryable("wire down"));
            }
            self.sent.lock().unwrap().push(event);
            Ok(())
        }
    }

    fn service_with(transport: Arc<RecordingTransport>) -> Arc<VerificationService> {
        VerificationService::new(
            ALICE,
            "ALICEDEV",
            Arc::new(FakeCryptoEngine::new(ALICE, "ALICEDEV")),
            transport,
            VerificationConfig::default(),
        )
    }

    fn room() -> TransportChannel {
        TransportChannel::InRoom { room_id: "!room:example.org".to_string() }
    }

    fn ready_event(flow_id: &str) -> VerificationEvent {
        VerificationEvent::new(
            BOB.to_string(),
            Some("BOBDEV".to_string()),
            flow_id.to_string(),
            room(),
            VerificationPayload::Ready(ReadyContent::new(
                "BOBDEV".to_string(),
                vec![VerificationMethod::Sas],
            )),
        )
    }

    #[tokio::test]
    async fn request_emits_created_and_sends_request_event() {
        let transport = RecordingTransport::new();
        let service = service_with(transport.clone());
        let mut events = service.subscribe();

        let flow_id = service
            .request(vec![VerificationMethod::Sas], BOB, room())
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            VerificationServiceEvent::RequestCreated(snapshot) => {
                assert_eq!(snapshot.flow_id, flow_id);
                assert_eq!(snapshot.state, RequestState::Requested);
                assert!(snapshot.initiated_by_us);
            },
            other => panic!("expected RequestCreated, got {other:?}"),
        }

        tokio::task::yield_now().await;
        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        assert!(matches!(sent[0].payload, VerificationPayload::Request(_)));
    }

    #[tokio::test]
    async fn peer_ready_moves_request_to_ready() {
        let service = service_with(RecordingTransport::new());
        let flow_id = service
            .request(vec![VerificationMethod::Sas], BOB, room())
            .await
            .unwrap();

        service.handle_event(ready_event(&flow_id)).await;

        let snapshot = service.get_request(BOB, &flow_id).await.unwrap();
        assert_eq!(snapshot.state, RequestState::Ready);
        assert_eq!(snapshot.other_device_id.as_deref(), Some("BOBDEV"));
        assert!(snapshot.capabilities.sas_supported);
    }

    #[tokio::test]
    async fn duplicate_ready_changes_nothing() {
        let service = service_with(RecordingTransport::new());
        let flow_id = service
            .request(vec![VerificationMethod::Sas], BOB, room())
            .await
            .unwrap();

        service.handle_event(ready_event(&flow_id)).await;
        let before = service.get_request(BOB, &flow_id).await.unwrap();
        service.handle_event(ready_event(&flow_id)).await;
        let after = service.get_request(BOB, &flow_id).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn ready_without_overlap_cancels_with_no_common_method() {
        let transport = RecordingTransport::new();
        let service = service_with(transport.clone());
        let flow_id = service
            .request(vec![VerificationMethod::Sas], BOB, room())
            .await
            .unwrap();

        let event = VerificationEvent::new(
            BOB.to_string(),
            Some("BOBDEV".to_string()),
            flow_id.clone(),
            room(),
            VerificationPayload::Ready(ReadyContent::new(
                "BOBDEV".to_string(),
                vec![VerificationMethod::QrCodeShow],
            )),
        );
        service.handle_event(event).await;

        let snapshot = service.get_request(BOB, &flow_id).await.unwrap();
        assert_eq!(snapshot.state, RequestState::Cancelled);
        assert_eq!(snapshot.cancel_code, Some(CancelCode::NoCommonMethod));

        tokio::task::yield_now().await;
        assert!(transport
            .sent()
            .iter()
            .any(|event| matches!(&event.payload, VerificationPayload::Cancel(content)
                if content.code == CancelCode::NoCommonMethod)));
    }

    #[tokio::test]
    async fn late_sibling_ready_is_cancelled_with_accepted() {
        let transport = RecordingTransport::new();
        let service = service_with(transport.clone());
        let flow_id = service
            .request(vec![VerificationMethod::Sas], BOB, room())
            .await
            .unwrap();

        service.handle_event(ready_event(&flow_id)).await;
        let sibling = VerificationEvent::new(
            BOB.to_string(),
            Some("OTHERDEV".to_string()),
            flow_id.clone(),
            room(),
            VerificationPayload::Ready(ReadyContent::new(
                "OTHERDEV".to_string(),
                vec![VerificationMethod::Sas],
            )),
        );
        service.handle_event(sibling).await;

        // The pinned ceremony is untouched
        let snapshot = service.get_request(BOB, &flow_id).await.unwrap();
        assert_eq!(snapshot.state, RequestState::Ready);
        assert_eq!(snapshot.other_device_id.as_deref(), Some("BOBDEV"));

        // The losing device gets a direct cancel so it can dismiss its UI
        tokio::task::yield_now().await;
        let cancel = transport
            .sent()
            .into_iter()
            .find(|event| matches!(&event.payload, VerificationPayload::Cancel(content)
                if content.code == CancelCode::Accepted))
            .unwrap();
        assert_eq!(
            cancel.channel,
            TransportChannel::ToDevice { device_id: "OTHERDEV".to_string() }
        );
    }

    #[tokio::test]
    async fn start_on_unknown_flow_fails_loudly() {
        let service = service_with(RecordingTransport::new());
        let result = service.start("no-such-flow", VerificationMethod::Sas).await;
        assert!(matches!(result, Err(VerificationError::UnknownFlow { .. })));
    }

    #[tokio::test]
    async fn start_with_non_negotiated_method_is_rejected() {
        let service = service_with(RecordingTransport::new());
        let flow_id = service
            .request(vec![VerificationMethod::Sas], BOB, room())
            .await
            .unwrap();
        service.handle_event(ready_event(&flow_id)).await;

        let result = service.start(&flow_id, VerificationMethod::QrCodeShow).await;
        assert!(matches!(result, Err(VerificationError::MethodNotNegotiated { .. })));
    }

    #[tokio::test]
    async fn transport_failure_cancels_with_retryable_flag() {
        let service = service_with(RecordingTransport::failing());
        let flow_id = service
            .request(vec![VerificationMethod::Sas], BOB, room())
            .await
            .unwrap();

        // Give the spawned send task a chance to fail and report back
        tokio::time::sleep(Duration::from_millis(20)).await;

        let snapshot = service.get_request(BOB, &flow_id).await.unwrap();
        assert_eq!(snapshot.state, RequestState::Cancelled);
        assert_eq!(snapshot.cancel_code, Some(CancelCode::Transport { retryable: true }));
    }

    #[tokio::test]
    async fn unanswered_request_expires_rather_than_cancels() {
        let transport = RecordingTransport::new();
        let config = VerificationConfig {
            requested_timeout: Duration::from_millis(20),
            ..VerificationConfig::default()
        };
        let service = VerificationService::new(
            ALICE,
            "ALICEDEV",
            Arc::new(FakeCryptoEngine::new(ALICE, "ALICEDEV")),
            transport.clone(),
            config,
        );

        let flow_id = service
            .request(vec![VerificationMethod::Sas], BOB, room())
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;

        let snapshot = service.get_request(BOB, &flow_id).await.unwrap();
        assert_eq!(snapshot.state, RequestState::Expired);
        // Expiry is local only; the single sent event is the original request
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn ready_request_times_out_with_wire_cancel() {
        let transport = RecordingTransport::new();
        let config = VerificationConfig {
            requested_timeout: Duration::from_millis(20),
            ..VerificationConfig::default()
        };
        let service = VerificationService::new(
            ALICE,
            "ALICEDEV",
            Arc::new(FakeCryptoEngine::new(ALICE, "ALICEDEV")),
            transport.clone(),
            config,
        );

        let flow_id = service
            .request(vec![VerificationMethod::Sas], BOB, room())
            .await
            .unwrap();
        service.handle_event(ready_event(&flow_id)).await;
        tokio::time::sleep(Duration::from_millis(60)).await;

        let snapshot = service.get_request(BOB, &flow_id).await.unwrap();
        assert_eq!(snapshot.state, RequestState::Cancelled);
        assert_eq!(snapshot.cancel_code, Some(CancelCode::Timeout));
        assert!(transport
            .sent()
            .iter()
            .any(|event| matches!(&event.payload, VerificationPayload::Cancel(content)
                if content.code == CancelCode::Timeout)));
    }

    #[tokio::test]
    async fn inbound_request_can_be_accepted() {
        let transport = RecordingTransport::new();
        let service = service_with(transport.clone());
        let mut events = service.subscribe();

        let event = VerificationEvent::new(
            BOB.to_string(),
            Some("BOBDEV".to_string()),
            "flow-1".to_string(),
            TransportChannel::ToDevice { device_id: "ALICEDEV".to_string() },
            VerificationPayload::Request(RequestContent::new(
                "BOBDEV".to_string(),
                vec![VerificationMethod::Sas],
                Utc::now().timestamp_millis(),
            )),
        );
        service.handle_event(event).await;

        assert!(matches!(
            events.recv().await.unwrap(),
            VerificationServiceEvent::RequestCreated(_)
        ));

        service.ready("flow-1", vec![VerificationMethod::Sas]).await.unwrap();
        let snapshot = service.get_request(BOB, "flow-1").await.unwrap();
        assert_eq!(snapshot.state, RequestState::Ready);

        tokio::task::yield_now().await;
        let sent = transport.sent();
        // The ready reply goes back to the sending device
        let ready = sent
            .iter()
            .find(|event| matches!(event.payload, VerificationPayload::Ready(_)))
            .unwrap();
        assert_eq!(
            ready.channel,
            TransportChannel::ToDevice { device_id: "BOBDEV".to_string() }
        );
    }

    #[tokio::test]
    async fn stray_key_event_cancels_the_request() {
        let transport = RecordingTransport::new();
        let service = service_with(transport.clone());
        let flow_id = service
            .request(vec![VerificationMethod::Sas], BOB, room())
            .await
            .unwrap();
        service.handle_event(ready_event(&flow_id)).await;

        let event = VerificationEvent::new(
            BOB.to_string(),
            Some("BOBDEV".to_string()),
            flow_id.clone(),
            room(),
            VerificationPayload::Key(crate::types::KeyContent::new("key".to_string(), None)),
        );
        service.handle_event(event).await;

        let snapshot = service.get_request(BOB, &flow_id).await.unwrap();
        assert_eq!(snapshot.state, RequestState::Cancelled);
        assert_eq!(snapshot.cancel_code, Some(CancelCode::UnexpectedMessage));
    }
}
