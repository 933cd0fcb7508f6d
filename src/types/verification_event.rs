use crate::types::{
    CancelContent,
    DoneContent,
    KeyContent,
    MacContent,
    QrConfirmContent,
    ReadyContent,
    RequestContent,
    StartContent,
    TransportChannel,
};
use serde::{Deserialize, Serialize};

/// Kinds of verification events carried over the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerificationEventKind {
    Request,
    Ready,
    Start,
    Key,
    Mac,
    Done,
    Cancel,
    QrConfirm,
}

impl VerificationEventKind {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            VerificationEventKind::Request => "m.key.verification.request",
            VerificationEventKind::Ready => "m.key.verification.ready",
            VerificationEventKind::Start => "m.key.verification.start",
            VerificationEventKind::Key => "m.key.verification.key",
            VerificationEventKind::Mac => "m.key.verification.mac",
            VerificationEventKind::Done => "m.key.verification.done",
            VerificationEventKind::Cancel => "m.key.verification.cancel",
            VerificationEventKind::QrConfirm => "m.key.verification.reciprocate",
        }
    }
}

/// Typed payload of a verification event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "content")]
pub enum VerificationPayload {
    Request(RequestContent),
    Ready(ReadyContent),
    Start(StartContent),
    Key(KeyContent),
    Mac(MacContent),
    Done(DoneContent),
    Cancel(CancelContent),
    QrConfirm(QrConfirmContent),
}

impl VerificationPayload {
    pub fn kind(&self) -> VerificationEventKind {
        match self {
            VerificationPayload::Request(_) => VerificationEventKind::Request,
            VerificationPayload::Ready(_) => VerificationEventKind::Ready,
            VerificationPayload::Start(_) => VerificationEventKind::Start,
            VerificationPayload::Key(_) => VerificationEventKind::Key,
            VerificationPayload::Mac(_) => VerificationEventKind::Mac,
            VerificationPayload::Done(_) => VerificationEventKind::Done,
            VerificationPayload::Cancel(_) => VerificationEventKind::Cancel,
            VerificationPayload::QrConfirm(_) => VerificationEventKind::QrConfirm,
        }
    }
}

/// An inbound verification event, as delivered by the transport layer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationEvent {
    /// User the event came from
    pub sender_user_id: String,
    /// Sending device, when the transport knows it
    pub sender_device_id: Option<String>,
    /// Ceremony this event belongs to
    pub flow_id: String,
    /// Channel the event arrived on; replies use the same one
    pub channel: TransportChannel,
    pub payload: VerificationPayload,
}

impl VerificationEvent {
    pub fn new(
        sender_user_id: String,
        sender_device_id: Option<String>,
        flow_id: String,
        channel: TransportChannel,
        payload: VerificationPayload,
    ) -> Self {
        Self { sender_user_id, sender_device_id, flow_id, channel, payload }
    }
}
