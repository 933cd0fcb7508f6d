//! Protocol entity types for device verification events

mod cancel_content;
mod done_content;
mod key_content;
mod mac_content;
mod negotiated_capabilities;
mod qr_confirm_content;
mod ready_content;
mod request_content;
mod start_content;
mod transport_channel;
mod verification_event;
mod verification_method;

pub use cancel_content::CancelContent;
pub use done_content::DoneContent;
pub use key_content::KeyContent;
pub use mac_content::MacContent;
pub use negotiated_capabilities::NegotiatedCapabilities;
pub use qr_confirm_content::QrConfirmContent;
pub use ready_content::ReadyContent;
pub use request_content::RequestContent;
pub use start_content::StartContent;
pub use transport_channel::TransportChannel;
pub use verification_event::{VerificationEvent, VerificationEventKind, VerificationPayload};
pub use verification_method::VerificationMethod;
