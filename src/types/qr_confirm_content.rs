use serde::{Deserialize, Serialize};

/// Confirmation sent by the scanning side after a successful camera read.
///
/// Carries the shared secret lifted from the displayed code, proving the
/// scanner actually saw it. The showing side checks it against the secret
/// it derived for this flow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QrConfirmContent {
    /// Base64-encoded shared secret from the scanned payload
    pub secret: String,
}

impl QrConfirmContent {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }
}
