use serde::{Deserialize, Serialize};

/// Content of an `m.key.verification.key` event.
///
/// The responder's key message also carries the commitment over its
/// ephemeral key, which the initiator checks before deriving the short
/// authentication string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyContent {
    pub key: String,
    pub commitment: Option<String>,
}

impl KeyContent {
    pub fn new(key: String, commitment: Option<String>) -> Self {
        Self { key, commitment }
    }
}
