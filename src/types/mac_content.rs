use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Content of an `m.key.verification.mac` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MacContent {
    /// MAC per key identifier being attested
    pub mac: HashMap<String, String>,
    /// MAC over the sorted list of key identifiers
    pub keys: String,
}

impl MacContent {
    pub fn new(mac: HashMap<String, String>, keys: String) -> Self {
        Self { mac, keys }
    }
}
