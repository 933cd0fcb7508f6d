use crate::types::VerificationMethod;
use serde::{Deserialize, Serialize};

/// Content of an `m.key.verification.start` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartContent {
    pub from_device: String,
    pub method: VerificationMethod,
}

impl StartContent {
    pub fn new(from_device: String, method: VerificationMethod) -> Self {
        Self { from_device, method }
    }
}
