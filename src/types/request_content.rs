use crate::types::VerificationMethod;
use serde::{Deserialize, Serialize};

/// Content of an `m.key.verification.request` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestContent {
    pub from_device: String,
    pub methods: Vec<VerificationMethod>,
    pub timestamp: i64,
}

impl RequestContent {
    pub fn new(from_device: String, methods: Vec<VerificationMethod>, timestamp: i64) -> Self {
        Self { from_device, methods, timestamp }
    }
}
