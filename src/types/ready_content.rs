use crate::types::VerificationMethod;
use serde::{Deserialize, Serialize};

/// Content of an `m.key.verification.ready` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadyContent {
    pub from_device: String,
    pub methods: Vec<VerificationMethod>,
}

impl ReadyContent {
    pub fn new(from_device: String, methods: Vec<VerificationMethod>) -> Self {
        Self { from_device, methods }
    }
}
