use crate::error::CancelCode;
use serde::{Deserialize, Serialize};

/// Content of an `m.key.verification.cancel` event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelContent {
    pub code: CancelCode,
    pub reason: String,
}

impl CancelContent {
    pub fn new(code: CancelCode) -> Self {
        Self { code, reason: code.default_reason().to_string() }
    }
}
