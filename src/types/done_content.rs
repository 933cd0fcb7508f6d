use serde::{Deserialize, Serialize};

/// Content of an `m.key.verification.done` event
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DoneContent {}

impl DoneContent {
    pub fn new() -> Self {
        Self {}
    }
}
