use serde::{Deserialize, Serialize};

/// Which channel carries a ceremony's events, fixed at request creation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportChannel {
    /// Direct device-to-device delivery
    ToDevice { device_id: String },
    /// Events embedded in a shared encrypted conversation
    InRoom { room_id: String },
}
