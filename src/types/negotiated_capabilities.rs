use serde::{Deserialize, Serialize};

/// What the two advertised method sets allow, seen from the local side.
///
/// Recomputed exactly once per ceremony, when the remote methods become
/// known at ready-time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedCapabilities {
    /// Both sides support short-authentication-string comparison
    pub sas_supported: bool,
    /// The peer can display a QR code that we are able to scan
    pub other_can_show_qr_code: bool,
    /// The peer can scan a QR code that we are able to display
    pub other_can_scan_qr_code: bool,
}

impl NegotiatedCapabilities {
    /// True if at least one usable method or QR pairing exists
    pub fn any(&self) -> bool {
        self.sas_supported || self.other_can_show_qr_code || self.other_can_scan_qr_code
    }
}
