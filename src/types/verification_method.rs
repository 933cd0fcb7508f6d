use serde::{Deserialize, Serialize};
use std::fmt;

/// A verification capability a device can advertise.
///
/// QR show and scan are complementary roles, not equal capabilities: a
/// device that can only render a code is useless to a peer that cannot
/// scan one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VerificationMethod {
    #[serde(rename = "m.sas.v1")]
    Sas,
    #[serde(rename = "m.qr_code.show.v1")]
    QrCodeShow,
    #[serde(rename = "m.qr_code.scan.v1")]
    QrCodeScan,
}

impl VerificationMethod {
    pub fn as_wire_str(&self) -> &'static str {
        match self {
            VerificationMethod::Sas => "m.sas.v1",
            VerificationMethod::QrCodeShow => "m.qr_code.show.v1",
            VerificationMethod::QrCodeScan => "m.qr_code.scan.v1",
        }
    }

    pub fn from_wire_str(value: &str) -> Option<Self> {
        match value {
            "m.sas.v1" => Some(VerificationMethod::Sas),
            "m.qr_code.show.v1" => Some(VerificationMethod::QrCodeShow),
            "m.qr_code.scan.v1" => Some(VerificationMethod::QrCodeScan),
            _ => None,
        }
    }
}

impl fmt::Display for VerificationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_wire_str())
    }
}
