//! Capability negotiation between two advertised method sets.
//!
//! Pure functions, invoked exactly once per ceremony when the remote
//! methods become known. The QR rules are deliberately asymmetric: a
//! peer's ability to show a code is only actionable if we can scan one,
//! and vice versa.

use crate::types::{NegotiatedCapabilities, VerificationMethod};

/// Compute what the local side can do with the peer, given both method sets
pub fn negotiate(
    local: &[VerificationMethod],
    remote: &[VerificationMethod],
) -> NegotiatedCapabilities {
    NegotiatedCapabilities {
        sas_supported: local.contains(&VerificationMethod::Sas)
            && remote.contains(&VerificationMethod::Sas),
        other_can_show_qr_code: remote.contains(&VerificationMethod::QrCodeShow)
            && local.contains(&VerificationMethod::QrCodeScan),
        other_can_scan_qr_code: remote.contains(&VerificationMethod::QrCodeScan)
            && local.contains(&VerificationMethod::QrCodeShow),
    }
}

/// True if the two sets allow at least one ceremony to proceed.
///
/// A complementary QR show/scan pairing counts as a common method even
/// when SAS is absent from one or both sides.
pub fn has_common_method(local: &[VerificationMethod], remote: &[VerificationMethod]) -> bool {
    negotiate(local, remote).any()
}
