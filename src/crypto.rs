//! Crypto engine facade.
//!
//! The state machines in this crate never touch cryptographic primitives
//! directly. Key agreement, commitments, MACs and QR secrets are performed
//! by an injected [`CryptoEngine`] capability, which also fronts the trust
//! store. All operations are synchronous and never retry network calls.

use crate::error::InvalidQrPayload;
use crate::types::MacContent;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::{Deserialize, Serialize};

/// Human-comparable code derived from the key exchange
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShortAuthString {
    /// Three decimal numbers in the 1000..=9191 range
    pub decimals: [u16; 3],
    /// Seven emoji names from the shared emoji table
    pub emoji: Vec<String>,
}

/// Secret and key fingerprint carried inside a QR code
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QrPayload {
    pub secret: Vec<u8>,
    /// Fingerprint of the device showing the code
    pub fingerprint: String,
}

impl QrPayload {
    const PREFIX: &'static str = "VF1";

    /// Render the payload into the bytes encoded in the QR image
    pub fn encode(&self) -> Vec<u8> {
        format!("{}:{}:{}", Self::PREFIX, self.fingerprint, BASE64.encode(&self.secret))
            .into_bytes()
    }

    /// Parse QR image bytes back into a payload
    pub fn decode(bytes: &[u8]) -> Result<Self, InvalidQrPayload> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| InvalidQrPayload("payload is not valid UTF-8".to_string()))?;
        let mut parts = text.splitn(3, ':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(Self::PREFIX), Some(fingerprint), Some(secret)) if !fingerprint.is_empty() => {
                let secret = BASE64
                    .decode(secret)
                    .map_err(|_| InvalidQrPayload("secret is not valid base64".to_string()))?;
                Ok(Self { secret, fingerprint: fingerprint.to_string() })
            },
            _ => Err(InvalidQrPayload("unrecognized payload format".to_string())),
        }
    }
}

/// Injected capability performing the cryptographic half of verification.
///
/// Side effects are confined to the trust store behind
/// [`mark_device_verified`](CryptoEngine::mark_device_verified).
pub trait CryptoEngine: Send + Sync {
    /// Start a key agreement for this flow, returning our ephemeral public key
    fn begin_key_agreement(&self, flow_id: &str) -> String;

    /// Commitment hash over an ephemeral key
    fn compute_commitment(&self, flow_id: &str, key: &str) -> String;

    /// Derive the displayable short authentication string
    fn compute_short_auth_string(&self, flow_id: &str, their_key: &str) -> ShortAuthString;

    /// MACs over our own keys for this flow
    fn compute_mac(&self, flow_id: &str) -> MacContent;

    /// Check a peer's MACs
    fn verify_mac(&self, flow_id: &str, mac: &MacContent) -> bool;

    /// Secret and fingerprint this device would show in a QR code
    fn derive_qr_secret(&self, flow_id: &str) -> QrPayload;

    /// Decode scanned QR bytes, or report why they are invalid
    fn decode_qr_payload(&self, bytes: &[u8]) -> Result<QrPayload, InvalidQrPayload>;

    /// Fingerprint we expect a given peer device to present
    fn expected_fingerprint(&self, user_id: &str, device_id: &str) -> String;

    /// Record the peer device as verified in the trust store
    fn mark_device_verified(&self, user_id: &str, device_id: &str);
}

/// Deterministic in-memory engine for tests.
///
/// Two fake engines agree on every derived value for the same flow id, so
/// two services wired together through an in-memory transport can complete
/// full ceremonies without real cryptography.
pub struct FakeCryptoEngine {
    user_id: String,
    device_id: String,
    verified: std::sync::Mutex<Vec<(String, String)>>,
}

impl FakeCryptoEngine {
    const EMOJI: [&'static str; 8] =
        ["Dog", "Cat", "Lion", "Horse", "Unicorn", "Pig", "Elephant", "Rabbit"];

    pub fn new(user_id: &str, device_id: &str) -> Self {
        Self {
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            verified: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Devices marked verified through this engine, in order
    pub fn verified_devices(&self) -> Vec<(String, String)> {
        self.verified
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn digest(input: &str) -> u64 {
        input.bytes().fold(0xcbf2_9ce4_8422_2325u64, |acc, b| {
            (acc ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
        })
    }
}

impl CryptoEngine for FakeCryptoEngine {
    fn begin_key_agreement(&self, flow_id: &str) -> String {
        format!("key:{}:{}", flow_id, self.device_id)
    }

    fn compute_commitment(&self, flow_id: &str, key: &str) -> String {
        format!("commit:{:016x}", Self::digest(&format!("{flow_id}|{key}")))
    }

    fn compute_short_auth_string(&self, flow_id: &str, _their_key: &str) -> ShortAuthString {
        // Depends only on the flow id so both sides derive the same code
        let seed = Self::digest(flow_id);
        let decimals = [
            1000 + (seed % 8192) as u16,
            1000 + ((seed >> 13) % 8192) as u16,
            1000 + ((seed >> 26) % 8192) as u16,
        ];
        let emoji = (0..7)
            .map(|i| Self::EMOJI[((seed >> (i * 3)) % 8) as usize].to_string())
            .collect();
        ShortAuthString { decimals, emoji }
    }

    fn compute_mac(&self, flow_id: &str) -> MacContent {
        let mut mac = std::collections::HashMap::new();
        mac.insert(format!("ed25519:{}", self.device_id), format!("mac:{flow_id}"));
        MacContent::new(mac, format!("keys:{flow_id}"))
    }

    fn verify_mac(&self, flow_id: &str, mac: &MacContent) -> bool {
        mac.keys == format!("keys:{flow_id}")
            && mac.mac.values().all(|value| value == &format!("mac:{flow_id}"))
    }

    fn derive_qr_secret(&self, flow_id: &str) -> QrPayload {
        QrPayload {
            secret: format!("secret:{flow_id}").into_bytes(),
            fingerprint: self.expected_fingerprint(&self.user_id, &self.device_id),
        }
    }

    fn decode_qr_payload(&self, bytes: &[u8]) -> Result<QrPayload, InvalidQrPayload> {
        QrPayload::decode(bytes)
    }

    fn expected_fingerprint(&self, user_id: &str, device_id: &str) -> String {
        format!("fp:{user_id}:{device_id}")
    }

    fn mark_device_verified(&self, user_id: &str, device_id: &str) {
        self.verified
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push((user_id.to_string(), device_id.to_string()));
    }
}
