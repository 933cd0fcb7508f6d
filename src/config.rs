//! Verification service configuration

use std::time::Duration;

/// Timing configuration for verification ceremonies
#[derive(Debug, Clone)]
pub struct VerificationConfig {
    /// How long a request may sit without reaching a terminal state after
    /// creation (covers `Requested` and `Ready`)
    pub requested_timeout: Duration,
    /// How long a started sub-protocol may run before being cancelled
    pub started_timeout: Duration,
    /// How long terminal records are kept in the store for late lookups
    pub terminal_retention: Duration,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            requested_timeout: Duration::from_secs(10 * 60),
            started_timeout: Duration::from_secs(5 * 60),
            terminal_retention: Duration::from_secs(5 * 60),
        }
    }
}
