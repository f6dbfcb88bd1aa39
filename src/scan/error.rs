//! Scan Error Taxonomy
//!
//! Only credential/auth failures and aggregation invariant violations are
//! scan-fatal. Per-check failures degrade to partial results.

use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by the scan core.
#[derive(Debug, Error)]
pub enum ScanError {
    /// No usable auth method on the credential record. Scan-fatal; no
    /// checks run.
    #[error("no usable credential method: {0}")]
    CredentialResolution(String),

    /// The resolver selected a method but the provider rejected it
    /// (expired role, bad external id). Scan-fatal, surfaced to the
    /// caller for remediation.
    #[error("provider rejected credentials: {0}")]
    AuthFailure(String),

    /// A non-terminal scan already exists for the same
    /// (organization, account, scan type) tuple.
    #[error("scan already in progress for {organization_id}/{cloud_account_id}/{scan_type}")]
    Conflict {
        organization_id: String,
        cloud_account_id: String,
        scan_type: String,
    },

    #[error("scan not found: {0}")]
    ScanNotFound(Uuid),

    #[error("finding not found: {0}")]
    FindingNotFound(Uuid),

    #[error("no credential registered for account {0}")]
    CredentialNotFound(String),

    /// Malformed raw result reaching the aggregator. Indicates a harness
    /// bug, not a transient cloud condition; treated as scan-fatal.
    #[error("aggregation invariant violated: {0}")]
    Aggregation(String),

    /// Ticket creation refused, e.g. for a finding that passed.
    #[error("ticket rejected: {0}")]
    TicketRejected(String),
}

/// Provider-layer errors produced by cloud API clients and checks.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Recognizable throttling/rate-limit signal. The harness retries
    /// these with backoff before escalating to a check error.
    #[error("throttled by provider: {0}")]
    Throttled(String),

    /// The provider rejected the session credentials mid-scan.
    #[error("provider auth rejected: {0}")]
    AuthRejected(String),

    #[error("transport failure: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("malformed provider response: {0}")]
    Malformed(String),
}

impl ApiError {
    pub fn is_throttled(&self) -> bool {
        matches!(self, ApiError::Throttled(_))
    }
}
