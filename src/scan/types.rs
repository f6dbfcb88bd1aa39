//! Core Scan Types
//!
//! Shared types for scans, raw check results, normalized findings and
//! framework-level compliance views.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Cloud provider identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CloudProvider {
    Aws,
    Azure,
}

impl std::fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloudProvider::Aws => write!(f, "aws"),
            CloudProvider::Azure => write!(f, "azure"),
        }
    }
}

/// Declared severity of a control. Ordering is Low < Medium < High < Critical
/// so `max()` picks the most severe.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Scan lifecycle state. Transitions are monotonic:
/// `pending -> running -> {completed, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl ScanStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanStatus::Completed | ScanStatus::Failed)
    }

    /// Whether `self -> next` is a legal lifecycle transition.
    pub fn can_transition_to(&self, next: ScanStatus) -> bool {
        matches!(
            (self, next),
            (ScanStatus::Pending, ScanStatus::Running)
                | (ScanStatus::Running, ScanStatus::Completed)
                | (ScanStatus::Running, ScanStatus::Failed)
        )
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanStatus::Pending => write!(f, "pending"),
            ScanStatus::Running => write!(f, "running"),
            ScanStatus::Completed => write!(f, "completed"),
            ScanStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Raw outcome of one check against one resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Pass,
    Fail,
    Error,
    Skipped,
}

/// Persisted finding status. Raw `error` outcomes never become findings;
/// they surface as inconclusive controls on the scan instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FindingStatus {
    Passed,
    Failed,
}

/// One execution instance of a check set against one cloud account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scan {
    pub id: Uuid,
    pub organization_id: String,
    pub cloud_account_id: String,
    /// Scan type or framework filter ("security", "cis-aws", ...)
    pub scan_type: String,
    pub status: ScanStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_summary: Option<String>,
    /// Controls whose checks errored or timed out. Excluded from
    /// compliance percentages.
    pub inconclusive_controls: Vec<String>,
    pub passed_count: usize,
    pub failed_count: usize,
}

impl Scan {
    pub fn new(organization_id: &str, cloud_account_id: &str, scan_type: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            organization_id: organization_id.to_string(),
            cloud_account_id: cloud_account_id.to_string(),
            scan_type: scan_type.to_string(),
            status: ScanStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            error_summary: None,
            inconclusive_controls: Vec::new(),
            passed_count: 0,
            failed_count: 0,
        }
    }
}

/// Per-check, per-resource raw result. Ephemeral: consumed by the
/// aggregator, never persisted on its own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    pub check_id: String,
    pub control_id: String,
    pub resource_type: String,
    pub resource_id: String,
    pub outcome: Outcome,
    pub evidence: serde_json::Value,
    pub error_detail: Option<String>,
}

impl CheckResult {
    pub fn pass(
        check_id: &str,
        control_id: &str,
        resource_type: &str,
        resource_id: &str,
        evidence: serde_json::Value,
    ) -> Self {
        Self {
            check_id: check_id.to_string(),
            control_id: control_id.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            outcome: Outcome::Pass,
            evidence,
            error_detail: None,
        }
    }

    pub fn fail(
        check_id: &str,
        control_id: &str,
        resource_type: &str,
        resource_id: &str,
        evidence: serde_json::Value,
    ) -> Self {
        Self {
            check_id: check_id.to_string(),
            control_id: control_id.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: resource_id.to_string(),
            outcome: Outcome::Fail,
            evidence,
            error_detail: None,
        }
    }

    pub fn error(check_id: &str, control_id: &str, resource_type: &str, detail: &str) -> Self {
        Self {
            check_id: check_id.to_string(),
            control_id: control_id.to_string(),
            resource_type: resource_type.to_string(),
            resource_id: "*".to_string(),
            outcome: Outcome::Error,
            evidence: serde_json::Value::Null,
            error_detail: Some(detail.to_string()),
        }
    }

    /// Deduplication key within one scan: a later result for the same key
    /// overwrites an earlier one.
    pub fn dedup_key(&self) -> (String, String, String) {
        (
            self.control_id.clone(),
            self.resource_type.clone(),
            self.resource_id.clone(),
        )
    }
}

/// Normalized, persisted finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub id: Uuid,
    pub scan_id: Uuid,
    pub control_id: String,
    /// Every framework this control is tagged with; one finding contributes
    /// to all of them.
    pub framework_ids: Vec<String>,
    /// Propagated from the control catalog, never inferred.
    pub severity: Severity,
    pub status: FindingStatus,
    pub resource_type: String,
    pub resource_id: String,
    pub evidence: serde_json::Value,
    pub remediation: String,
}

/// Derived per-framework compliance view. Not persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceFrameworkResult {
    pub framework_id: String,
    pub passed_count: usize,
    pub failed_count: usize,
    pub total_count: usize,
    /// `None` means "not assessed" (zero applicable controls executed),
    /// which is distinct from 0% compliant.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compliance_percentage: Option<f64>,
    pub not_assessed: bool,
}

/// Scope handed to every check in a scan: one account, one provider,
/// optional framework filter.
#[derive(Debug, Clone)]
pub struct ScanScope {
    pub provider: CloudProvider,
    pub cloud_account_id: String,
    pub framework_id: Option<String>,
}

/// Summary row for history/status reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanSummary {
    pub scan_id: Uuid,
    pub cloud_account_id: String,
    pub scan_type: String,
    pub status: ScanStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub passed: usize,
    pub failed: usize,
    pub inconclusive: usize,
}

impl From<&Scan> for ScanSummary {
    fn from(scan: &Scan) -> Self {
        Self {
            scan_id: scan.id,
            cloud_account_id: scan.cloud_account_id.clone(),
            scan_type: scan.scan_type.clone(),
            status: scan.status,
            started_at: scan.started_at,
            completed_at: scan.completed_at,
            passed: scan.passed_count,
            failed: scan.failed_count,
            inconclusive: scan.inconclusive_controls.len(),
        }
    }
}

/// Ticket priority, mapped from finding severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketPriority {
    High,
    Medium,
    Low,
}

impl From<Severity> for TicketPriority {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::Critical | Severity::High => TicketPriority::High,
            Severity::Medium => TicketPriority::Medium,
            Severity::Low => TicketPriority::Low,
        }
    }
}

/// Advisory triage bucket for remediation tickets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketCategory {
    Security,
    CostOptimization,
    Improvement,
}

/// Remediation work item created from one failed finding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemediationTicket {
    pub id: Uuid,
    pub organization_id: String,
    pub finding_id: Uuid,
    pub title: String,
    pub priority: TicketPriority,
    pub category: TicketCategory,
    pub created_at: DateTime<Utc>,
}
