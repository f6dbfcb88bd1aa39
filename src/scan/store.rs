//! In-Memory Scan Store
//!
//! Single source of truth for scans, findings, and credential records,
//! shared across request handlers and background scan tasks. Writes go
//! through the orchestrator; the store itself only enforces the two
//! structural rules it can see locally: one in-flight scan per
//! (organization, account, scan type) tuple, and legal status
//! transitions.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::providers::CloudCredential;
use crate::scan::error::ScanError;
use crate::scan::types::{Finding, Scan, ScanStatus, ScanSummary};

#[derive(Default)]
struct Inner {
    scans: HashMap<Uuid, Scan>,
    findings: HashMap<Uuid, Vec<Finding>>,
    /// Keyed by (organization_id, cloud_account_id).
    credentials: HashMap<(String, String), CloudCredential>,
}

#[derive(Clone, Default)]
pub struct ScanStore {
    inner: Arc<RwLock<Inner>>,
}

impl ScanStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new scan. Rejects with `Conflict` when another scan for
    /// the same (organization, account, scan type) tuple is still
    /// pending or running.
    pub async fn insert_scan(&self, scan: Scan) -> Result<(), ScanError> {
        let mut inner = self.inner.write().await;
        let duplicate = inner.scans.values().any(|existing| {
            !existing.status.is_terminal()
                && existing.organization_id == scan.organization_id
                && existing.cloud_account_id == scan.cloud_account_id
                && existing.scan_type == scan.scan_type
        });
        if duplicate {
            return Err(ScanError::Conflict {
                organization_id: scan.organization_id.clone(),
                cloud_account_id: scan.cloud_account_id.clone(),
                scan_type: scan.scan_type.clone(),
            });
        }
        inner.scans.insert(scan.id, scan);
        Ok(())
    }

    pub async fn get_scan(&self, organization_id: &str, id: Uuid) -> Result<Scan, ScanError> {
        let inner = self.inner.read().await;
        inner
            .scans
            .get(&id)
            .filter(|s| s.organization_id == organization_id)
            .cloned()
            .ok_or(ScanError::ScanNotFound(id))
    }

    /// Move a scan to `status` if the transition is legal. Returns the
    /// updated row; an illegal transition leaves the row untouched and
    /// logs, since it indicates a lifecycle bug rather than bad input.
    pub async fn transition(&self, id: Uuid, status: ScanStatus) -> Result<Scan, ScanError> {
        let mut inner = self.inner.write().await;
        let scan = inner.scans.get_mut(&id).ok_or(ScanError::ScanNotFound(id))?;
        if !scan.status.can_transition_to(status) {
            warn!(scan_id = %id, from = %scan.status, to = %status, "illegal status transition ignored");
            return Ok(scan.clone());
        }
        scan.status = status;
        if status.is_terminal() {
            scan.completed_at = Some(Utc::now());
        }
        Ok(scan.clone())
    }

    /// Terminal success: store counters and the inconclusive control list
    /// alongside the status flip.
    pub async fn complete_scan(
        &self,
        id: Uuid,
        passed: usize,
        failed: usize,
        inconclusive_controls: Vec<String>,
    ) -> Result<(), ScanError> {
        let mut inner = self.inner.write().await;
        let scan = inner.scans.get_mut(&id).ok_or(ScanError::ScanNotFound(id))?;
        if !scan.status.can_transition_to(ScanStatus::Completed) {
            warn!(scan_id = %id, from = %scan.status, "cannot complete scan");
            return Ok(());
        }
        scan.status = ScanStatus::Completed;
        scan.completed_at = Some(Utc::now());
        scan.passed_count = passed;
        scan.failed_count = failed;
        scan.inconclusive_controls = inconclusive_controls;
        Ok(())
    }

    /// Terminal failure with a human-readable reason.
    pub async fn fail_scan(&self, id: Uuid, error_summary: &str) -> Result<(), ScanError> {
        let mut inner = self.inner.write().await;
        let scan = inner.scans.get_mut(&id).ok_or(ScanError::ScanNotFound(id))?;
        if !scan.status.can_transition_to(ScanStatus::Failed) {
            warn!(scan_id = %id, from = %scan.status, "cannot fail scan");
            return Ok(());
        }
        scan.status = ScanStatus::Failed;
        scan.completed_at = Some(Utc::now());
        scan.error_summary = Some(error_summary.to_string());
        Ok(())
    }

    pub async fn put_findings(&self, scan_id: Uuid, findings: Vec<Finding>) {
        let mut inner = self.inner.write().await;
        inner.findings.insert(scan_id, findings);
    }

    pub async fn findings_for_scan(
        &self,
        organization_id: &str,
        scan_id: Uuid,
    ) -> Result<Vec<Finding>, ScanError> {
        let inner = self.inner.read().await;
        let scan = inner
            .scans
            .get(&scan_id)
            .filter(|s| s.organization_id == organization_id)
            .ok_or(ScanError::ScanNotFound(scan_id))?;
        Ok(inner.findings.get(&scan.id).cloned().unwrap_or_default())
    }

    /// All findings across an organization's scans.
    pub async fn findings_for_org(&self, organization_id: &str) -> Vec<Finding> {
        let inner = self.inner.read().await;
        let mut out = Vec::new();
        for scan in inner.scans.values() {
            if scan.organization_id == organization_id {
                if let Some(findings) = inner.findings.get(&scan.id) {
                    out.extend(findings.iter().cloned());
                }
            }
        }
        out
    }

    pub async fn get_finding(
        &self,
        organization_id: &str,
        finding_id: Uuid,
    ) -> Result<Finding, ScanError> {
        let inner = self.inner.read().await;
        for scan in inner.scans.values() {
            if scan.organization_id != organization_id {
                continue;
            }
            if let Some(findings) = inner.findings.get(&scan.id) {
                if let Some(found) = findings.iter().find(|f| f.id == finding_id) {
                    return Ok(found.clone());
                }
            }
        }
        Err(ScanError::FindingNotFound(finding_id))
    }

    /// Scan history for an organization, newest first. `cloud_account_id`
    /// narrows to a single account when given.
    pub async fn history(
        &self,
        organization_id: &str,
        cloud_account_id: Option<&str>,
    ) -> Vec<ScanSummary> {
        let inner = self.inner.read().await;
        let mut rows: Vec<ScanSummary> = inner
            .scans
            .values()
            .filter(|s| s.organization_id == organization_id)
            .filter(|s| cloud_account_id.map_or(true, |a| s.cloud_account_id == a))
            .map(ScanSummary::from)
            .collect();
        rows.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        rows
    }

    pub async fn upsert_credential(&self, credential: CloudCredential) {
        let mut inner = self.inner.write().await;
        let key = (
            credential.organization_id.clone(),
            credential.cloud_account_id.clone(),
        );
        inner.credentials.insert(key, credential);
    }

    pub async fn get_credential(
        &self,
        organization_id: &str,
        cloud_account_id: &str,
    ) -> Result<CloudCredential, ScanError> {
        let inner = self.inner.read().await;
        inner
            .credentials
            .get(&(organization_id.to_string(), cloud_account_id.to_string()))
            .cloned()
            .ok_or_else(|| ScanError::CredentialNotFound(cloud_account_id.to_string()))
    }

    /// Force-fail every running scan older than `max_age`. Returns the
    /// ids that were swept. Pending rows are left alone: only
    /// running -> failed is a legal transition, and pending is momentary
    /// by construction.
    pub async fn sweep_stale(&self, max_age: Duration) -> Vec<Uuid> {
        let cutoff = Utc::now() - max_age;
        let mut inner = self.inner.write().await;
        let mut swept = Vec::new();
        for scan in inner.scans.values_mut() {
            if scan.status == ScanStatus::Running && scan.started_at < cutoff {
                scan.status = ScanStatus::Failed;
                scan.completed_at = Some(Utc::now());
                scan.error_summary =
                    Some("scan exceeded the maximum runtime and was presumed dead".to_string());
                swept.push(scan.id);
            }
        }
        swept
    }
}
