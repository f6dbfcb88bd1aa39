//! Scan Orchestrator
//!
//! Owns the scan lifecycle: admission (one in-flight scan per tuple),
//! the pending -> running -> completed/failed state machine, background
//! execution, and the read paths the API serves from. Scans run as
//! detached tasks; every exit path lands the row in a terminal state,
//! and a periodic sweep force-fails anything that outlives its runtime
//! ceiling.

use std::sync::Arc;

use chrono::Duration;
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::providers::{CloudCredential, SessionFactory};
use crate::scan::aggregate::{self, Aggregation};
use crate::scan::error::ScanError;
use crate::scan::frameworks::ControlCatalog;
use crate::scan::harness::{run_checks, HarnessConfig};
use crate::scan::registry::CheckRegistry;
use crate::scan::store::ScanStore;
use crate::scan::types::{
    ComplianceFrameworkResult, Finding, Scan, ScanScope, ScanStatus, ScanSummary,
};

/// History row with the change in failed findings since the previous
/// completed scan of the same account and type.
#[derive(Debug, Clone, Serialize)]
pub struct HistoryEntry {
    #[serde(flatten)]
    pub summary: ScanSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_delta: Option<i64>,
}

pub struct Orchestrator {
    store: ScanStore,
    registry: CheckRegistry,
    catalog: ControlCatalog,
    sessions: Arc<dyn SessionFactory>,
    harness: HarnessConfig,
}

impl Orchestrator {
    pub fn new(
        store: ScanStore,
        registry: CheckRegistry,
        catalog: ControlCatalog,
        sessions: Arc<dyn SessionFactory>,
        harness: HarnessConfig,
    ) -> Self {
        Self {
            store,
            registry,
            catalog,
            sessions,
            harness,
        }
    }

    pub fn store(&self) -> &ScanStore {
        &self.store
    }

    pub fn catalog(&self) -> &ControlCatalog {
        &self.catalog
    }

    /// Admit and launch a scan. Returns the running row; the caller gets
    /// `Conflict` when the tuple already has a scan in flight and
    /// `CredentialNotFound` when the account was never registered.
    pub async fn start_scan(
        self: &Arc<Self>,
        organization_id: &str,
        cloud_account_id: &str,
        scan_type: &str,
        framework_id: Option<String>,
    ) -> Result<Scan, ScanError> {
        let credential = self
            .store
            .get_credential(organization_id, cloud_account_id)
            .await?;

        let scan = Scan::new(organization_id, cloud_account_id, scan_type);
        let scan_id = scan.id;
        self.store.insert_scan(scan).await?;
        let scan = self.store.transition(scan_id, ScanStatus::Running).await?;

        let scope = ScanScope {
            provider: credential.provider,
            cloud_account_id: cloud_account_id.to_string(),
            framework_id,
        };

        info!(
            scan_id = %scan_id,
            organization = organization_id,
            account = cloud_account_id,
            scan_type,
            provider = %credential.provider,
            "scan started"
        );

        let this = Arc::clone(self);
        tokio::spawn(async move {
            this.execute(scan_id, credential, scope).await;
        });

        Ok(scan)
    }

    /// Drive one scan to a terminal state. Never returns an error; every
    /// failure path writes `failed` with a reason instead.
    async fn execute(&self, scan_id: Uuid, credential: CloudCredential, scope: ScanScope) {
        let api = match self.sessions.open(&credential).await {
            Ok(api) => api,
            Err(e) => {
                self.mark_failed(scan_id, &format!("session open failed: {e}"))
                    .await;
                return;
            }
        };

        let checks = self.registry.select(&scope, &self.catalog);
        if checks.is_empty() {
            self.mark_failed(scan_id, "no checks match the requested scope")
                .await;
            return;
        }

        let report = run_checks(api, checks, &scope, &self.harness).await;
        if report.all_errored() {
            self.mark_failed(scan_id, "every check errored; provider likely unreachable")
                .await;
            return;
        }

        let Aggregation {
            mut findings,
            inconclusive_controls,
            passed_count,
            failed_count,
        } = match aggregate::aggregate(scan_id, &report.results, &self.catalog) {
            Ok(agg) => agg,
            Err(e) => {
                self.mark_failed(scan_id, &format!("aggregation failed: {e}"))
                    .await;
                return;
            }
        };

        aggregate::sort_for_display(&mut findings);
        self.store.put_findings(scan_id, findings).await;
        if let Err(e) = self
            .store
            .complete_scan(scan_id, passed_count, failed_count, inconclusive_controls)
            .await
        {
            error!(scan_id = %scan_id, error = %e, "failed to persist scan completion");
            return;
        }

        info!(
            scan_id = %scan_id,
            passed = passed_count,
            failed = failed_count,
            failed_checks = report.failures.len(),
            "scan completed"
        );
    }

    async fn mark_failed(&self, scan_id: Uuid, reason: &str) {
        error!(scan_id = %scan_id, reason, "scan failed");
        if let Err(e) = self.store.fail_scan(scan_id, reason).await {
            error!(scan_id = %scan_id, error = %e, "failed to persist scan failure");
        }
    }

    pub async fn status(&self, organization_id: &str, scan_id: Uuid) -> Result<Scan, ScanError> {
        self.store.get_scan(organization_id, scan_id).await
    }

    pub async fn findings(
        &self,
        organization_id: &str,
        scan_id: Uuid,
    ) -> Result<Vec<Finding>, ScanError> {
        self.store.findings_for_scan(organization_id, scan_id).await
    }

    /// Per-framework compliance for one scan, derived on read.
    pub async fn frameworks(
        &self,
        organization_id: &str,
        scan_id: Uuid,
    ) -> Result<Vec<ComplianceFrameworkResult>, ScanError> {
        let findings = self.store.findings_for_scan(organization_id, scan_id).await?;
        Ok(aggregate::map_to_frameworks(&findings))
    }

    /// Scan history, newest first, with a failed-findings delta against
    /// the previous completed scan of the same account and type.
    pub async fn history(
        &self,
        organization_id: &str,
        cloud_account_id: Option<&str>,
    ) -> Vec<HistoryEntry> {
        let summaries = self.store.history(organization_id, cloud_account_id).await;
        summaries
            .iter()
            .map(|summary| {
                let failed_delta = if summary.status == ScanStatus::Completed {
                    summaries
                        .iter()
                        .find(|prev| {
                            prev.status == ScanStatus::Completed
                                && prev.started_at < summary.started_at
                                && prev.cloud_account_id == summary.cloud_account_id
                                && prev.scan_type == summary.scan_type
                        })
                        .map(|prev| summary.failed as i64 - prev.failed as i64)
                } else {
                    None
                };
                HistoryEntry {
                    summary: summary.clone(),
                    failed_delta,
                }
            })
            .collect()
    }

    /// Force-fail scans that outlived the runtime ceiling.
    pub async fn sweep_stale(&self, max_age: Duration) {
        let swept = self.store.sweep_stale(max_age).await;
        for scan_id in swept {
            info!(scan_id = %scan_id, "stale scan swept to failed");
        }
    }
}
