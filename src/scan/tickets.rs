//! Remediation Ticket Bridge
//!
//! Turns a failed finding into a remediation work item, exactly once per
//! (organization, finding). Replays return the existing ticket instead
//! of a duplicate, so the endpoint is safe to retry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

use crate::scan::error::ScanError;
use crate::scan::frameworks::{framework, ControlCatalog};
use crate::scan::types::{
    Finding, FindingStatus, RemediationTicket, Severity, TicketCategory, TicketPriority,
};

#[derive(Clone, Default)]
pub struct TicketBridge {
    tickets: Arc<RwLock<HashMap<(String, Uuid), RemediationTicket>>>,
}

impl TicketBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a ticket for a failed finding, or return the one already
    /// opened for it.
    pub async fn open(
        &self,
        organization_id: &str,
        catalog: &ControlCatalog,
        finding: &Finding,
    ) -> Result<RemediationTicket, ScanError> {
        if finding.status != FindingStatus::Failed {
            return Err(ScanError::TicketRejected(format!(
                "finding {} passed; nothing to remediate",
                finding.id
            )));
        }

        let key = (organization_id.to_string(), finding.id);

        let mut tickets = self.tickets.write().await;
        if let Some(existing) = tickets.get(&key) {
            return Ok(existing.clone());
        }

        let control_name = catalog
            .get(&finding.control_id)
            .map(|c| c.name)
            .unwrap_or(finding.control_id.as_str());

        let ticket = RemediationTicket {
            id: Uuid::new_v4(),
            organization_id: organization_id.to_string(),
            finding_id: finding.id,
            title: format!("{control_name} ({})", finding.resource_id),
            priority: TicketPriority::from(finding.severity),
            category: categorize(control_name, finding),
            created_at: Utc::now(),
        };
        info!(
            ticket_id = %ticket.id,
            finding_id = %finding.id,
            control = %finding.control_id,
            category = ?ticket.category,
            "remediation ticket opened"
        );
        tickets.insert(key, ticket.clone());
        Ok(ticket)
    }
}

/// Category heuristic: cost controls become cost tickets, privacy-tagged
/// or high-severity controls become security tickets, the rest are
/// improvements.
fn categorize(control_name: &str, finding: &Finding) -> TicketCategory {
    let name = control_name.to_lowercase();
    if name.contains("cost") || name.contains("unused") || name.contains("deallocated") {
        return TicketCategory::CostOptimization;
    }
    let privacy_tagged = finding
        .framework_ids
        .iter()
        .any(|f| f == framework::LGPD || f == framework::GDPR);
    if privacy_tagged || finding.severity >= Severity::High {
        return TicketCategory::Security;
    }
    TicketCategory::Improvement
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    fn finding(control_id: &str, severity: Severity, frameworks: &[&str]) -> Finding {
        Finding {
            id: Uuid::new_v4(),
            scan_id: Uuid::new_v4(),
            control_id: control_id.to_string(),
            framework_ids: frameworks.iter().map(|f| f.to_string()).collect(),
            severity,
            status: FindingStatus::Failed,
            resource_type: "s3_bucket".to_string(),
            resource_id: "bucket-a".to_string(),
            evidence: json!({}),
            remediation: "fix it".to_string(),
        }
    }

    #[tokio::test]
    async fn replay_returns_the_same_ticket() {
        let bridge = TicketBridge::new();
        let catalog = ControlCatalog::builtin();
        let f = finding("s3-block-public-access", Severity::Critical, &["cis-aws"]);

        let first = bridge.open("org-1", &catalog, &f).await.unwrap();
        let second = bridge.open("org-1", &catalog, &f).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
    }

    #[tokio::test]
    async fn passed_finding_is_rejected() {
        let bridge = TicketBridge::new();
        let catalog = ControlCatalog::builtin();
        let mut f = finding("s3-block-public-access", Severity::Critical, &["cis-aws"]);
        f.status = FindingStatus::Passed;

        let err = bridge.open("org-1", &catalog, &f).await.unwrap_err();
        assert!(matches!(err, ScanError::TicketRejected(_)));
    }

    #[tokio::test]
    async fn categories_follow_the_control() {
        let bridge = TicketBridge::new();
        let catalog = ControlCatalog::builtin();

        // "Unattached EBS volumes" style control is cost work.
        let cost = bridge
            .open(
                "org-1",
                &catalog,
                &finding("ebs-unattached-volumes", Severity::Low, &["aws-well-architected"]),
            )
            .await
            .unwrap();
        assert_eq!(cost.category, TicketCategory::CostOptimization);
        assert_eq!(cost.priority, TicketPriority::Low);

        // Privacy-tagged control is security work regardless of severity.
        let privacy = bridge
            .open(
                "org-1",
                &catalog,
                &finding("s3-versioning-enabled", Severity::Medium, &["lgpd"]),
            )
            .await
            .unwrap();
        assert_eq!(privacy.category, TicketCategory::Security);

        // Plain medium-severity hygiene is an improvement.
        let hygiene = bridge
            .open(
                "org-1",
                &catalog,
                &finding("cloudtrail-log-validation", Severity::Medium, &["cis-aws"]),
            )
            .await
            .unwrap();
        assert_eq!(hygiene.category, TicketCategory::Improvement);
    }
}
