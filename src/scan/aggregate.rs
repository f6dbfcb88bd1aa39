//! Finding Aggregation and Framework Mapping
//!
//! Turns raw check results into persisted findings: deduplicates on
//! (control, resource type, resource id) with last write winning,
//! enriches from the control catalog, and separates controls that could
//! not be assessed from controls that failed. The framework mapper then
//! fans each finding out to every framework its control is tagged with.

use std::collections::HashMap;

use uuid::Uuid;

use crate::scan::error::ScanError;
use crate::scan::frameworks::{framework, ControlCatalog};
use crate::scan::types::{
    CheckResult, ComplianceFrameworkResult, Finding, FindingStatus, Outcome,
};

/// Output of one aggregation pass.
#[derive(Debug, Default)]
pub struct Aggregation {
    pub findings: Vec<Finding>,
    /// Controls whose checks errored; excluded from compliance math.
    pub inconclusive_controls: Vec<String>,
    pub passed_count: usize,
    pub failed_count: usize,
}

/// Collapse raw results into findings for one scan.
///
/// Skipped results are dropped, errored results feed the inconclusive
/// list, and a result naming a control absent from the catalog aborts
/// aggregation rather than producing a finding with made-up metadata.
pub fn aggregate(
    scan_id: Uuid,
    results: &[CheckResult],
    catalog: &ControlCatalog,
) -> Result<Aggregation, ScanError> {
    let mut deduped: HashMap<(String, String, String), &CheckResult> = HashMap::new();
    let mut inconclusive: Vec<String> = Vec::new();

    for result in results {
        match result.outcome {
            Outcome::Skipped => continue,
            Outcome::Error => {
                if !inconclusive.contains(&result.control_id) {
                    inconclusive.push(result.control_id.clone());
                }
            }
            Outcome::Pass | Outcome::Fail => {
                deduped.insert(result.dedup_key(), result);
            }
        }
    }
    inconclusive.sort();

    let mut agg = Aggregation {
        inconclusive_controls: inconclusive,
        ..Aggregation::default()
    };

    for result in deduped.into_values() {
        let control = catalog.get(&result.control_id).ok_or_else(|| {
            ScanError::Aggregation(format!(
                "check '{}' reported unknown control '{}'",
                result.check_id, result.control_id
            ))
        })?;

        let status = match result.outcome {
            Outcome::Pass => {
                agg.passed_count += 1;
                FindingStatus::Passed
            }
            Outcome::Fail => {
                agg.failed_count += 1;
                FindingStatus::Failed
            }
            Outcome::Error | Outcome::Skipped => unreachable!("filtered above"),
        };

        agg.findings.push(Finding {
            id: Uuid::new_v4(),
            scan_id,
            control_id: result.control_id.clone(),
            framework_ids: control.frameworks.iter().map(|f| f.to_string()).collect(),
            severity: control.severity,
            status,
            resource_type: result.resource_type.clone(),
            resource_id: result.resource_id.clone(),
            evidence: result.evidence.clone(),
            remediation: control.remediation.to_string(),
        });
    }

    Ok(agg)
}

/// Fan findings out across frameworks. A finding whose control carries
/// three framework tags counts toward all three. Frameworks with no
/// executed controls report `None` for the percentage instead of a
/// misleading zero.
pub fn map_to_frameworks(findings: &[Finding]) -> Vec<ComplianceFrameworkResult> {
    let mut tallies: HashMap<&str, (usize, usize)> = HashMap::new();
    for finding in findings {
        for fw in &finding.framework_ids {
            let entry = tallies.entry(fw.as_str()).or_insert((0, 0));
            match finding.status {
                FindingStatus::Passed => entry.0 += 1,
                FindingStatus::Failed => entry.1 += 1,
            }
        }
    }

    framework::ALL
        .iter()
        .map(|&fw| {
            let (passed, failed) = tallies.get(fw).copied().unwrap_or((0, 0));
            let total = passed + failed;
            // Full precision; any rounding belongs to the presentation
            // layer, not the stored value.
            let percentage = if total == 0 {
                None
            } else {
                Some(passed as f64 / total as f64 * 100.0)
            };
            ComplianceFrameworkResult {
                framework_id: fw.to_string(),
                passed_count: passed,
                failed_count: failed,
                total_count: total,
                compliance_percentage: percentage,
                not_assessed: total == 0,
            }
        })
        .collect()
}

/// Display order: severity descending, failures before passes within the
/// same severity, then control id for a stable listing.
pub fn sort_for_display(findings: &mut [Finding]) {
    findings.sort_by(|a, b| {
        b.severity
            .cmp(&a.severity)
            .then_with(|| {
                let rank = |s: &FindingStatus| match s {
                    FindingStatus::Failed => 0,
                    FindingStatus::Passed => 1,
                };
                rank(&a.status).cmp(&rank(&b.status))
            })
            .then_with(|| a.control_id.cmp(&b.control_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::scan::types::Severity;

    fn catalog() -> ControlCatalog {
        ControlCatalog::builtin()
    }

    fn pass(control: &str, resource: &str) -> CheckResult {
        CheckResult::pass("test-check", control, "s3_bucket", resource, json!({}))
    }

    fn fail(control: &str, resource: &str) -> CheckResult {
        CheckResult::fail("test-check", control, "s3_bucket", resource, json!({}))
    }

    #[test]
    fn later_result_wins_for_the_same_resource() {
        let results = vec![
            pass("s3-default-encryption", "bucket-a"),
            fail("s3-default-encryption", "bucket-a"),
        ];
        let agg = aggregate(Uuid::new_v4(), &results, &catalog()).unwrap();
        assert_eq!(agg.findings.len(), 1);
        assert_eq!(agg.findings[0].status, FindingStatus::Failed);
        assert_eq!(agg.passed_count, 0);
        assert_eq!(agg.failed_count, 1);
    }

    #[test]
    fn unknown_control_aborts_aggregation() {
        let results = vec![pass("not-a-real-control", "bucket-a")];
        let err = aggregate(Uuid::new_v4(), &results, &catalog()).unwrap_err();
        assert!(matches!(err, ScanError::Aggregation(_)));
    }

    #[test]
    fn errored_controls_become_inconclusive_not_findings() {
        let results = vec![
            pass("s3-default-encryption", "bucket-a"),
            CheckResult::error("test-check", "kms-key-rotation", "*", "timed out"),
            CheckResult::error("other-check", "kms-key-rotation", "*", "timed out"),
        ];
        let agg = aggregate(Uuid::new_v4(), &results, &catalog()).unwrap();
        assert_eq!(agg.findings.len(), 1);
        assert_eq!(agg.inconclusive_controls, vec!["kms-key-rotation".to_string()]);
    }

    #[test]
    fn one_control_contributes_to_every_tagged_framework() {
        // s3-block-public-access carries cis-aws, lgpd, gdpr, pci-dss tags.
        let results = vec![fail("s3-block-public-access", "bucket-a")];
        let agg = aggregate(Uuid::new_v4(), &results, &catalog()).unwrap();
        let frameworks = map_to_frameworks(&agg.findings);

        for fw in ["cis-aws", "lgpd", "gdpr", "pci-dss"] {
            let row = frameworks
                .iter()
                .find(|r| r.framework_id == fw)
                .unwrap_or_else(|| panic!("missing framework row {fw}"));
            assert_eq!(row.failed_count, 1, "framework {fw}");
            assert_eq!(row.compliance_percentage, Some(0.0));
            assert!(!row.not_assessed);
        }
    }

    #[test]
    fn untouched_framework_is_not_assessed_rather_than_zero() {
        let results = vec![fail("s3-block-public-access", "bucket-a")];
        let agg = aggregate(Uuid::new_v4(), &results, &catalog()).unwrap();
        let frameworks = map_to_frameworks(&agg.findings);

        let azure = frameworks
            .iter()
            .find(|r| r.framework_id == "cis-azure")
            .unwrap();
        assert!(azure.not_assessed);
        assert_eq!(azure.compliance_percentage, None);
        assert_eq!(azure.total_count, 0);
    }

    #[test]
    fn percentage_counts_only_executed_controls() {
        let results = vec![
            pass("s3-block-public-access", "bucket-a"),
            fail("s3-bucket-acl-public", "bucket-a"),
            pass("s3-default-encryption", "bucket-a"),
            fail("s3-versioning-enabled", "bucket-a"),
        ];
        let agg = aggregate(Uuid::new_v4(), &results, &catalog()).unwrap();
        let frameworks = map_to_frameworks(&agg.findings);

        let cis = frameworks
            .iter()
            .find(|r| r.framework_id == "cis-aws")
            .unwrap();
        assert_eq!(cis.total_count, 4);
        assert_eq!(cis.compliance_percentage, Some(50.0));
    }

    #[test]
    fn percentage_keeps_full_precision() {
        let results = vec![
            pass("s3-block-public-access", "bucket-a"),
            fail("s3-bucket-acl-public", "bucket-a"),
            fail("s3-default-encryption", "bucket-a"),
        ];
        let agg = aggregate(Uuid::new_v4(), &results, &catalog()).unwrap();
        let frameworks = map_to_frameworks(&agg.findings);

        let cis = frameworks
            .iter()
            .find(|r| r.framework_id == "cis-aws")
            .unwrap();
        let pct = cis.compliance_percentage.unwrap();
        assert!((pct - 100.0 / 3.0).abs() < 1e-9, "got {pct}");
    }

    #[test]
    fn partial_failure_math_excludes_inconclusive_controls() {
        // 5 pass, 3 fail, 2 error: 62.5% with 2 inconclusive controls.
        let results = vec![
            pass("s3-block-public-access", "bucket-a"),
            pass("s3-bucket-acl-public", "bucket-a"),
            pass("s3-default-encryption", "bucket-a"),
            pass("s3-versioning-enabled", "bucket-a"),
            pass("s3-access-logging", "bucket-a"),
            fail("ec2-sg-open-ssh", "sg-1"),
            fail("ec2-sg-open-rdp", "sg-1"),
            fail("rds-public-access", "db-1"),
            CheckResult::error("aws-cloudtrail", "cloudtrail-enabled", "*", "timed out"),
            CheckResult::error("aws-kms-rotation", "kms-key-rotation", "*", "timed out"),
        ];
        let agg = aggregate(Uuid::new_v4(), &results, &catalog()).unwrap();
        assert_eq!(agg.passed_count, 5);
        assert_eq!(agg.failed_count, 3);
        assert_eq!(agg.inconclusive_controls.len(), 2);

        let frameworks = map_to_frameworks(&agg.findings);
        let cis = frameworks
            .iter()
            .find(|r| r.framework_id == "cis-aws")
            .unwrap();
        assert_eq!(cis.total_count, 8);
        assert_eq!(cis.compliance_percentage, Some(62.5));
    }

    #[test]
    fn display_sort_puts_critical_failures_first() {
        let scan_id = Uuid::new_v4();
        let results = vec![
            pass("s3-access-logging", "bucket-a"),
            fail("s3-block-public-access", "bucket-a"),
            fail("s3-versioning-enabled", "bucket-a"),
        ];
        let mut agg = aggregate(scan_id, &results, &catalog()).unwrap();
        sort_for_display(&mut agg.findings);

        assert_eq!(agg.findings[0].control_id, "s3-block-public-access");
        assert_eq!(agg.findings[0].severity, Severity::Critical);
        assert_eq!(agg.findings[2].status, FindingStatus::Passed);
    }
}
