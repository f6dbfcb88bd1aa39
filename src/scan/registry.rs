//! Check Registry
//!
//! The `CloudCheck` trait is the seam every check implements; the
//! registry is a typed collection keyed by provider. A scan scope selects
//! one provider's check set, optionally narrowed to the checks whose
//! controls are tagged with the requested framework. There is no
//! cross-provider execution within one scan.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::checks;
use crate::providers::{CloudApi, Resource, ResourceKind};
use crate::scan::error::ApiError;
use crate::scan::frameworks::ControlCatalog;
use crate::scan::types::{CheckResult, CloudProvider, ScanScope};

/// One executable probe evaluating one or more controls against live
/// cloud resources.
#[async_trait]
pub trait CloudCheck: Send + Sync {
    fn id(&self) -> &'static str;

    fn provider(&self) -> CloudProvider;

    /// Control ids this check produces results for. Every id must exist
    /// in the control catalog.
    fn controls(&self) -> &'static [&'static str];

    /// Run against a resolved session. Read-only against the provider.
    async fn run(
        &self,
        api: &dyn CloudApi,
        scope: &ScanScope,
    ) -> Result<Vec<CheckResult>, ApiError>;
}

/// Verdict of one control rule for one resource.
pub enum RuleVerdict {
    Pass(Value),
    Fail(Value),
    /// Rule does not apply to this resource.
    Skip,
}

/// A control rule: a predicate over one normalized resource.
pub struct ControlRule {
    pub control_id: &'static str,
    pub evaluate: fn(&Resource) -> RuleVerdict,
}

/// Table-driven check: list one resource kind, evaluate every rule
/// against every resource. Covers the entire built-in set; checks with
/// richer needs can implement `CloudCheck` directly.
pub struct ResourceCheck {
    pub id: &'static str,
    pub provider: CloudProvider,
    pub kind: ResourceKind,
    pub rules: &'static [ControlRule],
    /// Controls that fail at account scope when no resource of the kind
    /// exists at all (e.g. "CloudTrail must be enabled").
    pub fail_when_empty: &'static [&'static str],
    /// Cached control id list for `controls()`.
    pub control_ids: &'static [&'static str],
}

#[async_trait]
impl CloudCheck for ResourceCheck {
    fn id(&self) -> &'static str {
        self.id
    }

    fn provider(&self) -> CloudProvider {
        self.provider
    }

    fn controls(&self) -> &'static [&'static str] {
        self.control_ids
    }

    async fn run(
        &self,
        api: &dyn CloudApi,
        _scope: &ScanScope,
    ) -> Result<Vec<CheckResult>, ApiError> {
        let resources = api.list(self.kind).await?;

        let mut results = Vec::new();
        if resources.is_empty() {
            for control_id in self.fail_when_empty {
                results.push(CheckResult::fail(
                    self.id,
                    control_id,
                    self.kind.as_str(),
                    "account",
                    Value::String("no resource of the required kind exists".to_string()),
                ));
            }
            return Ok(results);
        }

        for resource in &resources {
            for rule in self.rules {
                match (rule.evaluate)(resource) {
                    RuleVerdict::Pass(evidence) => results.push(CheckResult::pass(
                        self.id,
                        rule.control_id,
                        self.kind.as_str(),
                        &resource.id,
                        evidence,
                    )),
                    RuleVerdict::Fail(evidence) => results.push(CheckResult::fail(
                        self.id,
                        rule.control_id,
                        self.kind.as_str(),
                        &resource.id,
                        evidence,
                    )),
                    RuleVerdict::Skip => {}
                }
            }
        }
        Ok(results)
    }
}

/// Catalog of check units, keyed by provider at selection time.
pub struct CheckRegistry {
    checks: Vec<Arc<dyn CloudCheck>>,
}

impl CheckRegistry {
    pub fn new(checks: Vec<Arc<dyn CloudCheck>>) -> Self {
        Self { checks }
    }

    /// All built-in AWS and Azure checks.
    pub fn builtin() -> Self {
        let mut checks = checks::aws::all();
        checks.extend(checks::azure::all());
        Self::new(checks)
    }

    pub fn len(&self) -> usize {
        self.checks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.checks.is_empty()
    }

    /// Checks applicable to a scan scope: provider match, then framework
    /// narrowing when the scope names a known framework. Scan types that
    /// are not framework ids ("security", "full") select the whole
    /// provider set.
    pub fn select(&self, scope: &ScanScope, catalog: &ControlCatalog) -> Vec<Arc<dyn CloudCheck>> {
        self.checks
            .iter()
            .filter(|check| check.provider() == scope.provider)
            .filter(|check| match &scope.framework_id {
                Some(framework_id) => check.controls().iter().any(|control_id| {
                    catalog
                        .get(control_id)
                        .map(|c| c.frameworks.contains(&framework_id.as_str()))
                        .unwrap_or(false)
                }),
                None => true,
            })
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::frameworks::framework;

    fn scope(provider: CloudProvider, framework_id: Option<&str>) -> ScanScope {
        ScanScope {
            provider,
            cloud_account_id: "acct".to_string(),
            framework_id: framework_id.map(|f| f.to_string()),
        }
    }

    #[test]
    fn builtin_registry_covers_both_providers() {
        let registry = CheckRegistry::builtin();
        let catalog = ControlCatalog::builtin();

        let aws = registry.select(&scope(CloudProvider::Aws, None), &catalog);
        let azure = registry.select(&scope(CloudProvider::Azure, None), &catalog);

        assert!(aws.len() >= 8, "expected a real AWS check set");
        assert!(azure.len() >= 9, "expected a real Azure check set");
        assert!(aws.iter().all(|c| c.provider() == CloudProvider::Aws));
        assert!(azure.iter().all(|c| c.provider() == CloudProvider::Azure));
    }

    #[test]
    fn every_declared_control_exists_in_catalog() {
        let registry = CheckRegistry::builtin();
        let catalog = ControlCatalog::builtin();
        for check in &registry.checks {
            for control_id in check.controls() {
                assert!(
                    catalog.get(control_id).is_some(),
                    "check {} references unknown control {}",
                    check.id(),
                    control_id
                );
            }
        }
    }

    #[test]
    fn every_catalog_control_is_bound_to_a_check() {
        let registry = CheckRegistry::builtin();
        let bound: std::collections::HashSet<&str> = registry
            .checks
            .iter()
            .flat_map(|check| check.controls().iter().copied())
            .collect();
        for control in crate::scan::frameworks::CONTROLS {
            assert!(
                bound.contains(control.id),
                "control {} is evaluated by no check",
                control.id
            );
        }
    }

    #[test]
    fn framework_filter_narrows_the_set() {
        let registry = CheckRegistry::builtin();
        let catalog = ControlCatalog::builtin();

        let all = registry.select(&scope(CloudProvider::Aws, None), &catalog);
        let cis = registry.select(&scope(CloudProvider::Aws, Some(framework::CIS_AWS)), &catalog);
        let azure_fw_on_aws =
            registry.select(&scope(CloudProvider::Aws, Some(framework::CIS_AZURE)), &catalog);

        assert!(!cis.is_empty());
        assert!(cis.len() <= all.len());
        assert!(azure_fw_on_aws.is_empty());
    }
}
