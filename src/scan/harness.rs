//! Check Execution Harness
//!
//! Runs the selected checks against one authenticated session with a
//! concurrency ceiling, a per-check timeout, and bounded retry when the
//! provider throttles. A check that cannot produce a verdict yields an
//! error result per declared control instead of sinking the whole scan.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::providers::CloudApi;
use crate::scan::registry::CloudCheck;
use crate::scan::types::{CheckResult, Outcome, ScanScope};

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Checks in flight at once against one provider session.
    pub max_concurrency: usize,
    /// Wall-clock budget for a single check attempt.
    pub check_timeout: Duration,
    /// Total attempts per check; retries happen only on throttling.
    pub max_attempts: u32,
    /// Base delay for exponential backoff between throttled attempts.
    pub retry_base_delay: Duration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            check_timeout: Duration::from_secs(60),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(500),
        }
    }
}

/// Outcome of one harness run over a check set.
#[derive(Debug, Default)]
pub struct HarnessReport {
    pub results: Vec<CheckResult>,
    /// Check ids that completed with verdicts.
    pub succeeded: Vec<String>,
    /// Check ids that errored, with the reason.
    pub failures: Vec<(String, String)>,
}

impl HarnessReport {
    /// True when no check produced a usable verdict.
    pub fn all_errored(&self) -> bool {
        self.succeeded.is_empty()
            && self
                .results
                .iter()
                .all(|r| matches!(r.outcome, Outcome::Error))
    }
}

/// Run every check, at most `max_concurrency` at a time, and collect
/// all results. Never returns early; a failing check degrades to error
/// results for its controls.
pub async fn run_checks(
    api: Arc<dyn CloudApi>,
    checks: Vec<Arc<dyn CloudCheck>>,
    scope: &ScanScope,
    config: &HarnessConfig,
) -> HarnessReport {
    let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));

    // Each handle stays paired with its check so a panicked task can
    // still be expanded into error results for its controls.
    let mut tasks = Vec::with_capacity(checks.len());
    for check in checks {
        let api = Arc::clone(&api);
        let semaphore = Arc::clone(&semaphore);
        let task_check = Arc::clone(&check);
        let scope = scope.clone();
        let config = config.clone();

        let handle = tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    return CheckRun::failed(task_check.as_ref(), "harness shut down".to_string())
                }
            };
            match run_one(api.as_ref(), task_check.as_ref(), &scope, &config).await {
                Ok(results) => CheckRun {
                    check_id: task_check.id().to_string(),
                    results,
                    failure: None,
                },
                Err(reason) => CheckRun::failed(task_check.as_ref(), reason),
            }
        });
        tasks.push((check, handle));
    }

    let mut report = HarnessReport::default();
    for (check, handle) in tasks {
        let run = match handle.await {
            Ok(run) => run,
            Err(e) => {
                let reason = if e.is_panic() {
                    "check task panicked".to_string()
                } else {
                    format!("check task aborted: {e}")
                };
                CheckRun::failed(check.as_ref(), reason)
            }
        };
        match run.failure {
            None => {
                debug!(check = %run.check_id, results = run.results.len(), "check completed");
                report.succeeded.push(run.check_id);
                report.results.extend(run.results);
            }
            Some(reason) => {
                warn!(check = %run.check_id, error = %reason, "check failed");
                report.results.extend(run.results);
                report.failures.push((run.check_id, reason));
            }
        }
    }
    report
}

struct CheckRun {
    check_id: String,
    results: Vec<CheckResult>,
    failure: Option<String>,
}

impl CheckRun {
    fn failed(check: &dyn CloudCheck, reason: String) -> Self {
        Self {
            check_id: check.id().to_string(),
            results: error_results(check, &reason),
            failure: Some(reason),
        }
    }
}

async fn run_one(
    api: &dyn CloudApi,
    check: &dyn CloudCheck,
    scope: &ScanScope,
    config: &HarnessConfig,
) -> Result<Vec<CheckResult>, String> {
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match tokio::time::timeout(config.check_timeout, check.run(api, scope)).await {
            Ok(Ok(results)) => return Ok(results),
            Ok(Err(e)) if e.is_throttled() && attempt < config.max_attempts => {
                let delay = config.retry_base_delay * 2u32.saturating_pow(attempt - 1);
                warn!(
                    check = check.id(),
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "provider throttled, backing off"
                );
                tokio::time::sleep(delay).await;
            }
            Ok(Err(e)) => return Err(e.to_string()),
            Err(_) => {
                return Err(format!(
                    "timed out after {}s",
                    config.check_timeout.as_secs()
                ))
            }
        }
    }
}

/// Expand a failed check into one error result per control it covers, so
/// the aggregator can mark those controls inconclusive.
pub fn error_results(check: &dyn CloudCheck, reason: &str) -> Vec<CheckResult> {
    check
        .controls()
        .iter()
        .map(|control_id| CheckResult::error(check.id(), control_id, "*", reason))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    use crate::providers::{Resource, ResourceKind};
    use crate::scan::error::ApiError;
    use crate::scan::types::CloudProvider;

    struct StubApi;

    #[async_trait]
    impl CloudApi for StubApi {
        fn provider(&self) -> CloudProvider {
            CloudProvider::Aws
        }

        fn account_id(&self) -> &str {
            "123456789012"
        }

        async fn list(&self, kind: ResourceKind) -> Result<Vec<Resource>, ApiError> {
            Ok(vec![Resource::new("r-1", kind, json!({}))])
        }
    }

    struct CountingCheck {
        id: &'static str,
        in_flight: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl CloudCheck for CountingCheck {
        fn id(&self) -> &'static str {
            self.id
        }

        fn provider(&self) -> CloudProvider {
            CloudProvider::Aws
        }

        fn controls(&self) -> &'static [&'static str] {
            &["c-1"]
        }

        async fn run(
            &self,
            _api: &dyn CloudApi,
            _scope: &ScanScope,
        ) -> Result<Vec<CheckResult>, ApiError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(vec![CheckResult::pass(self.id, "c-1", "s3_bucket", "r-1", json!({}))])
        }
    }

    struct ThrottlingCheck {
        attempts: Arc<AtomicU32>,
        succeed_on: u32,
    }

    #[async_trait]
    impl CloudCheck for ThrottlingCheck {
        fn id(&self) -> &'static str {
            "throttled-check"
        }

        fn provider(&self) -> CloudProvider {
            CloudProvider::Aws
        }

        fn controls(&self) -> &'static [&'static str] {
            &["c-throttle"]
        }

        async fn run(
            &self,
            _api: &dyn CloudApi,
            _scope: &ScanScope,
        ) -> Result<Vec<CheckResult>, ApiError> {
            let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if attempt < self.succeed_on {
                return Err(ApiError::Throttled("Rate exceeded".to_string()));
            }
            Ok(vec![CheckResult::pass(
                "throttled-check",
                "c-throttle",
                "s3_bucket",
                "r-1",
                json!({}),
            )])
        }
    }

    fn scope() -> ScanScope {
        ScanScope {
            provider: CloudProvider::Aws,
            cloud_account_id: "123456789012".to_string(),
            framework_id: None,
        }
    }

    fn fast_config() -> HarnessConfig {
        HarnessConfig {
            max_concurrency: 2,
            check_timeout: Duration::from_secs(5),
            max_attempts: 3,
            retry_base_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn concurrency_stays_under_the_ceiling() {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let checks: Vec<Arc<dyn CloudCheck>> = ["a", "b", "c", "d", "e", "f"]
            .iter()
            .map(|id| {
                Arc::new(CountingCheck {
                    id,
                    in_flight: Arc::clone(&in_flight),
                    peak: Arc::clone(&peak),
                }) as Arc<dyn CloudCheck>
            })
            .collect();

        let report = run_checks(Arc::new(StubApi), checks, &scope(), &fast_config()).await;

        assert_eq!(report.succeeded.len(), 6);
        assert!(report.failures.is_empty());
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn throttled_check_recovers_within_retry_budget() {
        let attempts = Arc::new(AtomicU32::new(0));
        let checks: Vec<Arc<dyn CloudCheck>> = vec![Arc::new(ThrottlingCheck {
            attempts: Arc::clone(&attempts),
            succeed_on: 3,
        })];

        let report = run_checks(Arc::new(StubApi), checks, &scope(), &fast_config()).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(report.succeeded, vec!["throttled-check".to_string()]);
        assert!(report.failures.is_empty());
    }

    #[tokio::test]
    async fn throttling_past_the_budget_reports_failure() {
        let attempts = Arc::new(AtomicU32::new(0));
        let checks: Vec<Arc<dyn CloudCheck>> = vec![Arc::new(ThrottlingCheck {
            attempts: Arc::clone(&attempts),
            succeed_on: 10,
        })];

        let report = run_checks(Arc::new(StubApi), checks, &scope(), &fast_config()).await;

        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert!(report.succeeded.is_empty());
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "throttled-check");
        assert_eq!(report.results.len(), 1);
        assert!(matches!(report.results[0].outcome, Outcome::Error));
        assert!(report.all_errored());
    }

    struct DetonatingCheck;

    #[async_trait]
    impl CloudCheck for DetonatingCheck {
        fn id(&self) -> &'static str {
            "detonating-check"
        }

        fn provider(&self) -> CloudProvider {
            CloudProvider::Aws
        }

        fn controls(&self) -> &'static [&'static str] {
            &["c-detonate"]
        }

        async fn run(
            &self,
            _api: &dyn CloudApi,
            _scope: &ScanScope,
        ) -> Result<Vec<CheckResult>, ApiError> {
            panic!("boom");
        }
    }

    #[tokio::test]
    async fn panicking_check_still_yields_error_results() {
        let checks: Vec<Arc<dyn CloudCheck>> = vec![
            Arc::new(DetonatingCheck),
            Arc::new(ThrottlingCheck {
                attempts: Arc::new(AtomicU32::new(0)),
                succeed_on: 1,
            }),
        ];

        let report = run_checks(Arc::new(StubApi), checks, &scope(), &fast_config()).await;

        // The sibling check is unaffected.
        assert_eq!(report.succeeded, vec!["throttled-check".to_string()]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "detonating-check");
        assert!(report.failures[0].1.contains("panicked"));

        let errored: Vec<_> = report
            .results
            .iter()
            .filter(|r| matches!(r.outcome, Outcome::Error))
            .collect();
        assert_eq!(errored.len(), 1);
        assert_eq!(errored[0].control_id, "c-detonate");
        assert_eq!(errored[0].check_id, "detonating-check");
    }

    #[tokio::test]
    async fn error_results_cover_every_declared_control() {
        let check = ThrottlingCheck {
            attempts: Arc::new(AtomicU32::new(0)),
            succeed_on: 10,
        };
        let results = error_results(&check, "timed out after 60s");
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].outcome, Outcome::Error));
        assert_eq!(results[0].control_id, "c-throttle");
        assert_eq!(results[0].resource_id, "*");
    }
}
