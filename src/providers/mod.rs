//! Cloud Provider Adapters
//!
//! Credential resolution and the `CloudApi` seam every check runs
//! against. Checks never talk to provider SDKs directly; they list
//! normalized resources through this trait so the registry stays free of
//! per-provider branching.

pub mod aws;
pub mod azure;
pub mod credentials;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::scan::error::{ApiError, ScanError};
use crate::scan::types::CloudProvider;

pub use credentials::{resolve, AuthMethod, CloudCredential};

/// Resource kinds the built-in checks evaluate. Each provider client maps
/// a kind to the concrete API call that lists it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    // AWS
    S3Bucket,
    IamUser,
    SecurityGroup,
    Ec2Instance,
    EbsVolume,
    RdsInstance,
    CloudTrailTrail,
    KmsKey,
    // Azure
    StorageAccount,
    NetworkSecurityGroup,
    VirtualMachine,
    SqlServer,
    KeyVault,
    LogProfile,
    AppService,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::S3Bucket => "s3_bucket",
            ResourceKind::IamUser => "iam_user",
            ResourceKind::SecurityGroup => "security_group",
            ResourceKind::Ec2Instance => "ec2_instance",
            ResourceKind::EbsVolume => "ebs_volume",
            ResourceKind::RdsInstance => "rds_instance",
            ResourceKind::CloudTrailTrail => "cloudtrail_trail",
            ResourceKind::KmsKey => "kms_key",
            ResourceKind::StorageAccount => "storage_account",
            ResourceKind::NetworkSecurityGroup => "network_security_group",
            ResourceKind::VirtualMachine => "virtual_machine",
            ResourceKind::SqlServer => "sql_server",
            ResourceKind::KeyVault => "key_vault",
            ResourceKind::LogProfile => "log_profile",
            ResourceKind::AppService => "app_service",
        }
    }
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cloud resource, normalized to an attribute document. Provider
/// clients flatten the fields checks care about into `attributes`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub kind: ResourceKind,
    pub region: Option<String>,
    pub attributes: serde_json::Value,
}

impl Resource {
    pub fn new(id: &str, kind: ResourceKind, attributes: serde_json::Value) -> Self {
        Self {
            id: id.to_string(),
            kind,
            region: None,
            attributes,
        }
    }

    pub fn attr_bool(&self, key: &str) -> Option<bool> {
        self.attributes.get(key).and_then(|v| v.as_bool())
    }

    pub fn attr_str(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).and_then(|v| v.as_str())
    }

    pub fn attr_i64(&self, key: &str) -> Option<i64> {
        self.attributes.get(key).and_then(|v| v.as_i64())
    }
}

/// Read-only session against one cloud account. Produced once per scan by
/// the session factory and shared by reference into every check task; no
/// process-wide credential cache exists.
#[async_trait]
pub trait CloudApi: Send + Sync {
    fn provider(&self) -> CloudProvider;

    /// Account or subscription identifier the session is bound to.
    fn account_id(&self) -> &str;

    /// List all resources of one kind visible to the session.
    async fn list(&self, kind: ResourceKind) -> Result<Vec<Resource>, ApiError>;
}

/// Materializes an authenticated session from a credential record.
/// Resolution (method selection) is pure; this is the side-effecting step
/// that may fail with `AuthFailure` and is retried at most once.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(
        &self,
        credential: &CloudCredential,
    ) -> Result<std::sync::Arc<dyn CloudApi>, ScanError>;
}

/// Default factory: STS assume-role / static keys for AWS, AAD
/// client-credentials for Azure.
pub struct ProviderSessionFactory {
    http: reqwest::Client,
}

impl ProviderSessionFactory {
    pub fn new() -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl SessionFactory for ProviderSessionFactory {
    async fn open(
        &self,
        credential: &CloudCredential,
    ) -> Result<std::sync::Arc<dyn CloudApi>, ScanError> {
        let method = credentials::resolve(credential)?;

        // One retry on provider rejection before surfacing AuthFailure.
        let mut last_err = None;
        for attempt in 0..2 {
            let result = match credential.provider {
                CloudProvider::Aws => aws::AwsApi::connect(
                    self.http.clone(),
                    &credential.cloud_account_id,
                    &method,
                )
                .await
                .map(|api| std::sync::Arc::new(api) as std::sync::Arc<dyn CloudApi>),
                CloudProvider::Azure => azure::AzureApi::connect(
                    self.http.clone(),
                    &credential.cloud_account_id,
                    &method,
                )
                .await
                .map(|api| std::sync::Arc::new(api) as std::sync::Arc<dyn CloudApi>),
            };

            match result {
                Ok(api) => return Ok(api),
                Err(e) => {
                    tracing::warn!(
                        provider = %credential.provider,
                        account = %credential.cloud_account_id,
                        attempt,
                        error = %e,
                        "session open failed"
                    );
                    last_err = Some(e);
                }
            }
        }

        Err(ScanError::AuthFailure(
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown auth failure".to_string()),
        ))
    }
}
