//! Control Catalog and Framework Tags
//!
//! Every control a built-in check can evaluate is declared here once, with
//! its severity and the compliance frameworks it satisfies. A single
//! control may be tagged with several frameworks; the mapper fans one
//! finding out into every framework its control carries.

use std::collections::HashMap;

use crate::scan::types::Severity;

/// Known framework identifiers.
pub mod framework {
    pub const CIS_AWS: &str = "cis-aws";
    pub const CIS_AZURE: &str = "cis-azure";
    pub const LGPD: &str = "lgpd";
    pub const GDPR: &str = "gdpr";
    pub const HIPAA: &str = "hipaa";
    pub const PCI_DSS: &str = "pci-dss";
    pub const AWS_WELL_ARCHITECTED: &str = "aws-well-architected";
    pub const AZURE_SECURITY_BENCHMARK: &str = "azure-security-benchmark";

    pub const ALL: &[&str] = &[
        CIS_AWS,
        CIS_AZURE,
        LGPD,
        GDPR,
        HIPAA,
        PCI_DSS,
        AWS_WELL_ARCHITECTED,
        AZURE_SECURITY_BENCHMARK,
    ];
}

/// One control: a single named requirement within one or more frameworks.
#[derive(Debug, Clone, Copy)]
pub struct ControlSpec {
    pub id: &'static str,
    pub name: &'static str,
    /// Declared base severity. The aggregator propagates this value and
    /// never infers its own.
    pub severity: Severity,
    pub frameworks: &'static [&'static str],
    pub remediation: &'static str,
}

use framework::*;
use Severity::*;

/// Built-in control table. Checks reference these ids; the aggregator
/// rejects raw results whose control id is not declared here.
pub const CONTROLS: &[ControlSpec] = &[
    // ---- AWS: S3 ----
    ControlSpec {
        id: "s3-block-public-access",
        name: "S3 buckets must block public access",
        severity: Critical,
        frameworks: &[CIS_AWS, PCI_DSS, LGPD, GDPR],
        remediation: "Enable the account and bucket level Block Public Access settings.",
    },
    ControlSpec {
        id: "s3-bucket-acl-public",
        name: "S3 bucket ACLs must not grant public read or write",
        severity: High,
        frameworks: &[CIS_AWS, PCI_DSS],
        remediation: "Remove AllUsers and AuthenticatedUsers grants from the bucket ACL.",
    },
    ControlSpec {
        id: "s3-default-encryption",
        name: "S3 buckets must enforce default encryption at rest",
        severity: High,
        frameworks: &[CIS_AWS, HIPAA, LGPD, GDPR, PCI_DSS],
        remediation: "Enable SSE-S3 or SSE-KMS default encryption on the bucket.",
    },
    ControlSpec {
        id: "s3-versioning-enabled",
        name: "S3 buckets should enable object versioning",
        severity: Medium,
        frameworks: &[CIS_AWS, AWS_WELL_ARCHITECTED],
        remediation: "Enable versioning to protect against accidental deletion.",
    },
    ControlSpec {
        id: "s3-access-logging",
        name: "S3 buckets should enable server access logging",
        severity: Low,
        frameworks: &[CIS_AWS, HIPAA],
        remediation: "Configure server access logging to a dedicated log bucket.",
    },
    // ---- AWS: IAM ----
    ControlSpec {
        id: "iam-root-access-keys",
        name: "Root account must not have active access keys",
        severity: Critical,
        frameworks: &[CIS_AWS, PCI_DSS, HIPAA],
        remediation: "Delete root access keys and use IAM roles for automation.",
    },
    ControlSpec {
        id: "iam-user-mfa",
        name: "IAM users with console access must have MFA enabled",
        severity: High,
        frameworks: &[CIS_AWS, PCI_DSS, HIPAA, GDPR],
        remediation: "Enforce MFA for all console users.",
    },
    ControlSpec {
        id: "iam-key-rotation-90d",
        name: "IAM access keys must be rotated within 90 days",
        severity: Medium,
        frameworks: &[CIS_AWS, PCI_DSS],
        remediation: "Rotate access keys older than 90 days and update consumers.",
    },
    ControlSpec {
        id: "iam-unused-credentials",
        name: "Credentials unused for 90 days should be deactivated",
        severity: Medium,
        frameworks: &[CIS_AWS, AWS_WELL_ARCHITECTED],
        remediation: "Disable or remove credentials that have not been used in 90 days.",
    },
    // ---- AWS: EC2 / networking ----
    ControlSpec {
        id: "ec2-sg-open-ssh",
        name: "Security groups must not allow SSH from 0.0.0.0/0",
        severity: Critical,
        frameworks: &[CIS_AWS, PCI_DSS],
        remediation: "Restrict port 22 ingress to known CIDR ranges or a bastion.",
    },
    ControlSpec {
        id: "ec2-sg-open-rdp",
        name: "Security groups must not allow RDP from 0.0.0.0/0",
        severity: Critical,
        frameworks: &[CIS_AWS, PCI_DSS],
        remediation: "Restrict port 3389 ingress to known CIDR ranges.",
    },
    ControlSpec {
        id: "ec2-sg-wide-open",
        name: "Security groups must not allow all traffic from anywhere",
        severity: High,
        frameworks: &[CIS_AWS, AWS_WELL_ARCHITECTED],
        remediation: "Replace 0.0.0.0/0 all-protocol rules with least-privilege rules.",
    },
    ControlSpec {
        id: "ec2-public-ip",
        name: "Instances should not be assigned public IPs by default",
        severity: Medium,
        frameworks: &[CIS_AWS, AWS_WELL_ARCHITECTED],
        remediation: "Place instances in private subnets behind a load balancer.",
    },
    ControlSpec {
        id: "ec2-imdsv2",
        name: "EC2 instances must require IMDSv2",
        severity: High,
        frameworks: &[CIS_AWS, AWS_WELL_ARCHITECTED],
        remediation: "Set HttpTokens=required in the instance metadata options.",
    },
    // ---- AWS: EBS ----
    ControlSpec {
        id: "ebs-volume-encryption",
        name: "EBS volumes must be encrypted at rest",
        severity: High,
        frameworks: &[CIS_AWS, HIPAA, LGPD, GDPR],
        remediation: "Enable EBS encryption by default and migrate unencrypted volumes.",
    },
    ControlSpec {
        id: "ebs-unattached-volumes",
        name: "Unattached EBS volumes accrue avoidable storage cost",
        severity: Low,
        frameworks: &[AWS_WELL_ARCHITECTED],
        remediation: "Snapshot and delete volumes in the available state.",
    },
    // ---- AWS: RDS ----
    ControlSpec {
        id: "rds-encryption",
        name: "RDS instances must enable storage encryption",
        severity: High,
        frameworks: &[CIS_AWS, HIPAA, LGPD, GDPR, PCI_DSS],
        remediation: "Recreate the instance from an encrypted snapshot.",
    },
    ControlSpec {
        id: "rds-public-access",
        name: "RDS instances must not be publicly accessible",
        severity: Critical,
        frameworks: &[CIS_AWS, PCI_DSS, LGPD, GDPR],
        remediation: "Disable PubliclyAccessible and move the instance to private subnets.",
    },
    ControlSpec {
        id: "rds-backup-retention",
        name: "RDS instances must retain automated backups for 7+ days",
        severity: Medium,
        frameworks: &[CIS_AWS, HIPAA, AWS_WELL_ARCHITECTED],
        remediation: "Set the backup retention period to at least 7 days.",
    },
    // ---- AWS: CloudTrail / KMS ----
    ControlSpec {
        id: "cloudtrail-enabled",
        name: "CloudTrail must be enabled in the account",
        severity: Critical,
        frameworks: &[CIS_AWS, PCI_DSS, HIPAA, GDPR],
        remediation: "Create an organization trail delivering to a locked-down bucket.",
    },
    ControlSpec {
        id: "cloudtrail-multi-region",
        name: "CloudTrail trails should cover all regions",
        severity: High,
        frameworks: &[CIS_AWS, PCI_DSS],
        remediation: "Enable IsMultiRegionTrail on the primary trail.",
    },
    ControlSpec {
        id: "cloudtrail-log-validation",
        name: "CloudTrail log file validation should be enabled",
        severity: Medium,
        frameworks: &[CIS_AWS],
        remediation: "Enable log file integrity validation on the trail.",
    },
    ControlSpec {
        id: "kms-key-rotation",
        name: "Customer-managed KMS keys must enable annual rotation",
        severity: Medium,
        frameworks: &[CIS_AWS, PCI_DSS, HIPAA],
        remediation: "Enable automatic key rotation for customer-managed keys.",
    },
    // ---- Azure: Storage ----
    ControlSpec {
        id: "az-storage-https-only",
        name: "Storage accounts must require secure transfer",
        severity: High,
        frameworks: &[CIS_AZURE, AZURE_SECURITY_BENCHMARK, PCI_DSS],
        remediation: "Set supportsHttpsTrafficOnly=true on the storage account.",
    },
    ControlSpec {
        id: "az-storage-public-blob",
        name: "Storage accounts must not allow public blob access",
        severity: Critical,
        frameworks: &[CIS_AZURE, AZURE_SECURITY_BENCHMARK, LGPD, GDPR],
        remediation: "Set allowBlobPublicAccess=false.",
    },
    ControlSpec {
        id: "az-storage-encryption",
        name: "Storage service encryption must be enabled",
        severity: High,
        frameworks: &[CIS_AZURE, HIPAA, LGPD, GDPR],
        remediation: "Enable encryption for blob and file services.",
    },
    ControlSpec {
        id: "az-storage-min-tls",
        name: "Storage accounts must enforce TLS 1.2 or newer",
        severity: Medium,
        frameworks: &[CIS_AZURE, AZURE_SECURITY_BENCHMARK],
        remediation: "Set minimumTlsVersion=TLS1_2.",
    },
    // ---- Azure: Network ----
    ControlSpec {
        id: "az-nsg-open-ssh",
        name: "NSGs must not allow SSH from the internet",
        severity: Critical,
        frameworks: &[CIS_AZURE, AZURE_SECURITY_BENCHMARK, PCI_DSS],
        remediation: "Restrict port 22 inbound rules to known sources.",
    },
    ControlSpec {
        id: "az-nsg-open-rdp",
        name: "NSGs must not allow RDP from the internet",
        severity: Critical,
        frameworks: &[CIS_AZURE, AZURE_SECURITY_BENCHMARK, PCI_DSS],
        remediation: "Restrict port 3389 inbound rules to known sources.",
    },
    // ---- Azure: Compute ----
    ControlSpec {
        id: "az-vm-disk-encryption",
        name: "Virtual machine disks must be encrypted",
        severity: High,
        frameworks: &[CIS_AZURE, HIPAA, LGPD, GDPR],
        remediation: "Enable Azure Disk Encryption or encryption at host.",
    },
    ControlSpec {
        id: "az-vm-managed-disks",
        name: "Virtual machines should use managed disks",
        severity: Medium,
        frameworks: &[CIS_AZURE, AZURE_SECURITY_BENCHMARK],
        remediation: "Migrate unmanaged disks to managed disks.",
    },
    ControlSpec {
        id: "az-vm-deallocated",
        name: "Stopped-but-allocated VMs accrue avoidable compute cost",
        severity: Low,
        frameworks: &[AZURE_SECURITY_BENCHMARK],
        remediation: "Deallocate or delete VMs stopped for more than 30 days.",
    },
    // ---- Azure: SQL ----
    ControlSpec {
        id: "az-sql-auditing",
        name: "SQL servers must enable auditing",
        severity: Medium,
        frameworks: &[CIS_AZURE, HIPAA, PCI_DSS],
        remediation: "Enable auditing with at least 90 day retention.",
    },
    ControlSpec {
        id: "az-sql-tde",
        name: "SQL databases must enable transparent data encryption",
        severity: High,
        frameworks: &[CIS_AZURE, HIPAA, LGPD, GDPR, PCI_DSS],
        remediation: "Enable TDE on every database.",
    },
    ControlSpec {
        id: "az-sql-public-access",
        name: "SQL servers must not be reachable from all of Azure or the internet",
        severity: Critical,
        frameworks: &[CIS_AZURE, PCI_DSS, LGPD, GDPR],
        remediation: "Remove 0.0.0.0 firewall rules and use private endpoints.",
    },
    // ---- Azure: Key Vault ----
    ControlSpec {
        id: "az-keyvault-soft-delete",
        name: "Key vaults must enable soft delete and purge protection",
        severity: High,
        frameworks: &[CIS_AZURE, AZURE_SECURITY_BENCHMARK],
        remediation: "Enable soft delete and purge protection on the vault.",
    },
    ControlSpec {
        id: "az-keyvault-expiry",
        name: "Key vault secrets and keys should have expiry dates",
        severity: Medium,
        frameworks: &[CIS_AZURE],
        remediation: "Set expiration dates on all secrets and keys.",
    },
    // ---- Azure: Monitoring / App Service ----
    ControlSpec {
        id: "az-activity-log-retention",
        name: "Activity log must be retained for 365+ days",
        severity: Medium,
        frameworks: &[CIS_AZURE, HIPAA, GDPR],
        remediation: "Configure a log profile with at least 365 day retention.",
    },
    ControlSpec {
        id: "az-appservice-https",
        name: "App Services must redirect HTTP to HTTPS",
        severity: High,
        frameworks: &[CIS_AZURE, AZURE_SECURITY_BENCHMARK, PCI_DSS],
        remediation: "Enable HTTPS Only on the app.",
    },
    ControlSpec {
        id: "az-appservice-tls",
        name: "App Services must require TLS 1.2 or newer",
        severity: Medium,
        frameworks: &[CIS_AZURE, AZURE_SECURITY_BENCHMARK],
        remediation: "Set the minimum TLS version to 1.2.",
    },
];

/// Lookup table over [`CONTROLS`].
#[derive(Debug)]
pub struct ControlCatalog {
    by_id: HashMap<&'static str, &'static ControlSpec>,
}

impl ControlCatalog {
    pub fn builtin() -> Self {
        let mut by_id = HashMap::with_capacity(CONTROLS.len());
        for control in CONTROLS {
            by_id.insert(control.id, control);
        }
        Self { by_id }
    }

    pub fn get(&self, control_id: &str) -> Option<&'static ControlSpec> {
        self.by_id.get(control_id).copied()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    /// Controls tagged with the given framework.
    pub fn controls_for_framework(&self, framework_id: &str) -> Vec<&'static ControlSpec> {
        CONTROLS
            .iter()
            .filter(|c| c.frameworks.contains(&framework_id))
            .collect()
    }
}

impl Default for ControlCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
