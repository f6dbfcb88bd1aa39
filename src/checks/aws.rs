//! AWS Checks
//!
//! Evaluations over the attribute documents `providers::aws` produces.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;

use crate::providers::{Resource, ResourceKind};
use crate::scan::registry::{CloudCheck, ControlRule, ResourceCheck, RuleVerdict};
use crate::scan::types::CloudProvider;

fn verdict(pass: bool, evidence: serde_json::Value) -> RuleVerdict {
    if pass {
        RuleVerdict::Pass(evidence)
    } else {
        RuleVerdict::Fail(evidence)
    }
}

// ---- S3 ----

fn s3_block_public_access(r: &Resource) -> RuleVerdict {
    let blocked = r.attr_bool("block_public_access").unwrap_or(false);
    verdict(blocked, json!({ "block_public_access": blocked }))
}

fn s3_acl_public(r: &Resource) -> RuleVerdict {
    match r.attr_bool("acl_public") {
        Some(public) => verdict(!public, json!({ "acl_public": public })),
        None => RuleVerdict::Skip,
    }
}

fn s3_default_encryption(r: &Resource) -> RuleVerdict {
    let encrypted = r.attr_bool("default_encryption").unwrap_or(false);
    verdict(encrypted, json!({ "default_encryption": encrypted }))
}

fn s3_versioning(r: &Resource) -> RuleVerdict {
    let enabled = r.attr_bool("versioning_enabled").unwrap_or(false);
    verdict(enabled, json!({ "versioning_enabled": enabled }))
}

fn s3_access_logging(r: &Resource) -> RuleVerdict {
    let enabled = r.attr_bool("access_logging").unwrap_or(false);
    verdict(enabled, json!({ "access_logging": enabled }))
}

// ---- IAM ----

fn iam_root_access_keys(r: &Resource) -> RuleVerdict {
    if !r.attr_bool("is_root").unwrap_or(false) {
        return RuleVerdict::Skip;
    }
    let present = r.attr_bool("access_keys_present").unwrap_or(false);
    verdict(!present, json!({ "root_access_keys_present": present }))
}

fn iam_user_mfa(r: &Resource) -> RuleVerdict {
    let is_root = r.attr_bool("is_root").unwrap_or(false);
    if !is_root && !r.attr_bool("has_console_access").unwrap_or(false) {
        return RuleVerdict::Skip;
    }
    let mfa = r.attr_bool("mfa_active").unwrap_or(false);
    verdict(mfa, json!({ "mfa_active": mfa }))
}

fn iam_key_rotation(r: &Resource) -> RuleVerdict {
    match r.attr_i64("active_key_age_days") {
        Some(age) => verdict(age <= 90, json!({ "active_key_age_days": age })),
        None => RuleVerdict::Skip,
    }
}

fn iam_unused_credentials(r: &Resource) -> RuleVerdict {
    if r.attr_bool("is_root").unwrap_or(false) {
        return RuleVerdict::Skip;
    }
    let last_used = match r.attr_str("password_last_used") {
        Some(ts) => ts,
        None => return RuleVerdict::Skip,
    };
    match chrono::DateTime::parse_from_rfc3339(last_used) {
        Ok(ts) => {
            let idle_days = (Utc::now() - ts.with_timezone(&Utc)).num_days();
            verdict(idle_days <= 90, json!({ "idle_days": idle_days }))
        }
        Err(_) => RuleVerdict::Skip,
    }
}

// ---- EC2 / networking ----

fn ingress_open_on_port(r: &Resource, port: i64) -> bool {
    r.attributes["ingress_rules"]
        .as_array()
        .map(|rules| {
            rules.iter().any(|rule| {
                if rule["open_to_world"].as_bool() != Some(true) {
                    return false;
                }
                let from = rule["from_port"].as_i64();
                let to = rule["to_port"].as_i64();
                match (from, to) {
                    (Some(from), Some(to)) => from <= port && port <= to,
                    // No port range on an open rule means all ports.
                    _ => true,
                }
            })
        })
        .unwrap_or(false)
}

fn sg_open_ssh(r: &Resource) -> RuleVerdict {
    let open = ingress_open_on_port(r, 22);
    verdict(!open, json!({ "ssh_open_to_world": open }))
}

fn sg_open_rdp(r: &Resource) -> RuleVerdict {
    let open = ingress_open_on_port(r, 3389);
    verdict(!open, json!({ "rdp_open_to_world": open }))
}

fn sg_wide_open(r: &Resource) -> RuleVerdict {
    let wide_open = r.attributes["ingress_rules"]
        .as_array()
        .map(|rules| {
            rules.iter().any(|rule| {
                rule["open_to_world"].as_bool() == Some(true)
                    && rule["protocol"].as_str() == Some("-1")
            })
        })
        .unwrap_or(false);
    verdict(!wide_open, json!({ "all_traffic_from_anywhere": wide_open }))
}

fn ec2_public_ip(r: &Resource) -> RuleVerdict {
    let public = r.attr_str("public_ip").is_some();
    verdict(!public, json!({ "public_ip": r.attributes["public_ip"] }))
}

fn ec2_imdsv2(r: &Resource) -> RuleVerdict {
    let required = r.attr_bool("imdsv2_required").unwrap_or(false);
    verdict(required, json!({ "imdsv2_required": required }))
}

// ---- EBS ----

fn ebs_encryption(r: &Resource) -> RuleVerdict {
    let encrypted = r.attr_bool("encrypted").unwrap_or(false);
    verdict(encrypted, json!({ "encrypted": encrypted }))
}

fn ebs_unattached(r: &Resource) -> RuleVerdict {
    let attached = r.attr_bool("attached").unwrap_or(true);
    verdict(attached, json!({ "attached": attached }))
}

// ---- RDS ----

fn rds_encryption(r: &Resource) -> RuleVerdict {
    let encrypted = r.attr_bool("storage_encrypted").unwrap_or(false);
    verdict(encrypted, json!({ "storage_encrypted": encrypted }))
}

fn rds_public(r: &Resource) -> RuleVerdict {
    let public = r.attr_bool("publicly_accessible").unwrap_or(false);
    verdict(!public, json!({ "publicly_accessible": public }))
}

fn rds_backup_retention(r: &Resource) -> RuleVerdict {
    let days = r.attr_i64("backup_retention_days").unwrap_or(0);
    verdict(days >= 7, json!({ "backup_retention_days": days }))
}

// ---- CloudTrail / KMS ----

fn trail_logging(r: &Resource) -> RuleVerdict {
    let logging = r.attr_bool("is_logging").unwrap_or(false);
    verdict(logging, json!({ "is_logging": logging }))
}

fn trail_multi_region(r: &Resource) -> RuleVerdict {
    let multi = r.attr_bool("multi_region").unwrap_or(false);
    verdict(multi, json!({ "multi_region": multi }))
}

fn trail_log_validation(r: &Resource) -> RuleVerdict {
    let enabled = r.attr_bool("log_validation").unwrap_or(false);
    verdict(enabled, json!({ "log_validation": enabled }))
}

fn kms_rotation(r: &Resource) -> RuleVerdict {
    let rotation = r.attr_bool("rotation_enabled").unwrap_or(false);
    verdict(rotation, json!({ "rotation_enabled": rotation }))
}

/// The built-in AWS check set.
pub fn all() -> Vec<Arc<dyn CloudCheck>> {
    vec![
        Arc::new(ResourceCheck {
            id: "aws-s3-public-exposure",
            provider: CloudProvider::Aws,
            kind: ResourceKind::S3Bucket,
            rules: &[
                ControlRule { control_id: "s3-block-public-access", evaluate: s3_block_public_access },
                ControlRule { control_id: "s3-bucket-acl-public", evaluate: s3_acl_public },
            ],
            fail_when_empty: &[],
            control_ids: &["s3-block-public-access", "s3-bucket-acl-public"],
        }),
        Arc::new(ResourceCheck {
            id: "aws-s3-encryption",
            provider: CloudProvider::Aws,
            kind: ResourceKind::S3Bucket,
            rules: &[ControlRule { control_id: "s3-default-encryption", evaluate: s3_default_encryption }],
            fail_when_empty: &[],
            control_ids: &["s3-default-encryption"],
        }),
        Arc::new(ResourceCheck {
            id: "aws-s3-data-protection",
            provider: CloudProvider::Aws,
            kind: ResourceKind::S3Bucket,
            rules: &[
                ControlRule { control_id: "s3-versioning-enabled", evaluate: s3_versioning },
                ControlRule { control_id: "s3-access-logging", evaluate: s3_access_logging },
            ],
            fail_when_empty: &[],
            control_ids: &["s3-versioning-enabled", "s3-access-logging"],
        }),
        Arc::new(ResourceCheck {
            id: "aws-iam-root-account",
            provider: CloudProvider::Aws,
            kind: ResourceKind::IamUser,
            rules: &[ControlRule { control_id: "iam-root-access-keys", evaluate: iam_root_access_keys }],
            fail_when_empty: &[],
            control_ids: &["iam-root-access-keys"],
        }),
        Arc::new(ResourceCheck {
            id: "aws-iam-mfa",
            provider: CloudProvider::Aws,
            kind: ResourceKind::IamUser,
            rules: &[ControlRule { control_id: "iam-user-mfa", evaluate: iam_user_mfa }],
            fail_when_empty: &[],
            control_ids: &["iam-user-mfa"],
        }),
        Arc::new(ResourceCheck {
            id: "aws-iam-credential-hygiene",
            provider: CloudProvider::Aws,
            kind: ResourceKind::IamUser,
            rules: &[
                ControlRule { control_id: "iam-key-rotation-90d", evaluate: iam_key_rotation },
                ControlRule { control_id: "iam-unused-credentials", evaluate: iam_unused_credentials },
            ],
            fail_when_empty: &[],
            control_ids: &["iam-key-rotation-90d", "iam-unused-credentials"],
        }),
        Arc::new(ResourceCheck {
            id: "aws-sg-ingress",
            provider: CloudProvider::Aws,
            kind: ResourceKind::SecurityGroup,
            rules: &[
                ControlRule { control_id: "ec2-sg-open-ssh", evaluate: sg_open_ssh },
                ControlRule { control_id: "ec2-sg-open-rdp", evaluate: sg_open_rdp },
                ControlRule { control_id: "ec2-sg-wide-open", evaluate: sg_wide_open },
            ],
            fail_when_empty: &[],
            control_ids: &["ec2-sg-open-ssh", "ec2-sg-open-rdp", "ec2-sg-wide-open"],
        }),
        Arc::new(ResourceCheck {
            id: "aws-ec2-instance-posture",
            provider: CloudProvider::Aws,
            kind: ResourceKind::Ec2Instance,
            rules: &[
                ControlRule { control_id: "ec2-public-ip", evaluate: ec2_public_ip },
                ControlRule { control_id: "ec2-imdsv2", evaluate: ec2_imdsv2 },
            ],
            fail_when_empty: &[],
            control_ids: &["ec2-public-ip", "ec2-imdsv2"],
        }),
        Arc::new(ResourceCheck {
            id: "aws-ebs-volumes",
            provider: CloudProvider::Aws,
            kind: ResourceKind::EbsVolume,
            rules: &[
                ControlRule { control_id: "ebs-volume-encryption", evaluate: ebs_encryption },
                ControlRule { control_id: "ebs-unattached-volumes", evaluate: ebs_unattached },
            ],
            fail_when_empty: &[],
            control_ids: &["ebs-volume-encryption", "ebs-unattached-volumes"],
        }),
        Arc::new(ResourceCheck {
            id: "aws-rds-posture",
            provider: CloudProvider::Aws,
            kind: ResourceKind::RdsInstance,
            rules: &[
                ControlRule { control_id: "rds-encryption", evaluate: rds_encryption },
                ControlRule { control_id: "rds-public-access", evaluate: rds_public },
                ControlRule { control_id: "rds-backup-retention", evaluate: rds_backup_retention },
            ],
            fail_when_empty: &[],
            control_ids: &["rds-encryption", "rds-public-access", "rds-backup-retention"],
        }),
        Arc::new(ResourceCheck {
            id: "aws-cloudtrail",
            provider: CloudProvider::Aws,
            kind: ResourceKind::CloudTrailTrail,
            rules: &[
                ControlRule { control_id: "cloudtrail-enabled", evaluate: trail_logging },
                ControlRule { control_id: "cloudtrail-multi-region", evaluate: trail_multi_region },
                ControlRule { control_id: "cloudtrail-log-validation", evaluate: trail_log_validation },
            ],
            // An account with no trail at all fails the enablement control.
            fail_when_empty: &["cloudtrail-enabled"],
            control_ids: &[
                "cloudtrail-enabled",
                "cloudtrail-multi-region",
                "cloudtrail-log-validation",
            ],
        }),
        Arc::new(ResourceCheck {
            id: "aws-kms-rotation",
            provider: CloudProvider::Aws,
            kind: ResourceKind::KmsKey,
            rules: &[ControlRule { control_id: "kms-key-rotation", evaluate: kms_rotation }],
            fail_when_empty: &[],
            control_ids: &["kms-key-rotation"],
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resource(attrs: serde_json::Value) -> Resource {
        Resource::new("r-1", ResourceKind::SecurityGroup, attrs)
    }

    #[test]
    fn open_ssh_is_detected_inside_port_ranges() {
        let r = resource(json!({
            "ingress_rules": [
                { "protocol": "tcp", "from_port": 20, "to_port": 80, "open_to_world": true }
            ]
        }));
        assert!(matches!(sg_open_ssh(&r), RuleVerdict::Fail(_)));
        assert!(matches!(sg_open_rdp(&r), RuleVerdict::Pass(_)));
    }

    #[test]
    fn open_rule_without_ports_covers_all_ports() {
        let r = resource(json!({
            "ingress_rules": [{ "protocol": "-1", "open_to_world": true }]
        }));
        assert!(matches!(sg_open_ssh(&r), RuleVerdict::Fail(_)));
        assert!(matches!(sg_wide_open(&r), RuleVerdict::Fail(_)));
    }

    #[test]
    fn closed_group_passes_everything() {
        let r = resource(json!({
            "ingress_rules": [
                { "protocol": "tcp", "from_port": 443, "to_port": 443, "open_to_world": false }
            ]
        }));
        assert!(matches!(sg_open_ssh(&r), RuleVerdict::Pass(_)));
        assert!(matches!(sg_open_rdp(&r), RuleVerdict::Pass(_)));
        assert!(matches!(sg_wide_open(&r), RuleVerdict::Pass(_)));
    }

    #[test]
    fn mfa_rule_skips_api_only_users() {
        let api_only = Resource::new(
            "svc-user",
            ResourceKind::IamUser,
            json!({ "is_root": false, "has_console_access": false, "mfa_active": false }),
        );
        assert!(matches!(iam_user_mfa(&api_only), RuleVerdict::Skip));

        let console_user = Resource::new(
            "admin",
            ResourceKind::IamUser,
            json!({ "is_root": false, "has_console_access": true, "mfa_active": false }),
        );
        assert!(matches!(iam_user_mfa(&console_user), RuleVerdict::Fail(_)));
    }

    #[test]
    fn root_key_rule_only_applies_to_root() {
        let user = Resource::new(
            "alice",
            ResourceKind::IamUser,
            json!({ "is_root": false, "access_keys_present": true }),
        );
        assert!(matches!(iam_root_access_keys(&user), RuleVerdict::Skip));

        let root = Resource::new(
            "root",
            ResourceKind::IamUser,
            json!({ "is_root": true, "access_keys_present": true }),
        );
        assert!(matches!(iam_root_access_keys(&root), RuleVerdict::Fail(_)));
    }

    #[test]
    fn stale_access_keys_fail_rotation() {
        let r = Resource::new(
            "bob",
            ResourceKind::IamUser,
            json!({ "active_key_age_days": 120 }),
        );
        assert!(matches!(iam_key_rotation(&r), RuleVerdict::Fail(_)));

        let fresh = Resource::new(
            "carol",
            ResourceKind::IamUser,
            json!({ "active_key_age_days": 30 }),
        );
        assert!(matches!(iam_key_rotation(&fresh), RuleVerdict::Pass(_)));
    }
}
