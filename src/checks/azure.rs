//! Azure Checks
//!
//! Evaluations over the attribute documents `providers::azure` produces
//! from ARM resource listings.

use std::sync::Arc;

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

// ---- Storage accounts ----

fn storage_https_only(r: &Resource) -> RuleVerdict {
    let https = r.attr_bool("https_only").unwrap_or(false);
    verdict(https, json!({ "https_only": https }))
}

fn storage_public_blob(r: &Resource) -> RuleVerdict {
    let public = r.attr_bool("public_blob_access").unwrap_or(true);
    verdict(!public, json!({ "public_blob_access": public }))
}

fn storage_encryption(r: &Resource) -> RuleVerdict {
    let encrypted = r.attr_bool("encryption_enabled").unwrap_or(false);
    verdict(encrypted, json!({ "encryption_enabled": encrypted }))
}

fn storage_min_tls(r: &Resource) -> RuleVerdict {
    // ARM reports TLS1_0 / TLS1_1 / TLS1_2; absent means the 1.0 default.
    let version = r.attr_str("min_tls_version").unwrap_or("TLS1_0");
    let modern = version == "TLS1_2" || version == "TLS1_3";
    verdict(modern, json!({ "min_tls_version": version }))
}

// ---- Network security groups ----

fn nsg_open_on_port(r: &Resource, port: &str) -> bool {
    r.attributes["rules"]
        .as_array()
        .map(|rules| {
            rules.iter().any(|rule| {
                rule["direction"].as_str() == Some("Inbound")
                    && rule["access"].as_str() == Some("Allow")
                    && rule["source_any"].as_bool() == Some(true)
                    && port_range_covers(rule["destination_port"].as_str(), port)
            })
        })
        .unwrap_or(false)
}

fn port_range_covers(range: Option<&str>, port: &str) -> bool {
    let range = match range {
        Some(r) => r,
        None => return false,
    };
    if range == "*" || range == port {
        return true;
    }
    if let Some((lo, hi)) = range.split_once('-') {
        if let (Ok(lo), Ok(hi), Ok(p)) =
            (lo.parse::<u16>(), hi.parse::<u16>(), port.parse::<u16>())
        {
            return lo <= p && p <= hi;
        }
    }
    false
}

fn nsg_open_ssh(r: &Resource) -> RuleVerdict {
    let open = nsg_open_on_port(r, "22");
    verdict(!open, json!({ "ssh_open_to_internet": open }))
}

fn nsg_open_rdp(r: &Resource) -> RuleVerdict {
    let open = nsg_open_on_port(r, "3389");
    verdict(!open, json!({ "rdp_open_to_internet": open }))
}

// ---- Virtual machines ----

fn vm_disk_encryption(r: &Resource) -> RuleVerdict {
    let encrypted = r.attr_bool("encryption_at_host").unwrap_or(false);
    verdict(encrypted, json!({ "encryption_at_host": encrypted }))
}

fn vm_managed_disks(r: &Resource) -> RuleVerdict {
    let managed = r.attr_bool("managed_disks").unwrap_or(false);
    verdict(managed, json!({ "managed_disks": managed }))
}

fn vm_deallocated(r: &Resource) -> RuleVerdict {
    match r.attr_str("power_state") {
        Some(state) => {
            let stopped = state.ends_with("deallocated") || state.ends_with("stopped");
            verdict(!stopped, json!({ "power_state": state }))
        }
        None => RuleVerdict::Skip,
    }
}

// ---- SQL servers ----

fn sql_auditing(r: &Resource) -> RuleVerdict {
    let enabled = r.attr_bool("auditing_enabled").unwrap_or(false);
    verdict(enabled, json!({ "auditing_enabled": enabled }))
}

fn sql_public_access(r: &Resource) -> RuleVerdict {
    let network_open = r.attr_bool("public_network_access").unwrap_or(true);
    let firewall_open = r.attr_bool("open_firewall_rule").unwrap_or(false);
    verdict(
        !network_open && !firewall_open,
        json!({
            "public_network_access": network_open,
            "open_firewall_rule": firewall_open,
        }),
    )
}

// ---- SQL TDE ----

fn sql_tde(r: &Resource) -> RuleVerdict {
    // Unset means the server has no user databases to assess.
    match r.attr_bool("tde_all_databases") {
        Some(all_encrypted) => verdict(all_encrypted, json!({ "tde_all_databases": all_encrypted })),
        None => RuleVerdict::Skip,
    }
}

// ---- Key Vault ----

fn keyvault_soft_delete(r: &Resource) -> RuleVerdict {
    let soft_delete = r.attr_bool("soft_delete").unwrap_or(false);
    let purge_protection = r.attr_bool("purge_protection").unwrap_or(false);
    verdict(
        soft_delete,
        json!({ "soft_delete": soft_delete, "purge_protection": purge_protection }),
    )
}

fn keyvault_key_expiry(r: &Resource) -> RuleVerdict {
    match r.attr_i64("keys_without_expiry") {
        Some(count) => verdict(count == 0, json!({ "keys_without_expiry": count })),
        None => RuleVerdict::Skip,
    }
}

// ---- Activity log ----

fn log_retention(r: &Resource) -> RuleVerdict {
    let enabled = r.attr_bool("retention_enabled").unwrap_or(false);
    let days = r.attr_i64("retention_days").unwrap_or(0);
    // days == 0 with retention enabled means keep forever.
    let sufficient = enabled && (days == 0 || days >= 365);
    verdict(
        sufficient,
        json!({ "retention_enabled": enabled, "retention_days": days }),
    )
}

// ---- App Service ----

fn appservice_https(r: &Resource) -> RuleVerdict {
    let https = r.attr_bool("https_only").unwrap_or(false);
    verdict(https, json!({ "https_only": https }))
}

fn appservice_tls(r: &Resource) -> RuleVerdict {
    match r.attr_str("min_tls_version") {
        Some(version) => {
            let modern = version == "1.2" || version == "1.3";
            verdict(modern, json!({ "min_tls_version": version }))
        }
        None => RuleVerdict::Skip,
    }
}

/// The built-in Azure check set.
pub fn all() -> Vec<Arc<dyn CloudCheck>> {
    vec![
        Arc::new(ResourceCheck {
            id: "az-storage-posture",
            provider: CloudProvider::Azure,
            kind: ResourceKind::StorageAccount,
            rules: &[
                ControlRule { control_id: "az-storage-https-only", evaluate: storage_https_only },
                ControlRule { control_id: "az-storage-public-blob", evaluate: storage_public_blob },
                ControlRule { control_id: "az-storage-encryption", evaluate: storage_encryption },
                ControlRule { control_id: "az-storage-min-tls", evaluate: storage_min_tls },
            ],
            fail_when_empty: &[],
            control_ids: &[
                "az-storage-https-only",
                "az-storage-public-blob",
                "az-storage-encryption",
                "az-storage-min-tls",
            ],
        }),
        Arc::new(ResourceCheck {
            id: "az-nsg-ingress",
            provider: CloudProvider::Azure,
            kind: ResourceKind::NetworkSecurityGroup,
            rules: &[
                ControlRule { control_id: "az-nsg-open-ssh", evaluate: nsg_open_ssh },
                ControlRule { control_id: "az-nsg-open-rdp", evaluate: nsg_open_rdp },
            ],
            fail_when_empty: &[],
            control_ids: &["az-nsg-open-ssh", "az-nsg-open-rdp"],
        }),
        Arc::new(ResourceCheck {
            id: "az-vm-posture",
            provider: CloudProvider::Azure,
            kind: ResourceKind::VirtualMachine,
            rules: &[
                ControlRule { control_id: "az-vm-disk-encryption", evaluate: vm_disk_encryption },
                ControlRule { control_id: "az-vm-managed-disks", evaluate: vm_managed_disks },
                ControlRule { control_id: "az-vm-deallocated", evaluate: vm_deallocated },
            ],
            fail_when_empty: &[],
            control_ids: &["az-vm-disk-encryption", "az-vm-managed-disks", "az-vm-deallocated"],
        }),
        Arc::new(ResourceCheck {
            id: "az-sql-posture",
            provider: CloudProvider::Azure,
            kind: ResourceKind::SqlServer,
            rules: &[
                ControlRule { control_id: "az-sql-auditing", evaluate: sql_auditing },
                ControlRule { control_id: "az-sql-public-access", evaluate: sql_public_access },
            ],
            fail_when_empty: &[],
            control_ids: &["az-sql-auditing", "az-sql-public-access"],
        }),
        Arc::new(ResourceCheck {
            id: "az-sql-tde",
            provider: CloudProvider::Azure,
            kind: ResourceKind::SqlServer,
            rules: &[ControlRule { control_id: "az-sql-tde", evaluate: sql_tde }],
            fail_when_empty: &[],
            control_ids: &["az-sql-tde"],
        }),
        Arc::new(ResourceCheck {
            id: "az-keyvault-key-expiry",
            provider: CloudProvider::Azure,
            kind: ResourceKind::KeyVault,
            rules: &[
                ControlRule { control_id: "az-keyvault-expiry", evaluate: keyvault_key_expiry },
            ],
            fail_when_empty: &[],
            control_ids: &["az-keyvault-expiry"],
        }),
        Arc::new(ResourceCheck {
            id: "az-keyvault-posture",
            provider: CloudProvider::Azure,
            kind: ResourceKind::KeyVault,
            rules: &[
                ControlRule { control_id: "az-keyvault-soft-delete", evaluate: keyvault_soft_delete },
            ],
            fail_when_empty: &[],
            control_ids: &["az-keyvault-soft-delete"],
        }),
        Arc::new(ResourceCheck {
            id: "az-activity-log",
            provider: CloudProvider::Azure,
            kind: ResourceKind::LogProfile,
            rules: &[
                ControlRule { control_id: "az-activity-log-retention", evaluate: log_retention },
            ],
            // No log profile at all means activity logs are not retained.
            fail_when_empty: &["az-activity-log-retention"],
            control_ids: &["az-activity-log-retention"],
        }),
        Arc::new(ResourceCheck {
            id: "az-appservice-posture",
            provider: CloudProvider::Azure,
            kind: ResourceKind::AppService,
            rules: &[
                ControlRule { control_id: "az-appservice-https", evaluate: appservice_https },
                ControlRule { control_id: "az-appservice-tls", evaluate: appservice_tls },
            ],
            fail_when_empty: &[],
            control_ids: &["az-appservice-https", "az-appservice-tls"],
        }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_ranges_and_wildcards_cover_ssh() {
        assert!(port_range_covers(Some("*"), "22"));
        assert!(port_range_covers(Some("22"), "22"));
        assert!(port_range_covers(Some("0-1024"), "22"));
        assert!(!port_range_covers(Some("443"), "22"));
        assert!(!port_range_covers(Some("8000-9000"), "22"));
        assert!(!port_range_covers(None, "22"));
    }

    #[test]
    fn deny_rules_do_not_flag_the_group() {
        let r = Resource::new(
            "nsg-1",
            ResourceKind::NetworkSecurityGroup,
            json!({
                "rules": [{
                    "direction": "Inbound",
                    "access": "Deny",
                    "destination_port": "22",
                    "source_any": true,
                }]
            }),
        );
        assert!(matches!(nsg_open_ssh(&r), RuleVerdict::Pass(_)));
    }

    #[test]
    fn storage_without_tls_setting_fails_min_tls() {
        let r = Resource::new("stg", ResourceKind::StorageAccount, json!({}));
        assert!(matches!(storage_min_tls(&r), RuleVerdict::Fail(_)));

        let modern = Resource::new(
            "stg2",
            ResourceKind::StorageAccount,
            json!({ "min_tls_version": "TLS1_2" }),
        );
        assert!(matches!(storage_min_tls(&modern), RuleVerdict::Pass(_)));
    }

    #[test]
    fn deallocated_vm_flags_the_cost_control() {
        let stopped = Resource::new(
            "vm-1",
            ResourceKind::VirtualMachine,
            json!({ "power_state": "PowerState/deallocated" }),
        );
        assert!(matches!(vm_deallocated(&stopped), RuleVerdict::Fail(_)));

        let running = Resource::new(
            "vm-2",
            ResourceKind::VirtualMachine,
            json!({ "power_state": "PowerState/running" }),
        );
        assert!(matches!(vm_deallocated(&running), RuleVerdict::Pass(_)));
    }

    #[test]
    fn tde_rule_skips_servers_without_user_databases() {
        let empty = Resource::new("sql-empty", ResourceKind::SqlServer, json!({}));
        assert!(matches!(sql_tde(&empty), RuleVerdict::Skip));

        let unencrypted = Resource::new(
            "sql-plain",
            ResourceKind::SqlServer,
            json!({ "tde_all_databases": false }),
        );
        assert!(matches!(sql_tde(&unencrypted), RuleVerdict::Fail(_)));

        let encrypted = Resource::new(
            "sql-tde",
            ResourceKind::SqlServer,
            json!({ "tde_all_databases": true }),
        );
        assert!(matches!(sql_tde(&encrypted), RuleVerdict::Pass(_)));
    }

    #[test]
    fn keys_without_expiry_fail_the_vault() {
        let unknown = Resource::new("kv-1", ResourceKind::KeyVault, json!({}));
        assert!(matches!(keyvault_key_expiry(&unknown), RuleVerdict::Skip));

        let expiring = Resource::new(
            "kv-2",
            ResourceKind::KeyVault,
            json!({ "keys_without_expiry": 0 }),
        );
        assert!(matches!(keyvault_key_expiry(&expiring), RuleVerdict::Pass(_)));

        let open_ended = Resource::new(
            "kv-3",
            ResourceKind::KeyVault,
            json!({ "keys_without_expiry": 2 }),
        );
        assert!(matches!(keyvault_key_expiry(&open_ended), RuleVerdict::Fail(_)));
    }

    #[test]
    fn sql_public_access_requires_both_gates_closed() {
        let closed = Resource::new(
            "sql-1",
            ResourceKind::SqlServer,
            json!({ "public_network_access": false, "open_firewall_rule": false }),
        );
        assert!(matches!(sql_public_access(&closed), RuleVerdict::Pass(_)));

        let firewall_hole = Resource::new(
            "sql-2",
            ResourceKind::SqlServer,
            json!({ "public_network_access": false, "open_firewall_rule": true }),
        );
        assert!(matches!(sql_public_access(&firewall_hole), RuleVerdict::Fail(_)));
    }
}
