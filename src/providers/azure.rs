//! Azure Session and API Client
//!
//! AAD client-credentials token acquisition and Azure Resource Manager
//! listing, normalized into the `Resource` attribute documents the
//! checks evaluate. The credential record's shared shape maps as:
//! `access_key_id` = client id, `secret_access_key` = client secret,
//! `external_id` = tenant id.

use serde_json::{json, Map, Value};
use tracing::debug;

use super::credentials::AuthMethod;
use super::{CloudApi, Resource, ResourceKind};
use crate::scan::error::ApiError;
use crate::scan::types::CloudProvider;

const ARM_ENDPOINT: &str = "https://management.azure.com";
const ARM_SCOPE: &str = "https://management.azure.com/.default";

/// Read-only ARM session bound to one subscription.
pub struct AzureApi {
    http: reqwest::Client,
    subscription_id: String,
    access_token: String,
}

impl AzureApi {
    /// Acquire an ARM token via the AAD client-credentials flow.
    pub async fn connect(
        http: reqwest::Client,
        subscription_id: &str,
        method: &AuthMethod,
    ) -> Result<Self, ApiError> {
        let (client_id, client_secret, tenant_id) = match method {
            AuthMethod::StaticKeys {
                access_key_id,
                secret_access_key,
            } => {
                let tenant = std::env::var("AZURE_TENANT_ID").map_err(|_| {
                    ApiError::AuthRejected(
                        "AZURE_TENANT_ID not set and credential has no tenant".to_string(),
                    )
                })?;
                (access_key_id.clone(), secret_access_key.clone(), tenant)
            }
            AuthMethod::AssumeRole {
                role_arn,
                external_id,
            } => {
                // For Azure records the authoritative pair carries the
                // service principal id and the tenant id.
                let secret = std::env::var("AZURE_CLIENT_SECRET").map_err(|_| {
                    ApiError::AuthRejected("AZURE_CLIENT_SECRET not set".to_string())
                })?;
                (role_arn.clone(), secret, external_id.clone())
            }
            AuthMethod::LegacyEmbeddedRole { .. } => {
                return Err(ApiError::AuthRejected(
                    "legacy embedded role references are AWS-only".to_string(),
                ))
            }
        };

        let token_url = format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            tenant_id
        );
        let response = http
            .post(&token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", client_id.as_str()),
                ("client_secret", client_secret.as_str()),
                ("scope", ARM_SCOPE),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(ApiError::AuthRejected(format!(
                "AAD token request returned {}",
                response.status()
            )));
        }

        let token_body: Value = response
            .json()
            .await
            .map_err(|e| ApiError::Malformed(e.to_string()))?;
        let access_token = token_body["access_token"]
            .as_str()
            .ok_or_else(|| ApiError::Malformed("token response missing access_token".to_string()))?
            .to_string();

        Ok(Self {
            http,
            subscription_id: subscription_id.to_string(),
            access_token,
        })
    }

    /// GET an ARM path under the session's subscription.
    async fn get_json(&self, path: &str, api_version: &str) -> Result<Value, ApiError> {
        let url = format!(
            "{}/subscriptions/{}{}?api-version={}",
            ARM_ENDPOINT,
            urlencoding::encode(&self.subscription_id),
            path,
            api_version
        );

        let response = self
            .http
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ApiError::Throttled(format!("ARM returned {}", status)));
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ApiError::AuthRejected(format!("ARM returned {}", status)));
        }
        if !status.is_success() {
            return Err(ApiError::Malformed(format!("ARM returned {}", status)));
        }

        response
            .json()
            .await
            .map_err(|e| ApiError::Malformed(e.to_string()))
    }

    /// List an ARM resource collection and flatten each item's
    /// `properties` bag into check-facing attributes.
    async fn list_arm(
        &self,
        path: &str,
        api_version: &str,
        kind: ResourceKind,
        normalize: fn(&Value) -> Value,
    ) -> Result<Vec<Resource>, ApiError> {
        let listing = self.get_json(path, api_version).await?;
        let items = listing["value"].as_array().cloned().unwrap_or_default();

        Ok(items
            .iter()
            .filter_map(|item| {
                let name = item.get("name")?.as_str()?;
                let mut resource = Resource::new(name, kind, normalize(item));
                resource.region = item
                    .get("location")
                    .and_then(|l| l.as_str())
                    .map(|l| l.to_string());
                Some(resource)
            })
            .collect())
    }

    async fn list_sql_servers(&self) -> Result<Vec<Resource>, ApiError> {
        let listing = self
            .get_json("/providers/Microsoft.Sql/servers", "2021-11-01")
            .await?;
        let servers = listing["value"].as_array().cloned().unwrap_or_default();

        let mut resources = Vec::with_capacity(servers.len());
        for server in servers {
            let name = match server.get("name").and_then(|n| n.as_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            // The server id carries the resource group segment needed for
            // child resource lookups.
            let id_path = server
                .get("id")
                .and_then(|i| i.as_str())
                .and_then(|id| id.split_once(&format!("/subscriptions/{}", self.subscription_id)))
                .map(|(_, rest)| rest.to_string());

            let mut attrs = Map::new();
            attrs.insert(
                "public_network_access".to_string(),
                json!(
                    server["properties"]["publicNetworkAccess"].as_str() != Some("Disabled")
                ),
            );

            if let Some(base) = id_path {
                match self
                    .get_json(&format!("{}/firewallRules", base), "2021-11-01")
                    .await
                {
                    Ok(rules) => {
                        let open = rules["value"]
                            .as_array()
                            .map(|r| {
                                r.iter().any(|rule| {
                                    rule["properties"]["startIpAddress"].as_str()
                                        == Some("0.0.0.0")
                                })
                            })
                            .unwrap_or(false);
                        attrs.insert("open_firewall_rule".to_string(), json!(open));
                    }
                    Err(ApiError::Throttled(m)) => return Err(ApiError::Throttled(m)),
                    Err(e) => debug!(server = %name, error = %e, "firewall rule lookup failed"),
                }

                match self
                    .get_json(
                        &format!("{}/auditingSettings/default", base),
                        "2021-11-01",
                    )
                    .await
                {
                    Ok(auditing) => {
                        attrs.insert(
                            "auditing_enabled".to_string(),
                            json!(auditing["properties"]["state"].as_str() == Some("Enabled")),
                        );
                    }
                    Err(ApiError::Throttled(m)) => return Err(ApiError::Throttled(m)),
                    Err(e) => debug!(server = %name, error = %e, "auditing lookup failed"),
                }

                // TDE is a per-database setting; the server passes only
                // when every user database has it enabled. No user
                // databases leaves the attribute unset.
                match self
                    .get_json(&format!("{}/databases", base), "2021-11-01")
                    .await
                {
                    Ok(dbs) => {
                        let databases: Vec<String> = dbs["value"]
                            .as_array()
                            .map(|items| {
                                items
                                    .iter()
                                    .filter_map(|db| db.get("name").and_then(|n| n.as_str()))
                                    .filter(|n| *n != "master")
                                    .map(str::to_string)
                                    .collect()
                            })
                            .unwrap_or_default();
                        if !databases.is_empty() {
                            let mut all_encrypted = true;
                            for db in &databases {
                                match self
                                    .get_json(
                                        &format!(
                                            "{}/databases/{}/transparentDataEncryption/current",
                                            base, db
                                        ),
                                        "2021-11-01",
                                    )
                                    .await
                                {
                                    Ok(tde) => {
                                        if tde["properties"]["state"].as_str() != Some("Enabled") {
                                            all_encrypted = false;
                                        }
                                    }
                                    Err(ApiError::Throttled(m)) => {
                                        return Err(ApiError::Throttled(m))
                                    }
                                    Err(e) => {
                                        debug!(server = %name, database = %db, error = %e, "tde lookup failed")
                                    }
                                }
                            }
                            attrs.insert("tde_all_databases".to_string(), json!(all_encrypted));
                        }
                    }
                    Err(ApiError::Throttled(m)) => return Err(ApiError::Throttled(m)),
                    Err(e) => debug!(server = %name, error = %e, "database listing failed"),
                }
            }

            resources.push(Resource::new(&name, ResourceKind::SqlServer, Value::Object(attrs)));
        }
        Ok(resources)
    }

    async fn list_key_vaults(&self) -> Result<Vec<Resource>, ApiError> {
        let listing = self
            .get_json("/providers/Microsoft.KeyVault/vaults", "2023-02-01")
            .await?;
        let vaults = listing["value"].as_array().cloned().unwrap_or_default();

        let mut resources = Vec::with_capacity(vaults.len());
        for vault in vaults {
            let name = match vault.get("name").and_then(|n| n.as_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            let mut attrs = match normalize_key_vault(&vault) {
                Value::Object(map) => map,
                _ => Map::new(),
            };

            let id_path = vault
                .get("id")
                .and_then(|i| i.as_str())
                .and_then(|id| id.split_once(&format!("/subscriptions/{}", self.subscription_id)))
                .map(|(_, rest)| rest.to_string());
            if let Some(base) = id_path {
                match self.get_json(&format!("{}/keys", base), "2023-02-01").await {
                    Ok(keys) => {
                        let without_expiry = keys["value"]
                            .as_array()
                            .map(|items| {
                                items
                                    .iter()
                                    .filter(|k| k["properties"]["attributes"]["exp"].is_null())
                                    .count()
                            })
                            .unwrap_or(0);
                        attrs.insert("keys_without_expiry".to_string(), json!(without_expiry));
                    }
                    Err(ApiError::Throttled(m)) => return Err(ApiError::Throttled(m)),
                    Err(e) => debug!(vault = %name, error = %e, "key listing failed"),
                }
            }

            let mut resource = Resource::new(&name, ResourceKind::KeyVault, Value::Object(attrs));
            resource.region = vault
                .get("location")
                .and_then(|l| l.as_str())
                .map(|l| l.to_string());
            resources.push(resource);
        }
        Ok(resources)
    }

    async fn list_app_services(&self) -> Result<Vec<Resource>, ApiError> {
        let listing = self
            .get_json("/providers/Microsoft.Web/sites", "2022-03-01")
            .await?;
        let sites = listing["value"].as_array().cloned().unwrap_or_default();

        let mut resources = Vec::with_capacity(sites.len());
        for site in sites {
            let name = match site.get("name").and_then(|n| n.as_str()) {
                Some(n) => n.to_string(),
                None => continue,
            };
            let mut attrs = Map::new();
            attrs.insert(
                "https_only".to_string(),
                json!(site["properties"]["httpsOnly"].as_bool().unwrap_or(false)),
            );

            let id_path = site
                .get("id")
                .and_then(|i| i.as_str())
                .and_then(|id| id.split_once(&format!("/subscriptions/{}", self.subscription_id)))
                .map(|(_, rest)| rest.to_string());
            if let Some(base) = id_path {
                match self
                    .get_json(&format!("{}/config/web", base), "2022-03-01")
                    .await
                {
                    Ok(config) => {
                        attrs.insert(
                            "min_tls_version".to_string(),
                            config["properties"]["minTlsVersion"].clone(),
                        );
                    }
                    Err(ApiError::Throttled(m)) => return Err(ApiError::Throttled(m)),
                    Err(e) => debug!(site = %name, error = %e, "site config lookup failed"),
                }
            }

            resources.push(Resource::new(&name, ResourceKind::AppService, Value::Object(attrs)));
        }
        Ok(resources)
    }
}

fn normalize_storage_account(item: &Value) -> Value {
    let props = &item["properties"];
    json!({
        "https_only": props["supportsHttpsTrafficOnly"].as_bool().unwrap_or(false),
        "public_blob_access": props["allowBlobPublicAccess"].as_bool().unwrap_or(true),
        "encryption_enabled": props["encryption"]["services"]["blob"]["enabled"]
            .as_bool()
            .unwrap_or(false),
        "min_tls_version": props["minimumTlsVersion"],
    })
}

fn normalize_nsg(item: &Value) -> Value {
    let rules: Vec<Value> = item["properties"]["securityRules"]
        .as_array()
        .map(|rules| {
            rules
                .iter()
                .map(|rule| {
                    let props = &rule["properties"];
                    json!({
                        "direction": props["direction"],
                        "access": props["access"],
                        "destination_port": props["destinationPortRange"],
                        "source_any": props["sourceAddressPrefix"].as_str()
                            .map(|s| s == "*" || s == "0.0.0.0/0" || s == "Internet")
                            .unwrap_or(false),
                    })
                })
                .collect()
        })
        .unwrap_or_default();
    json!({ "rules": rules })
}

fn normalize_vm(item: &Value) -> Value {
    let props = &item["properties"];
    let os_disk = &props["storageProfile"]["osDisk"];
    json!({
        "encryption_at_host": props["securityProfile"]["encryptionAtHost"]
            .as_bool()
            .unwrap_or(false),
        "managed_disks": os_disk["managedDisk"].is_object(),
        "power_state": props["extended"]["instanceView"]["powerState"]["code"],
    })
}

fn normalize_key_vault(item: &Value) -> Value {
    let props = &item["properties"];
    json!({
        "soft_delete": props["enableSoftDelete"].as_bool().unwrap_or(false),
        "purge_protection": props["enablePurgeProtection"].as_bool().unwrap_or(false),
    })
}

fn normalize_log_profile(item: &Value) -> Value {
    let retention = &item["properties"]["retentionPolicy"];
    json!({
        "retention_enabled": retention["enabled"].as_bool().unwrap_or(false),
        "retention_days": retention["days"].as_i64().unwrap_or(0),
    })
}

#[async_trait::async_trait]
impl CloudApi for AzureApi {
    fn provider(&self) -> CloudProvider {
        CloudProvider::Azure
    }

    fn account_id(&self) -> &str {
        &self.subscription_id
    }

    async fn list(&self, kind: ResourceKind) -> Result<Vec<Resource>, ApiError> {
        match kind {
            ResourceKind::StorageAccount => {
                self.list_arm(
                    "/providers/Microsoft.Storage/storageAccounts",
                    "2023-01-01",
                    kind,
                    normalize_storage_account,
                )
                .await
            }
            ResourceKind::NetworkSecurityGroup => {
                self.list_arm(
                    "/providers/Microsoft.Network/networkSecurityGroups",
                    "2023-05-01",
                    kind,
                    normalize_nsg,
                )
                .await
            }
            ResourceKind::VirtualMachine => {
                self.list_arm(
                    "/providers/Microsoft.Compute/virtualMachines",
                    "2023-07-01",
                    kind,
                    normalize_vm,
                )
                .await
            }
            ResourceKind::KeyVault => self.list_key_vaults().await,
            ResourceKind::LogProfile => {
                self.list_arm(
                    "/providers/Microsoft.Insights/logprofiles",
                    "2016-03-01",
                    kind,
                    normalize_log_profile,
                )
                .await
            }
            ResourceKind::SqlServer => self.list_sql_servers().await,
            ResourceKind::AppService => self.list_app_services().await,
            other => Err(ApiError::Malformed(format!(
                "resource kind {} is not an Azure kind",
                other
            ))),
        }
    }
}
