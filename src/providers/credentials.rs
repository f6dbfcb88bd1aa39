//! Credential Resolution
//!
//! Picks exactly one auth method from a stored credential record. The
//! selection is a pure function of the record; token acquisition happens
//! later in the session factory.
//!
//! Trust order, first match wins:
//!
//! 1. `role_arn` + `external_id`: the authoritative assume-role pair,
//!    kept current by the account-linking flow.
//! 2. `access_key_id` carrying the legacy `ROLE:` marker, an embedded
//!    role reference that can go stale. Informational fallback only;
//!    it must never win over rule 1.
//! 3. `access_key_id` + `secret_access_key`: static keys.

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::scan::error::ScanError;
use crate::scan::types::CloudProvider;

/// Marker prefix on `access_key_id` indicating it encodes a role ARN
/// instead of a real key id. Legacy; pending deprecation.
pub const LEGACY_ROLE_MARKER: &str = "ROLE:";

/// Organization-scoped record of how to authenticate to one cloud account.
/// For Azure the same shape is reused: `access_key_id` is the client id,
/// `secret_access_key` the client secret, `external_id` the tenant id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudCredential {
    pub organization_id: String,
    pub cloud_account_id: String,
    pub provider: CloudProvider,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub role_arn: Option<String>,
    pub external_id: Option<String>,
    pub is_active: bool,
}

/// The single effective auth method selected for a resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMethod {
    /// Assume-role via the authoritative `role_arn` field.
    AssumeRole {
        role_arn: String,
        external_id: String,
    },
    /// Assume-role via the ARN embedded in the legacy marker. May be
    /// stale; used only when rule 1 does not apply.
    LegacyEmbeddedRole { role_arn: String },
    /// Static long-lived key pair.
    StaticKeys {
        access_key_id: String,
        secret_access_key: String,
    },
}

/// Select the effective auth method for a credential record.
///
/// Pure: the same record always yields the same method. When both the
/// authoritative role pair and a legacy marker are present, the
/// authoritative pair wins even if the embedded ARN differs.
pub fn resolve(credential: &CloudCredential) -> Result<AuthMethod, ScanError> {
    if !credential.is_active {
        return Err(ScanError::CredentialResolution(format!(
            "credential for account {} is disabled",
            credential.cloud_account_id
        )));
    }

    let embedded_role = credential
        .access_key_id
        .as_deref()
        .and_then(|key| key.strip_prefix(LEGACY_ROLE_MARKER))
        .filter(|arn| !arn.is_empty());

    // Rule 1: authoritative assume-role pair.
    if let (Some(role_arn), Some(external_id)) = (
        credential.role_arn.as_deref(),
        credential.external_id.as_deref(),
    ) {
        if !role_arn.is_empty() && !external_id.is_empty() {
            if let Some(embedded) = embedded_role {
                if embedded != role_arn {
                    // The incident record behind this ordering: the stale
                    // embedded ARN once shadowed the linked role.
                    warn!(
                        account = %credential.cloud_account_id,
                        authoritative = role_arn,
                        embedded,
                        "legacy embedded role diverges from linked role; using linked role"
                    );
                }
            }
            return Ok(AuthMethod::AssumeRole {
                role_arn: role_arn.to_string(),
                external_id: external_id.to_string(),
            });
        }
    }

    // Rule 2: legacy marker fallback.
    if let Some(arn) = embedded_role {
        return Ok(AuthMethod::LegacyEmbeddedRole {
            role_arn: arn.to_string(),
        });
    }

    // Rule 3: static keys.
    if let (Some(access_key_id), Some(secret_access_key)) = (
        credential.access_key_id.as_deref(),
        credential.secret_access_key.as_deref(),
    ) {
        if !access_key_id.is_empty() && !secret_access_key.is_empty() {
            return Ok(AuthMethod::StaticKeys {
                access_key_id: access_key_id.to_string(),
                secret_access_key: secret_access_key.to_string(),
            });
        }
    }

    Err(ScanError::CredentialResolution(
        "no usable credential method".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_credential() -> CloudCredential {
        CloudCredential {
            organization_id: "org-1".to_string(),
            cloud_account_id: "111111111111".to_string(),
            provider: CloudProvider::Aws,
            access_key_id: None,
            secret_access_key: None,
            role_arn: None,
            external_id: None,
            is_active: true,
        }
    }

    #[test]
    fn linked_role_beats_stale_embedded_role() {
        // Scenario: the legacy marker encodes a different, stale role.
        let cred = CloudCredential {
            role_arn: Some("arn:aws:iam::111:role/Good".to_string()),
            external_id: Some("x".to_string()),
            access_key_id: Some("ROLE:arn:aws:iam::111:role/Stale".to_string()),
            ..base_credential()
        };

        let method = resolve(&cred).unwrap();
        assert_eq!(
            method,
            AuthMethod::AssumeRole {
                role_arn: "arn:aws:iam::111:role/Good".to_string(),
                external_id: "x".to_string(),
            }
        );
    }

    #[test]
    fn embedded_role_used_when_no_linked_role() {
        let cred = CloudCredential {
            access_key_id: Some("ROLE:arn:aws:iam::111:role/Embedded".to_string()),
            secret_access_key: Some("ignored".to_string()),
            ..base_credential()
        };

        let method = resolve(&cred).unwrap();
        assert_eq!(
            method,
            AuthMethod::LegacyEmbeddedRole {
                role_arn: "arn:aws:iam::111:role/Embedded".to_string(),
            }
        );
    }

    #[test]
    fn static_keys_are_last_resort() {
        let cred = CloudCredential {
            access_key_id: Some("AKIAEXAMPLE".to_string()),
            secret_access_key: Some("secret".to_string()),
            ..base_credential()
        };

        assert_eq!(
            resolve(&cred).unwrap(),
            AuthMethod::StaticKeys {
                access_key_id: "AKIAEXAMPLE".to_string(),
                secret_access_key: "secret".to_string(),
            }
        );
    }

    #[test]
    fn role_without_external_id_falls_through() {
        // Rule 1 requires both fields; a lone role_arn is not enough.
        let cred = CloudCredential {
            role_arn: Some("arn:aws:iam::111:role/Partial".to_string()),
            access_key_id: Some("AKIAEXAMPLE".to_string()),
            secret_access_key: Some("secret".to_string()),
            ..base_credential()
        };

        assert!(matches!(
            resolve(&cred).unwrap(),
            AuthMethod::StaticKeys { .. }
        ));
    }

    #[test]
    fn no_method_is_a_resolution_error() {
        let cred = base_credential();
        assert!(matches!(
            resolve(&cred),
            Err(ScanError::CredentialResolution(_))
        ));
    }

    #[test]
    fn inactive_credential_is_rejected() {
        let cred = CloudCredential {
            is_active: false,
            role_arn: Some("arn:aws:iam::111:role/Good".to_string()),
            external_id: Some("x".to_string()),
            ..base_credential()
        };
        assert!(matches!(
            resolve(&cred),
            Err(ScanError::CredentialResolution(_))
        ));
    }

    #[test]
    fn resolution_is_deterministic() {
        let cred = CloudCredential {
            role_arn: Some("arn:aws:iam::111:role/Good".to_string()),
            external_id: Some("x".to_string()),
            access_key_id: Some("ROLE:arn:aws:iam::111:role/Stale".to_string()),
            ..base_credential()
        };

        let first = resolve(&cred).unwrap();
        for _ in 0..10 {
            assert_eq!(resolve(&cred).unwrap(), first);
        }
    }
}
