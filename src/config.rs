//! Bridge configuration: the bridge's own identity, the policy store location
//! and the configured claim providers.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::policy::{FilePolicyRepository, PolicyStore, RedbPolicyRepository};
use crate::saml::SamlHandlerConfig;

/// The identity the bridge presents to identity providers and stamps on
/// re-issued claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MultiProtocolIssuer {
    pub identifier: String,
    /// Where identity providers post their responses.
    pub reply_url: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyBackend {
    #[default]
    File,
    Redb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyStoreConfig {
    #[serde(default)]
    pub backend: PolicyBackend,

    #[serde(default = "default_policy_path")]
    pub path: PathBuf,
}

fn default_policy_path() -> PathBuf {
    PathBuf::from("claims-policy.json")
}

impl Default for PolicyStoreConfig {
    fn default() -> Self {
        Self {
            backend: PolicyBackend::default(),
            path: default_policy_path(),
        }
    }
}

impl PolicyStoreConfig {
    /// Open the configured backend.
    pub fn open(&self) -> Result<PolicyStore> {
        let store = match self.backend {
            PolicyBackend::File => PolicyStore::new(FilePolicyRepository::new(&self.path)),
            PolicyBackend::Redb => PolicyStore::new(
                RedbPolicyRepository::open(&self.path)
                    .with_context(|| format!("Failed to open policy database {:?}", self.path))?,
            ),
        };
        info!(backend = ?self.backend, path = ?self.path, "Policy store opened");
        Ok(store)
    }
}

/// An upstream identity provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClaimProviderConfig {
    pub identifier: String,

    #[serde(default)]
    pub display_name: String,

    /// Protocol handler name, e.g. `saml2`.
    pub protocol: String,

    /// Hidden from home realm discovery; only reachable through IdP-initiated sign-in.
    #[serde(default)]
    pub idp_initiated_only: bool,

    #[serde(default)]
    pub saml: Option<SamlHandlerConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    pub multi_protocol_issuer: MultiProtocolIssuer,

    #[serde(default)]
    pub policy_store: PolicyStoreConfig,

    /// Scope used for IdP-initiated sign-ins.
    #[serde(default)]
    pub default_scope: Option<String>,

    #[serde(default)]
    pub claim_providers: Vec<ClaimProviderConfig>,
}

impl BridgeConfig {
    /// Load and validate a JSON configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let config: BridgeConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        config
            .validate()
            .map_err(|e| anyhow!("Config validation failed: {}", e))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.multi_protocol_issuer.identifier.is_empty() {
            return Err("multi_protocol_issuer.identifier is required".to_string());
        }
        if self.multi_protocol_issuer.reply_url.is_empty() {
            return Err("multi_protocol_issuer.reply_url is required".to_string());
        }

        let mut seen = HashSet::new();
        for provider in &self.claim_providers {
            if provider.identifier.is_empty() {
                return Err("claim provider identifier is required".to_string());
            }
            if !seen.insert(provider.identifier.as_str()) {
                return Err(format!(
                    "claim provider '{}' is configured more than once",
                    provider.identifier
                ));
            }
            if let Some(saml) = &provider.saml {
                saml.validate()
                    .map_err(|e| format!("claim provider '{}': {}", provider.identifier, e))?;
            }
        }

        Ok(())
    }

    pub fn claim_provider(&self, identifier: &str) -> Option<&ClaimProviderConfig> {
        self.claim_providers
            .iter()
            .find(|p| p.identifier == identifier)
    }
}
