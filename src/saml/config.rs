//! Per-provider SAML handler configuration.

use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;

/// Comparison applied to the requested authentication context classes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthnContextComparison {
    Exact,
    #[default]
    Minimum,
    Maximum,
    Better,
}

impl fmt::Display for AuthnContextComparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthnContextComparison::Exact => write!(f, "exact"),
            AuthnContextComparison::Minimum => write!(f, "minimum"),
            AuthnContextComparison::Maximum => write!(f, "maximum"),
            AuthnContextComparison::Better => write!(f, "better"),
        }
    }
}

/// SAML identity provider settings for one claim provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SamlHandlerConfig {
    /// Issuer written into outgoing requests (defaults to the bridge identifier).
    #[serde(default)]
    pub issuer: Option<String>,

    /// IdP metadata URL. When set, the SSO endpoint and signing keys are discovered.
    #[serde(default)]
    pub metadata_url: Option<String>,

    /// Trusted signing certificate thumbprints (SHA-1, hex).
    #[serde(default, deserialize_with = "string_or_list", alias = "signing_key_thumbprint")]
    pub signing_key_thumbprints: Vec<String>,

    /// IdP single sign-on endpoint (direct configuration).
    #[serde(default)]
    pub identity_provider_sso_url: Option<String>,

    /// Audience that responses must be restricted to.
    #[serde(default)]
    pub audience_restriction: Option<String>,

    #[serde(default)]
    pub requested_authn_context_comparison: AuthnContextComparison,

    /// Requested authentication context classes, in order.
    /// Accepts a list or a comma-separated string.
    #[serde(default, deserialize_with = "string_or_list")]
    pub authn_context_class_refs: Vec<String>,

    /// Skip TLS certificate validation when fetching metadata.
    #[serde(default)]
    pub ignore_ssl_errors: bool,

    /// Metadata fetch timeout in seconds.
    #[serde(default = "default_metadata_timeout")]
    pub metadata_timeout_secs: u64,
}

fn default_metadata_timeout() -> u64 {
    10
}

impl Default for SamlHandlerConfig {
    fn default() -> Self {
        Self {
            issuer: None,
            metadata_url: None,
            signing_key_thumbprints: Vec::new(),
            identity_provider_sso_url: None,
            audience_restriction: None,
            requested_authn_context_comparison: AuthnContextComparison::default(),
            authn_context_class_refs: Vec::new(),
            ignore_ssl_errors: false,
            metadata_timeout_secs: default_metadata_timeout(),
        }
    }
}

impl SamlHandlerConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.metadata_timeout_secs == 0 {
            return Err("metadata_timeout_secs must be positive".to_string());
        }

        if self.metadata_url.is_some() {
            return Ok(());
        }

        if self.identity_provider_sso_url.is_none() {
            return Err(
                "SAML requires either metadata_url or identity_provider_sso_url".to_string(),
            );
        }

        if self.signing_key_thumbprints.iter().all(|t| t.trim().is_empty()) {
            return Err(
                "SAML requires signing_key_thumbprints when metadata_url is not set".to_string(),
            );
        }

        Ok(())
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum StringOrList {
    One(String),
    Many(Vec<String>),
}

fn string_or_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = match StringOrList::deserialize(deserializer)? {
        StringOrList::One(s) => s.split(',').map(str::to_string).collect(),
        StringOrList::Many(v) => v,
    };
    Ok(values
        .into_iter()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .collect())
}
