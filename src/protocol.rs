//! Protocol handler contract and the registry that maps claim providers to handlers.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;
use url::Url;

use crate::claims::ClaimsIdentity;
use crate::config::{BridgeConfig, ClaimProviderConfig, MultiProtocolIssuer};
use crate::error::{BridgeError, SamlError};
use crate::policy::PolicyScope;
use crate::saml::SamlHandler;

/// Protocol name for SAML 2.0 claim providers.
pub const SAML2_PROTOCOL: &str = "saml2";

/// The inbound HTTP request as a handler sees it.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub url: Url,
    /// Keyed by lowercase header name.
    headers: HashMap<String, String>,
    form: HashMap<String, String>,
}

impl HttpRequest {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: HashMap::new(),
            form: HashMap::new(),
        }
    }

    pub fn parse(url: &str) -> Result<Self, url::ParseError> {
        Ok(Self::new(Url::parse(url)?))
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_form_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.form.insert(name.into(), value.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn form(&self, name: &str) -> Option<&str> {
        self.form.get(name).map(String::as_str)
    }

    /// The URL the client used, accounting for a TLS-terminating load balancer.
    ///
    /// `X-Forwarded-Proto: https` or `Front-End-Https: on` switch the scheme to
    /// https on the default port.
    pub fn effective_url(&self) -> Url {
        let forwarded_https = self
            .header("X-Forwarded-Proto")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("https"))
            || self
                .header("Front-End-Https")
                .is_some_and(|v| v.trim().eq_ignore_ascii_case("on"));

        let mut url = self.url.clone();
        if forwarded_https && url.scheme() != "https" {
            // both are special schemes, so these cannot fail
            let _ = url.set_scheme("https");
            let _ = url.set_port(None);
        }
        url
    }
}

/// Where to send the browser to start sign-in at the identity provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignInRedirect {
    pub location: String,
}

impl SignInRedirect {
    /// Append query parameters to `base`, joining with `&` when it already has a query.
    pub fn to_endpoint(base: &str, params: &[(&str, &str)]) -> Self {
        let query: Vec<String> = params
            .iter()
            .map(|(name, value)| format!("{}={}", name, value))
            .collect();
        let separator = if base.contains('?') { '&' } else { '?' };
        Self {
            location: format!("{}{}{}", base, separator, query.join("&")),
        }
    }
}

/// A federation protocol spoken with one claim provider.
pub trait ProtocolHandler: Send + Sync {
    fn protocol(&self) -> &str;

    /// Build the redirect that starts sign-in at the identity provider.
    fn process_sign_in_request(
        &self,
        scope: &PolicyScope,
        request: &HttpRequest,
    ) -> Result<SignInRedirect, BridgeError>;

    /// Verify the identity provider's reply and return the asserted identity.
    fn process_sign_in_response(
        &self,
        realm: &str,
        original_url: &str,
        request: &HttpRequest,
    ) -> Result<ClaimsIdentity, BridgeError>;
}

/// Handlers by claim provider identifier.
#[derive(Default, Clone)]
pub struct ProtocolDiscovery {
    handlers: HashMap<String, Arc<dyn ProtocolHandler>>,
}

impl ProtocolDiscovery {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a handler for every configured claim provider.
    ///
    /// Metadata discovery happens here, once per provider.
    pub async fn from_config(config: &BridgeConfig) -> Result<Self, BridgeError> {
        let mut discovery = Self::new();
        for provider in &config.claim_providers {
            let handler = build_handler(provider, &config.multi_protocol_issuer).await?;
            info!(
                identifier = %provider.identifier,
                protocol = %provider.protocol,
                "Protocol handler ready"
            );
            discovery.register(&provider.identifier, handler);
        }
        Ok(discovery)
    }

    pub fn register(&mut self, identifier: &str, handler: Arc<dyn ProtocolHandler>) {
        self.handlers.insert(identifier.to_string(), handler);
    }

    pub fn handler(&self, identifier: &str) -> Result<Arc<dyn ProtocolHandler>, BridgeError> {
        self.handlers
            .get(identifier)
            .cloned()
            .ok_or_else(|| BridgeError::UnknownIssuer {
                identifier: identifier.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

async fn build_handler(
    provider: &ClaimProviderConfig,
    issuer: &MultiProtocolIssuer,
) -> Result<Arc<dyn ProtocolHandler>, BridgeError> {
    match provider.protocol.to_ascii_lowercase().as_str() {
        SAML2_PROTOCOL | "saml" => {
            let saml = provider.saml.as_ref().ok_or_else(|| {
                SamlError::Configuration(format!(
                    "claim provider '{}' has no saml section",
                    provider.identifier
                ))
            })?;
            Ok(Arc::new(SamlHandler::discover(saml, issuer).await?))
        }
        _ => Err(BridgeError::UnsupportedProtocol {
            protocol: provider.protocol.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_url() {
        let request = HttpRequest::parse("http://bridge.example.com:8080/authn?x=1").unwrap();
        assert_eq!(
            request.effective_url().as_str(),
            "http://bridge.example.com:8080/authn?x=1"
        );

        let forwarded = request.clone().with_header("x-forwarded-proto", "HTTPS");
        assert_eq!(
            forwarded.effective_url().as_str(),
            "https://bridge.example.com/authn?x=1"
        );

        let front_end = request.with_header("Front-End-Https", "on");
        assert_eq!(
            front_end.effective_url().as_str(),
            "https://bridge.example.com/authn?x=1"
        );
    }

    #[test]
    fn test_headers_are_case_insensitive() {
        let request = HttpRequest::parse("https://bridge.example.com/")
            .unwrap()
            .with_header("Content-Type", "text/html");
        assert_eq!(request.header("content-type"), Some("text/html"));
        assert_eq!(request.header("CONTENT-TYPE"), Some("text/html"));
    }

    #[test]
    fn test_redirect_joins_query() {
        let plain = SignInRedirect::to_endpoint("https://idp/sso", &[("a", "1"), ("b", "2")]);
        assert_eq!(plain.location, "https://idp/sso?a=1&b=2");

        let with_query = SignInRedirect::to_endpoint("https://idp/sso?tenant=t", &[("a", "1")]);
        assert_eq!(with_query.location, "https://idp/sso?tenant=t&a=1");
    }

    #[tokio::test]
    async fn test_discovery_from_config() {
        let config: BridgeConfig = serde_json::from_value(serde_json::json!({
            "multi_protocol_issuer": {
                "identifier": "https://bridge.example.com/",
                "reply_url": "https://bridge.example.com/authn/saml"
            },
            "policy_store": { "path": "policy.json" },
            "claim_providers": [{
                "identifier": "urn:idp",
                "display_name": "IdP",
                "protocol": "saml2",
                "saml": {
                    "identity_provider_sso_url": "https://idp.example.test/sso",
                    "signing_key_thumbprints": ["ab"]
                }
            }]
        }))
        .unwrap();

        let discovery = ProtocolDiscovery::from_config(&config).await.unwrap();
        assert_eq!(discovery.len(), 1);
        assert_eq!(discovery.handler("urn:idp").unwrap().protocol(), SAML2_PROTOCOL);
        assert!(matches!(
            discovery.handler("urn:other"),
            Err(BridgeError::UnknownIssuer { .. })
        ));
    }

    #[tokio::test]
    async fn test_unsupported_protocol() {
        let provider = ClaimProviderConfig {
            identifier: "urn:live".to_string(),
            display_name: "Live".to_string(),
            protocol: "windowslive".to_string(),
            idp_initiated_only: false,
            saml: None,
        };
        let issuer = MultiProtocolIssuer {
            identifier: "https://bridge.example.com/".to_string(),
            reply_url: "https://bridge.example.com/authn".to_string(),
        };
        assert!(matches!(
            build_handler(&provider, &issuer).await,
            Err(BridgeError::UnsupportedProtocol { protocol }) if protocol == "windowslive"
        ));

        let saml_without_section = ClaimProviderConfig {
            protocol: "saml2".to_string(),
            ..provider
        };
        assert!(matches!(
            build_handler(&saml_without_section, &issuer).await,
            Err(BridgeError::Saml(SamlError::Configuration(_)))
        ));
    }
}
