//! SAML 2.0 protocol handler: redirect-binding requests out, signed POST responses in.

use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::config::{AuthnContextComparison, SamlHandlerConfig};
use super::metadata::IdpMetadata;
use super::request::{AuthnRequest, RequestFormat};
use super::response::{self, SamlDetail};
use super::signature::{self, normalize_thumbprint};
use crate::claims::{claim_types, Claim, ClaimsIdentity};
use crate::config::MultiProtocolIssuer;
use crate::error::{BridgeError, SamlError};
use crate::policy::PolicyScope;
use crate::protocol::{HttpRequest, ProtocolHandler, SignInRedirect, SAML2_PROTOCOL};
use crate::xml::Document;

/// Form field carrying the base64 response.
pub const SAML_RESPONSE_FIELD: &str = "SAMLResponse";

/// Marker the relying party prefixes its return address with in `wctx`.
const RETURN_URL_MARKER: &str = "ru=";

#[derive(Debug, Clone)]
pub struct SamlHandler {
    issuer: String,
    reply_url: String,
    sso_url: String,
    signing_thumbprints: Vec<String>,
    audience_restriction: Option<String>,
    comparison: AuthnContextComparison,
    authn_context_class_refs: Vec<String>,
}

impl SamlHandler {
    /// Build from a directly configured SSO endpoint and thumbprints.
    pub fn new(config: &SamlHandlerConfig, bridge: &MultiProtocolIssuer) -> Result<Self, SamlError> {
        let sso_url = config.identity_provider_sso_url.clone().ok_or_else(|| {
            SamlError::Configuration("identity_provider_sso_url is not configured".to_string())
        })?;
        Self::with_endpoint(config, bridge, sso_url, &config.signing_key_thumbprints)
    }

    /// Build from configuration, fetching IdP metadata when `metadata_url` is set.
    pub async fn discover(
        config: &SamlHandlerConfig,
        bridge: &MultiProtocolIssuer,
    ) -> Result<Self, SamlError> {
        let Some(metadata_url) = &config.metadata_url else {
            return Self::new(config, bridge);
        };

        let metadata = IdpMetadata::fetch(
            metadata_url,
            Duration::from_secs(config.metadata_timeout_secs),
            config.ignore_ssl_errors,
        )
        .await?;
        Self::from_metadata(config, bridge, metadata)
    }

    /// Build from already-fetched metadata, which supplies the SSO endpoint and keys.
    pub fn from_metadata(
        config: &SamlHandlerConfig,
        bridge: &MultiProtocolIssuer,
        metadata: IdpMetadata,
    ) -> Result<Self, SamlError> {
        Self::with_endpoint(config, bridge, metadata.sso_url, &metadata.signing_thumbprints)
    }

    fn with_endpoint(
        config: &SamlHandlerConfig,
        bridge: &MultiProtocolIssuer,
        sso_url: String,
        thumbprints: &[String],
    ) -> Result<Self, SamlError> {
        let signing_thumbprints: Vec<String> = thumbprints
            .iter()
            .map(|t| normalize_thumbprint(t))
            .filter(|t| !t.is_empty())
            .collect();
        if signing_thumbprints.is_empty() {
            return Err(SamlError::Configuration(
                "no trusted signing key thumbprints".to_string(),
            ));
        }

        let issuer = config
            .issuer
            .clone()
            .filter(|i| !i.is_empty())
            .unwrap_or_else(|| bridge.identifier.clone());

        Ok(Self {
            issuer,
            reply_url: bridge.reply_url.clone(),
            sso_url,
            signing_thumbprints,
            audience_restriction: config.audience_restriction.clone().filter(|a| !a.is_empty()),
            comparison: config.requested_authn_context_comparison,
            authn_context_class_refs: config.authn_context_class_refs.clone(),
        })
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    pub fn sso_url(&self) -> &str {
        &self.sso_url
    }

    pub fn signing_thumbprints(&self) -> &[String] {
        &self.signing_thumbprints
    }

    /// A fresh AuthnRequest for this provider.
    pub fn authn_request(&self) -> AuthnRequest {
        AuthnRequest::new(
            self.issuer.clone(),
            self.reply_url.clone(),
            self.audience_restriction.clone(),
            self.comparison,
            &self.authn_context_class_refs,
        )
    }

    /// Redirect carrying the encoded request and the caller's return address.
    pub fn sign_in_redirect(&self, request: &HttpRequest) -> Result<SignInRedirect, SamlError> {
        let authn_request = self.authn_request();
        let encoded = authn_request.encode(RequestFormat::REDIRECT)?;
        let relay_state = return_url(request);
        let relay_state = urlencoding::encode(&relay_state);

        debug!(
            request_id = %authn_request.id,
            sso_url = %self.sso_url,
            "Created SAML AuthnRequest redirect"
        );
        Ok(SignInRedirect::to_endpoint(
            &self.sso_url,
            &[
                ("SAMLRequest", encoded.as_str()),
                ("RelayState", relay_state.as_ref()),
            ],
        ))
    }

    /// Run the verification pipeline against the current time.
    pub fn verify_response(&self, encoded: &str) -> Result<SamlDetail, SamlError> {
        self.verify_response_at(encoded, Utc::now())
    }

    /// Signature, status, extraction, audience, then validity window at `now`.
    /// The first failing stage rejects the response.
    pub fn verify_response_at(
        &self,
        encoded: &str,
        now: DateTime<Utc>,
    ) -> Result<SamlDetail, SamlError> {
        let result = self.run_pipeline(encoded, now);
        if let Err(e) = &result {
            warn!(sso_url = %self.sso_url, error = %e, "SAML response rejected");
        }
        result
    }

    fn run_pipeline(&self, encoded: &str, now: DateTime<Utc>) -> Result<SamlDetail, SamlError> {
        let xml = response::decode_response(encoded)?;
        let doc = Document::parse(&xml)?;

        let verified = signature::verify_signatures(&doc)?;
        let signed = signature::trusted_subtree(&doc, &verified, &self.signing_thumbprints)?;
        debug!("Verified signature successfully");

        response::verify_status(&doc)?;
        debug!("Verified status successfully");

        let detail = response::extract(&doc, signed)?;

        response::verify_audience(&detail, self.audience_restriction.as_deref())?;
        debug!("Verified audience successfully");

        response::verify_window(&detail, now)?;
        debug!("Verified validity window successfully");

        Ok(detail)
    }
}

/// Identity carrying the subject as a single name identifier claim.
pub fn identity_from_detail(detail: &SamlDetail) -> ClaimsIdentity {
    ClaimsIdentity::new(
        detail.issuer.clone(),
        vec![Claim::new(
            claim_types::NAME_IDENTIFIER,
            detail.subject_name_id.clone(),
            detail.issuer.clone(),
        )],
    )
}

/// The `wctx` return address without its `ru=` marker, ending in `/`.
///
/// Read from the URL the client used, as seen through a TLS-terminating
/// load balancer.
fn return_url(request: &HttpRequest) -> String {
    let url = request.effective_url();
    let Some(context) = url
        .query_pairs()
        .find(|(name, _)| name == "wctx")
        .map(|(_, value)| value.into_owned())
    else {
        return String::new();
    };
    let mut url = context
        .strip_prefix(RETURN_URL_MARKER)
        .unwrap_or(&context)
        .to_string();
    if !url.is_empty() && !url.ends_with('/') {
        url.push('/');
    }
    url
}

impl ProtocolHandler for SamlHandler {
    fn protocol(&self) -> &str {
        SAML2_PROTOCOL
    }

    fn process_sign_in_request(
        &self,
        scope: &PolicyScope,
        request: &HttpRequest,
    ) -> Result<SignInRedirect, BridgeError> {
        debug!(scope = %scope.uri, "Processing SAML sign-in request");
        Ok(self.sign_in_redirect(request)?)
    }

    fn process_sign_in_response(
        &self,
        realm: &str,
        _original_url: &str,
        request: &HttpRequest,
    ) -> Result<ClaimsIdentity, BridgeError> {
        let encoded = request.form(SAML_RESPONSE_FIELD).ok_or_else(|| {
            BridgeError::MissingContext(format!("{} form field", SAML_RESPONSE_FIELD))
        })?;

        let detail = self.verify_response(encoded)?;
        info!(
            realm = %realm,
            issuer = %detail.issuer,
            subject = %detail.subject_name_id,
            "SAML response accepted"
        );
        Ok(identity_from_detail(&detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::saml::request::decode_message;
    use crate::saml::testing::{ResponseFixture, IDP_THUMBPRINT, SIGNED_RESPONSE};
    use chrono::Duration as ChronoDuration;
    use url::Url;

    fn bridge() -> MultiProtocolIssuer {
        MultiProtocolIssuer {
            identifier: "https://bridge.example.com/".to_string(),
            reply_url: "https://bridge.example.com/authn/saml".to_string(),
        }
    }

    fn config() -> SamlHandlerConfig {
        SamlHandlerConfig {
            identity_provider_sso_url: Some("https://idp.example.test/sso".to_string()),
            signing_key_thumbprints: vec![IDP_THUMBPRINT.to_uppercase()],
            audience_restriction: Some("https://bridge.example.com/".to_string()),
            ..Default::default()
        }
    }

    fn handler() -> SamlHandler {
        SamlHandler::new(&config(), &bridge()).unwrap()
    }

    fn post(encoded: String) -> HttpRequest {
        HttpRequest::parse("https://bridge.example.com/authn/saml")
            .unwrap()
            .with_form_field(SAML_RESPONSE_FIELD, encoded)
    }

    #[test]
    fn test_issuer_defaults_to_bridge_identifier() {
        let handler = handler();
        assert_eq!(handler.issuer(), "https://bridge.example.com/");
        assert_eq!(handler.signing_thumbprints(), &[IDP_THUMBPRINT.to_string()]);

        let named = SamlHandler::new(
            &SamlHandlerConfig {
                issuer: Some("urn:custom".to_string()),
                ..config()
            },
            &bridge(),
        )
        .unwrap();
        assert_eq!(named.issuer(), "urn:custom");
    }

    #[test]
    fn test_new_requires_direct_configuration() {
        let metadata_only = SamlHandlerConfig {
            metadata_url: Some("https://idp.example.test/metadata".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            SamlHandler::new(&metadata_only, &bridge()),
            Err(SamlError::Configuration(_))
        ));
    }

    #[test]
    fn test_from_metadata() {
        let metadata = IdpMetadata {
            entity_id: None,
            sso_url: "https://idp.example.test/redirect?tenant=1".to_string(),
            signing_thumbprints: vec![IDP_THUMBPRINT.to_string()],
        };
        let handler = SamlHandler::from_metadata(&SamlHandlerConfig::default(), &bridge(), metadata)
            .unwrap();
        assert_eq!(handler.sso_url(), "https://idp.example.test/redirect?tenant=1");

        let request = HttpRequest::parse("https://bridge.example.com/").unwrap();
        let redirect = handler.sign_in_redirect(&request).unwrap();
        assert!(redirect
            .location
            .starts_with("https://idp.example.test/redirect?tenant=1&SAMLRequest="));
    }

    #[test]
    fn test_sign_in_redirect() {
        let handler = handler();
        let request = HttpRequest::parse(
            "https://bridge.example.com/authn?wa=wsignin1.0&wctx=ru%3Dhttps%3A%2F%2Fapp.example.com%2Fhome",
        )
        .unwrap();
        let redirect = handler
            .process_sign_in_request(&PolicyScope::new("http://localhost/1"), &request)
            .unwrap();

        let location = Url::parse(&redirect.location).unwrap();
        assert_eq!(location.host_str(), Some("idp.example.test"));
        assert_eq!(location.path(), "/sso");

        let params: Vec<(String, String)> = location.query_pairs().into_owned().collect();
        assert_eq!(params[0].0, "SAMLRequest");
        assert_eq!(params[1], ("RelayState".to_string(), "https://app.example.com/home/".to_string()));

        let xml = decode_message(&params[0].1, RequestFormat::BASE64 | RequestFormat::COMPRESSED)
            .unwrap();
        let doc = Document::parse(&xml).unwrap();
        assert_eq!(
            doc.attribute(doc.root(), "AssertionConsumerServiceURL"),
            Some("https://bridge.example.com/authn/saml")
        );
        assert_eq!(
            doc.text(doc.child(doc.root(), "Issuer").unwrap()),
            "https://bridge.example.com/"
        );
    }

    #[test]
    fn test_return_url() {
        let without = HttpRequest::parse("https://bridge.example.com/authn").unwrap();
        assert_eq!(return_url(&without), "");

        let with_slash =
            HttpRequest::parse("https://bridge.example.com/authn?wctx=ru%3Dhttps%3A%2F%2Fapp%2F")
                .unwrap();
        assert_eq!(return_url(&with_slash), "https://app/");
    }

    #[test]
    fn test_return_url_behind_load_balancer() {
        let request = HttpRequest::parse(
            "http://bridge.internal:8080/authn?wa=wsignin1.0&wctx=ru%3Dhttps%3A%2F%2Fapp.example.com%2Fhome",
        )
        .unwrap()
        .with_header("X-Forwarded-Proto", "https");
        assert_eq!(
            request.effective_url().as_str(),
            "https://bridge.internal/authn?wa=wsignin1.0&wctx=ru%3Dhttps%3A%2F%2Fapp.example.com%2Fhome"
        );
        assert_eq!(return_url(&request), "https://app.example.com/home/");

        let redirect = handler().sign_in_redirect(&request).unwrap();
        assert!(redirect
            .location
            .ends_with("&RelayState=https%3A%2F%2Fapp.example.com%2Fhome%2F"));
    }

    #[test]
    fn test_accepts_valid_response() {
        let handler = handler();
        let identity = handler
            .process_sign_in_response(
                "http://localhost/1",
                "",
                &post(ResponseFixture::default().encoded()),
            )
            .unwrap();

        assert_eq!(identity.authentication_type, "https://idp.example.test");
        assert_eq!(identity.claims.len(), 1);
        let claim = &identity.claims[0];
        assert_eq!(claim.claim_type, claim_types::NAME_IDENTIFIER);
        assert_eq!(claim.value, "alice@example.test");
        assert_eq!(claim.issuer, "https://idp.example.test");
    }

    #[test]
    fn test_rejects_untrusted_signer() {
        let handler = SamlHandler::new(
            &SamlHandlerConfig {
                signing_key_thumbprints: vec!["00".repeat(20)],
                ..config()
            },
            &bridge(),
        )
        .unwrap();
        assert!(matches!(
            handler.verify_response(&ResponseFixture::default().encoded()),
            Err(SamlError::NoTrustedSigner)
        ));
    }

    #[test]
    fn test_rejects_unsigned_response() {
        let unsigned = ResponseFixture::default().unsigned_xml();
        let encoded = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            unsigned,
        );
        assert!(matches!(
            handler().verify_response(&encoded),
            Err(SamlError::NoTrustedSigner)
        ));
    }

    #[test]
    fn test_rejects_failed_status_even_when_signed() {
        let fixture = ResponseFixture {
            status: "urn:oasis:names:tc:SAML:2.0:status:Responder".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            handler().verify_response(&fixture.encoded()),
            Err(SamlError::StatusNotSuccess { .. })
        ));
    }

    #[test]
    fn test_rejects_audience_mismatch() {
        let fixture = ResponseFixture {
            audiences: vec!["https://other.example.com/".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            handler().verify_response(&fixture.encoded()),
            Err(SamlError::AudienceMismatch { .. })
        ));
    }

    #[test]
    fn test_validity_window() {
        let now = Utc::now();
        let fixture = ResponseFixture {
            not_before: Some(now),
            not_on_or_after: Some(now + ChronoDuration::minutes(1)),
            ..Default::default()
        };
        let encoded = fixture.encoded();
        let handler = handler();

        assert!(handler
            .verify_response_at(&encoded, now - ChronoDuration::seconds(4))
            .is_ok());
        assert!(matches!(
            handler.verify_response_at(&encoded, now - ChronoDuration::seconds(7)),
            Err(SamlError::OutsideValidityWindow)
        ));
        assert!(matches!(
            handler.verify_response_at(&encoded, now + ChronoDuration::minutes(2)),
            Err(SamlError::OutsideValidityWindow)
        ));
    }

    #[test]
    fn test_externally_signed_response() {
        let encoded = base64::Engine::encode(
            &base64::engine::general_purpose::STANDARD,
            SIGNED_RESPONSE,
        );
        let inside = "2024-03-01T10:01:00Z".parse::<DateTime<Utc>>().unwrap();

        let detail = handler().verify_response_at(&encoded, inside).unwrap();
        assert_eq!(detail.issuer, "https://idp.example.test");
        assert_eq!(detail.subject_name_id, "alice@example.test");
        assert_eq!(detail.audience_restrictions, vec!["https://bridge.example.com/"]);

        assert!(matches!(
            handler().verify_response_at(&encoded, inside + ChronoDuration::hours(1)),
            Err(SamlError::OutsideValidityWindow)
        ));
    }

    #[test]
    fn test_missing_response_field() {
        let request = HttpRequest::parse("https://bridge.example.com/authn/saml").unwrap();
        assert!(matches!(
            handler().process_sign_in_response("http://localhost/1", "", &request),
            Err(BridgeError::MissingContext(_))
        ));
    }

    #[test]
    fn test_malformed_response() {
        assert!(matches!(
            handler().verify_response("!!!"),
            Err(SamlError::Encoding(_))
        ));
        let encoded = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, "<a>");
        assert!(matches!(
            handler().verify_response(&encoded),
            Err(SamlError::MalformedResponse(_))
        ));
    }
}
