//! Identity provider metadata: SSO endpoint and signing certificate discovery.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::time::Duration;
use tracing::{debug, info};

use super::request::HTTP_REDIRECT_BINDING;
use super::signature::certificate_thumbprint;
use crate::error::SamlError;
use crate::xml::Document;

/// What a handler needs from an IdP's metadata document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdpMetadata {
    pub entity_id: Option<String>,
    /// Location of the single HTTP-Redirect `SingleSignOnService`.
    pub sso_url: String,
    /// Lowercase SHA-1 thumbprints of every signing certificate.
    pub signing_thumbprints: Vec<String>,
}

impl IdpMetadata {
    /// Parse an `EntityDescriptor` (or an `EntitiesDescriptor` wrapping one).
    ///
    /// The first `IDPSSODescriptor` is used. Key descriptors with no `use`
    /// attribute count as signing keys.
    pub fn parse(xml: &str) -> Result<Self, SamlError> {
        let doc = Document::parse(xml).map_err(|e| SamlError::Metadata(e.to_string()))?;

        let descriptor = doc
            .find_first(doc.root(), "IDPSSODescriptor")
            .ok_or_else(|| SamlError::Metadata("missing IDPSSODescriptor".to_string()))?;

        let entity_id = doc
            .parent(descriptor)
            .and_then(|entity| doc.attribute(entity, "entityID"))
            .map(str::to_string);

        let redirect_services: Vec<&str> = doc
            .child_elements(descriptor)
            .filter(|&s| doc.local_name(s) == Some("SingleSignOnService"))
            .filter(|&s| doc.attribute(s, "Binding") == Some(HTTP_REDIRECT_BINDING))
            .filter_map(|s| doc.attribute(s, "Location"))
            .collect();
        let sso_url = match redirect_services.as_slice() {
            [location] => location.to_string(),
            [] => {
                return Err(SamlError::Metadata(
                    "no HTTP-Redirect SingleSignOnService".to_string(),
                ))
            }
            _ => {
                return Err(SamlError::Metadata(
                    "more than one HTTP-Redirect SingleSignOnService".to_string(),
                ))
            }
        };

        let mut signing_thumbprints = Vec::new();
        for key in doc.child_elements(descriptor) {
            if doc.local_name(key) != Some("KeyDescriptor") {
                continue;
            }
            if !matches!(doc.attribute(key, "use"), None | Some("signing")) {
                continue;
            }
            let Some(cert) = doc.path(key, &["KeyInfo", "X509Data", "X509Certificate"]) else {
                continue;
            };
            let compact: String = doc.text(cert).chars().filter(|c| !c.is_whitespace()).collect();
            let der = BASE64
                .decode(compact)
                .map_err(|e| SamlError::Metadata(format!("invalid X509Certificate: {}", e)))?;
            signing_thumbprints.push(certificate_thumbprint(&der));
        }

        debug!(
            sso_url = %sso_url,
            keys = signing_thumbprints.len(),
            "Parsed IdP metadata"
        );

        Ok(Self {
            entity_id,
            sso_url,
            signing_thumbprints,
        })
    }

    /// Fetch and parse metadata from `url`.
    pub async fn fetch(
        url: &str,
        timeout: Duration,
        accept_invalid_certs: bool,
    ) -> Result<Self, SamlError> {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(|e| SamlError::Metadata(format!("failed to create HTTP client: {}", e)))?;

        debug!(url = %url, "Fetching IdP metadata");
        let response = http_client
            .get(url)
            .send()
            .await
            .map_err(|e| SamlError::Metadata(format!("failed to fetch metadata: {}", e)))?;

        if !response.status().is_success() {
            return Err(SamlError::Metadata(format!(
                "metadata endpoint returned status {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| SamlError::Metadata(format!("failed to read metadata: {}", e)))?;
        let metadata = Self::parse(&body)?;

        info!(
            url = %url,
            sso_url = %metadata.sso_url,
            thumbprints = ?metadata.signing_thumbprints,
            "IdP metadata loaded"
        );
        Ok(metadata)
    }
}
