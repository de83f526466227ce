//! Outbound AuthnRequest construction and redirect-binding transport encoding.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use std::io::{Read, Write};
use std::ops::BitOr;

use super::config::AuthnContextComparison;
use crate::error::SamlError;

pub const PROTOCOL_NS: &str = "urn:oasis:names:tc:SAML:2.0:protocol";
pub const ASSERTION_NS: &str = "urn:oasis:names:tc:SAML:2.0:assertion";
pub const HTTP_POST_BINDING: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-POST";
pub const HTTP_REDIRECT_BINDING: &str = "urn:oasis:names:tc:SAML:2.0:bindings:HTTP-Redirect";
pub const NAMEID_UNSPECIFIED: &str = "urn:oasis:names:tc:SAML:1.1:nameid-format:unspecified";

/// Context classes requested when none are configured.
pub const DEFAULT_AUTHN_CONTEXT_CLASS_REFS: &[&str] = &[
    "urn:oasis:names:tc:SAML:2.0:ac:classes:unspecified",
    "urn:oasis:names:tc:SAML:2.0:ac:classes:Password",
    "urn:oasis:names:tc:SAML:2.0:ac:classes:PasswordProtectedTransport",
    "urn:oasis:names:tc:SAML:2.0:ac:classes:Kerberos",
    "urn:federation:authentication:windows",
];

/// Transport steps applied to a serialized request, in the fixed order
/// compress, base64, URL-encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RequestFormat(u8);

impl RequestFormat {
    pub const NONE: RequestFormat = RequestFormat(0);
    pub const BASE64: RequestFormat = RequestFormat(1);
    pub const COMPRESSED: RequestFormat = RequestFormat(2);
    pub const URL_ENCODE: RequestFormat = RequestFormat(4);

    /// The redirect-binding format.
    pub const REDIRECT: RequestFormat = RequestFormat(1 | 2 | 4);

    pub fn contains(self, other: RequestFormat) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl BitOr for RequestFormat {
    type Output = RequestFormat;

    fn bitor(self, rhs: RequestFormat) -> RequestFormat {
        RequestFormat(self.0 | rhs.0)
    }
}

#[derive(Debug, Clone)]
pub struct AuthnRequest {
    pub id: String,
    pub issue_instant: DateTime<Utc>,
    pub issuer: String,
    pub assertion_consumer_service_url: String,
    pub audience_restriction: Option<String>,
    pub comparison: AuthnContextComparison,
    pub authn_context_class_refs: Vec<String>,
}

impl AuthnRequest {
    /// New request with a fresh ID and the current instant.
    ///
    /// An empty `authn_context_class_refs` falls back to
    /// [`DEFAULT_AUTHN_CONTEXT_CLASS_REFS`].
    pub fn new(
        issuer: impl Into<String>,
        assertion_consumer_service_url: impl Into<String>,
        audience_restriction: Option<String>,
        comparison: AuthnContextComparison,
        authn_context_class_refs: &[String],
    ) -> Self {
        let authn_context_class_refs = if authn_context_class_refs.is_empty() {
            DEFAULT_AUTHN_CONTEXT_CLASS_REFS
                .iter()
                .map(|s| s.to_string())
                .collect()
        } else {
            authn_context_class_refs.to_vec()
        };

        Self {
            id: format!("_{}", uuid::Uuid::new_v4()),
            issue_instant: Utc::now(),
            issuer: issuer.into(),
            assertion_consumer_service_url: assertion_consumer_service_url.into(),
            audience_restriction,
            comparison,
            authn_context_class_refs,
        }
    }

    pub fn to_xml(&self) -> String {
        let conditions = match &self.audience_restriction {
            Some(audience) => format!(
                "<saml:Conditions><saml:AudienceRestriction><saml:Audience>{}</saml:Audience></saml:AudienceRestriction></saml:Conditions>",
                escape(audience)
            ),
            None => String::new(),
        };

        let class_refs: String = self
            .authn_context_class_refs
            .iter()
            .map(|r| format!("<saml:AuthnContextClassRef>{}</saml:AuthnContextClassRef>", escape(r)))
            .collect();

        format!(
            concat!(
                r#"<samlp:AuthnRequest xmlns:samlp="{protocol}" xmlns:saml="{assertion}" "#,
                r#"ID="{id}" Version="2.0" IssueInstant="{instant}" "#,
                r#"ProtocolBinding="{binding}" AssertionConsumerServiceURL="{acs}">"#,
                "<saml:Issuer>{issuer}</saml:Issuer>",
                r#"<samlp:NameIDPolicy Format="{nameid}" AllowCreate="true"/>"#,
                "{conditions}",
                r#"<samlp:RequestedAuthnContext Comparison="{comparison}">{class_refs}</samlp:RequestedAuthnContext>"#,
                "</samlp:AuthnRequest>"
            ),
            protocol = PROTOCOL_NS,
            assertion = ASSERTION_NS,
            id = self.id,
            instant = self.issue_instant.format("%Y-%m-%dT%H:%M:%SZ"),
            binding = HTTP_POST_BINDING,
            acs = escape(&self.assertion_consumer_service_url),
            issuer = escape(&self.issuer),
            conditions = conditions,
            nameid = NAMEID_UNSPECIFIED,
            comparison = self.comparison,
            class_refs = class_refs,
        )
    }

    /// Serialize and apply the transport steps selected by `format`.
    pub fn encode(&self, format: RequestFormat) -> Result<String, SamlError> {
        encode_message(&self.to_xml(), format)
    }
}

/// Apply compress, base64 and URL-encode steps to a serialized message.
pub fn encode_message(xml: &str, format: RequestFormat) -> Result<String, SamlError> {
    if format.contains(RequestFormat::COMPRESSED) && !format.contains(RequestFormat::BASE64) {
        return Err(SamlError::Encoding(
            "compressed requests must also be base64 encoded".to_string(),
        ));
    }

    let mut bytes = xml.as_bytes().to_vec();
    if format.contains(RequestFormat::COMPRESSED) {
        let mut encoder =
            flate2::write::DeflateEncoder::new(Vec::new(), flate2::Compression::default());
        encoder
            .write_all(&bytes)
            .map_err(|e| SamlError::Encoding(e.to_string()))?;
        bytes = encoder
            .finish()
            .map_err(|e| SamlError::Encoding(e.to_string()))?;
    }

    let mut text = if format.contains(RequestFormat::BASE64) {
        BASE64.encode(&bytes)
    } else {
        xml.to_string()
    };

    if format.contains(RequestFormat::URL_ENCODE) {
        text = urlencoding::encode(&text).into_owned();
    }
    Ok(text)
}

/// Reverse [`encode_message`]: URL-decode, base64-decode and inflate as `format` says.
pub fn decode_message(encoded: &str, format: RequestFormat) -> Result<String, SamlError> {
    let text = if format.contains(RequestFormat::URL_ENCODE) {
        urlencoding::decode(encoded)
            .map_err(|e| SamlError::Encoding(e.to_string()))?
            .into_owned()
    } else {
        encoded.to_string()
    };

    if !format.contains(RequestFormat::BASE64) {
        if format.contains(RequestFormat::COMPRESSED) {
            return Err(SamlError::Encoding(
                "compressed requests must also be base64 encoded".to_string(),
            ));
        }
        return Ok(text);
    }

    let bytes = BASE64
        .decode(text.trim())
        .map_err(|e| SamlError::Encoding(e.to_string()))?;

    let bytes = if format.contains(RequestFormat::COMPRESSED) {
        let mut inflated = Vec::new();
        flate2::read::DeflateDecoder::new(bytes.as_slice())
            .read_to_end(&mut inflated)
            .map_err(|e| SamlError::Encoding(e.to_string()))?;
        inflated
    } else {
        bytes
    };

    String::from_utf8(bytes).map_err(|e| SamlError::Encoding(e.to_string()))
}

fn escape(value: &str) -> std::borrow::Cow<'_, str> {
    quick_xml::escape::escape(value)
}
