//! Test fixtures: a self-signed IdP certificate and key, and helpers that
//! sign SAML documents with them.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Duration, Utc};
use ring::rand::SystemRandom;
use ring::signature::{self, RsaKeyPair};
use ring::digest;

use super::signature::{DIGEST_SHA256, DSIG_NS, ENVELOPED_SIGNATURE, RSA_SHA256};
use crate::xml::c14n::{self, Algorithm};
use crate::xml::Document;

pub(crate) const IDP_CERT: &str = include_str!("testdata/idp_cert.b64");
pub(crate) const IDP_KEY: &str = include_str!("testdata/idp_key.b64");
pub(crate) const IDP_THUMBPRINT: &str = "f0718adf042f8a1dfd16fc8df9230d1525b9c37d";

/// Response signed outside this crate: openssl RSA-SHA256 over hand-written
/// exclusive canonical forms of the assertion and its SignedInfo. Valid
/// between 2024-03-01T09:55:00Z and 2024-03-01T10:05:00Z.
pub(crate) const SIGNED_RESPONSE: &str = include_str!("testdata/signed_response.xml");

/// Exclusive canonical form (PrefixList "xs") of the signed assertion in
/// [`SIGNED_RESPONSE`], without its signature.
pub(crate) const SIGNED_ASSERTION_C14N: &str =
    include_str!("testdata/signed_response_assertion.c14n");

/// Placeholder replaced by the generated `ds:Signature` element.
pub(crate) const SIGNATURE_MARKER: &str = "<!--SIGNATURE-->";

fn signature_block(reference_id: &str, digest_value: &str, signature_value: &str) -> String {
    format!(
        concat!(
            r#"<ds:Signature xmlns:ds="{dsig}"><ds:SignedInfo>"#,
            r#"<ds:CanonicalizationMethod Algorithm="{exc}"/>"#,
            r#"<ds:SignatureMethod Algorithm="{rsa}"/>"#,
            r##"<ds:Reference URI="#{id}"><ds:Transforms>"##,
            r#"<ds:Transform Algorithm="{enveloped}"/><ds:Transform Algorithm="{exc}"/>"#,
            r#"</ds:Transforms><ds:DigestMethod Algorithm="{sha256}"/>"#,
            "<ds:DigestValue>{digest}</ds:DigestValue></ds:Reference></ds:SignedInfo>",
            "<ds:SignatureValue>{signature}</ds:SignatureValue>",
            "<ds:KeyInfo><ds:X509Data><ds:X509Certificate>{cert}</ds:X509Certificate></ds:X509Data></ds:KeyInfo>",
            "</ds:Signature>"
        ),
        dsig = DSIG_NS,
        exc = c14n::EXC_C14N,
        rsa = RSA_SHA256,
        id = reference_id,
        enveloped = ENVELOPED_SIGNATURE,
        sha256 = DIGEST_SHA256,
        digest = digest_value,
        signature = signature_value,
        cert = IDP_CERT.trim(),
    )
}

/// Replace [`SIGNATURE_MARKER`] with an RSA-SHA256 signature over the element
/// whose ID is `reference_id`.
pub(crate) fn sign(template: &str, reference_id: &str) -> String {
    let exclusive = Algorithm::from_uri(c14n::EXC_C14N).unwrap();

    let unsigned = template.replace(SIGNATURE_MARKER, &signature_block(reference_id, "", ""));
    let doc = Document::parse(&unsigned).unwrap();
    let target = doc.elements_with_id(reference_id)[0];
    let sig = doc.find_first(doc.root(), "Signature").unwrap();
    let canonical = c14n::canonicalize(&doc, target, Some(sig), &exclusive);
    let digest_value = BASE64.encode(digest::digest(&digest::SHA256, canonical.as_bytes()));

    let digested = template.replace(
        SIGNATURE_MARKER,
        &signature_block(reference_id, &digest_value, ""),
    );
    let doc = Document::parse(&digested).unwrap();
    let signed_info = doc.find_first(doc.root(), "SignedInfo").unwrap();
    let canonical = c14n::canonicalize(&doc, signed_info, None, &exclusive);

    let key = RsaKeyPair::from_pkcs8(&BASE64.decode(IDP_KEY.trim()).unwrap()).unwrap();
    let mut signature_value = vec![0; key.public().modulus_len()];
    key.sign(
        &signature::RSA_PKCS1_SHA256,
        &SystemRandom::new(),
        canonical.as_bytes(),
        &mut signature_value,
    )
    .unwrap();

    template.replace(
        SIGNATURE_MARKER,
        &signature_block(reference_id, &digest_value, &BASE64.encode(signature_value)),
    )
}

/// A SAML response with one assertion, signed on the assertion.
pub(crate) struct ResponseFixture {
    pub issuer: String,
    pub status: String,
    pub name_id: Option<String>,
    pub not_before: Option<DateTime<Utc>>,
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub audiences: Vec<String>,
}

impl Default for ResponseFixture {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            issuer: "https://idp.example.test".to_string(),
            status: "urn:oasis:names:tc:SAML:2.0:status:Success".to_string(),
            name_id: Some("alice@example.test".to_string()),
            not_before: Some(now - Duration::minutes(5)),
            not_on_or_after: Some(now + Duration::minutes(5)),
            audiences: vec!["https://bridge.example.com/".to_string()],
        }
    }
}

fn timestamp(instant: DateTime<Utc>) -> String {
    instant.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string()
}

impl ResponseFixture {
    pub fn unsigned_xml(&self) -> String {
        let mut conditions = String::from("<saml:Conditions");
        if let Some(nb) = self.not_before {
            conditions.push_str(&format!(r#" NotBefore="{}""#, timestamp(nb)));
        }
        if let Some(noa) = self.not_on_or_after {
            conditions.push_str(&format!(r#" NotOnOrAfter="{}""#, timestamp(noa)));
        }
        conditions.push('>');
        if !self.audiences.is_empty() {
            conditions.push_str("<saml:AudienceRestriction>");
            for audience in &self.audiences {
                conditions.push_str(&format!("<saml:Audience>{}</saml:Audience>", audience));
            }
            conditions.push_str("</saml:AudienceRestriction>");
        }
        conditions.push_str("</saml:Conditions>");

        let subject = match &self.name_id {
            Some(name_id) => format!(
                "<saml:Subject><saml:NameID>{}</saml:NameID></saml:Subject>",
                name_id
            ),
            None => "<saml:Subject/>".to_string(),
        };

        format!(
            concat!(
                r#"<samlp:Response xmlns:samlp="urn:oasis:names:tc:SAML:2.0:protocol" ID="_r1" Version="2.0">"#,
                r#"<saml:Issuer xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion">{issuer}</saml:Issuer>"#,
                r#"<samlp:Status><samlp:StatusCode Value="{status}"/></samlp:Status>"#,
                r#"<saml:Assertion xmlns:saml="urn:oasis:names:tc:SAML:2.0:assertion" ID="_a1" Version="2.0">"#,
                "<saml:Issuer>{issuer}</saml:Issuer>{marker}{subject}{conditions}",
                "</saml:Assertion></samlp:Response>"
            ),
            issuer = self.issuer,
            status = self.status,
            marker = SIGNATURE_MARKER,
            subject = subject,
            conditions = conditions,
        )
    }

    pub fn signed_xml(&self) -> String {
        sign(&self.unsigned_xml(), "_a1")
    }

    /// Base64 form as posted in the `SAMLResponse` form field.
    pub fn encoded(&self) -> String {
        BASE64.encode(self.signed_xml())
    }
}
