//! Enveloped XML signature verification and signer certificate thumbprints.
//!
//! Each `Signature` element must carry exactly one `Reference` pointing at the
//! element that encloses it. The reference is digested after the declared
//! transforms, `SignedInfo` is canonicalized and checked against the public
//! key of the embedded X.509 certificate, and the certificate's SHA-1
//! thumbprint is reported so the caller can decide whether the signer is
//! trusted.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use ring::{digest, signature};
use std::collections::HashSet;
use tracing::debug;
use x509_parser::oid_registry::{OID_KEY_TYPE_EC_PUBLIC_KEY, OID_PKCS1_RSAENCRYPTION};

use crate::error::SamlError;
use crate::xml::c14n::{self, Algorithm};
use crate::xml::{Document, NodeId, ID_ATTRIBUTES};

pub const DSIG_NS: &str = "http://www.w3.org/2000/09/xmldsig#";
pub const ENVELOPED_SIGNATURE: &str = "http://www.w3.org/2000/09/xmldsig#enveloped-signature";

pub const DIGEST_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#sha1";
pub const DIGEST_SHA256: &str = "http://www.w3.org/2001/04/xmlenc#sha256";
pub const DIGEST_SHA384: &str = "http://www.w3.org/2001/04/xmldsig-more#sha384";
pub const DIGEST_SHA512: &str = "http://www.w3.org/2001/04/xmlenc#sha512";

pub const RSA_SHA1: &str = "http://www.w3.org/2000/09/xmldsig#rsa-sha1";
pub const RSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha256";
pub const RSA_SHA384: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha384";
pub const RSA_SHA512: &str = "http://www.w3.org/2001/04/xmldsig-more#rsa-sha512";
pub const ECDSA_SHA256: &str = "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha256";
pub const ECDSA_SHA384: &str = "http://www.w3.org/2001/04/xmldsig-more#ecdsa-sha384";

/// A signature that verified cryptographically.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSignature {
    /// The element the signature covers (its parent).
    pub signed_element: NodeId,
    /// Normalized SHA-1 thumbprint of the signing certificate.
    pub thumbprint: String,
}

#[derive(Clone, Copy)]
enum KeyType {
    Rsa,
    Ec,
}

fn invalid(element: impl Into<String>, reason: impl Into<String>) -> SamlError {
    SamlError::SignatureInvalid {
        element: element.into(),
        reason: reason.into(),
    }
}

/// Lowercase hex with `:` separators and whitespace removed.
pub fn normalize_thumbprint(thumbprint: &str) -> String {
    thumbprint
        .chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .map(|c| c.to_ascii_lowercase())
        .collect()
}

/// SHA-1 thumbprint of a DER certificate, lowercase hex.
pub fn certificate_thumbprint(der: &[u8]) -> String {
    hex::encode(digest::digest(&digest::SHA1_FOR_LEGACY_USE_ONLY, der))
}

/// Verify every `Signature` element in the document.
///
/// Any signature that fails is fatal. An empty result means the document
/// carried no signature at all.
pub fn verify_signatures(doc: &Document) -> Result<Vec<VerifiedSignature>, SamlError> {
    check_unique_ids(doc)?;

    doc.find_all(doc.root(), "Signature")
        .into_iter()
        .map(|sig| verify_signature(doc, sig))
        .collect()
}

/// Pick the subtree covered by a trusted signer: the root when it is
/// trusted-signed, otherwise the first trusted-signed element.
pub fn trusted_subtree(
    doc: &Document,
    verified: &[VerifiedSignature],
    trusted_thumbprints: &[String],
) -> Result<NodeId, SamlError> {
    let trusted: HashSet<String> = trusted_thumbprints
        .iter()
        .map(|t| normalize_thumbprint(t))
        .collect();

    let mut signed: Vec<NodeId> = verified
        .iter()
        .filter(|v| trusted.contains(&v.thumbprint))
        .map(|v| v.signed_element)
        .collect();
    signed.sort_unstable();

    if signed.contains(&doc.root()) {
        return Ok(doc.root());
    }
    signed.first().copied().ok_or(SamlError::NoTrustedSigner)
}

fn check_unique_ids(doc: &Document) -> Result<(), SamlError> {
    let mut seen = HashSet::new();
    for node in doc.descendants(doc.root()) {
        for name in ID_ATTRIBUTES {
            if let Some(id) = doc.attribute(node, name) {
                if !seen.insert(id.to_string()) {
                    return Err(invalid(
                        element_name(doc, node),
                        format!("ID '{}' is not unique", id),
                    ));
                }
            }
        }
    }
    Ok(())
}

fn element_name(doc: &Document, id: NodeId) -> String {
    doc.element(id)
        .map(|e| e.qualified_name())
        .unwrap_or_default()
}

/// Verify one `Signature` element.
pub fn verify_signature(doc: &Document, sig: NodeId) -> Result<VerifiedSignature, SamlError> {
    let parent = doc
        .parent(sig)
        .ok_or_else(|| invalid("Signature", "signature is the document element"))?;
    let name = element_name(doc, parent);

    if doc.namespace_uri(sig) != Some(DSIG_NS) {
        return Err(invalid(name, "Signature is not in the XML-DSig namespace"));
    }

    let signed_info = doc
        .child(sig, "SignedInfo")
        .ok_or_else(|| invalid(&name, "missing SignedInfo"))?;

    let c14n_method = doc
        .child(signed_info, "CanonicalizationMethod")
        .ok_or_else(|| invalid(&name, "missing CanonicalizationMethod"))?;
    let c14n_algorithm = canonicalization(doc, c14n_method)
        .ok_or_else(|| invalid(&name, "unsupported canonicalization method"))?;

    let signature_method = doc
        .child(signed_info, "SignatureMethod")
        .and_then(|m| doc.attribute(m, "Algorithm"))
        .ok_or_else(|| invalid(&name, "missing SignatureMethod"))?;

    let references: Vec<NodeId> = doc
        .child_elements(signed_info)
        .filter(|&c| doc.local_name(c) == Some("Reference"))
        .collect();
    let [reference] = references.as_slice() else {
        return Err(invalid(&name, "expected exactly one Reference"));
    };

    verify_reference(doc, sig, parent, *reference, &name)?;

    let der = signing_certificate(doc, sig).ok_or_else(|| invalid(&name, "missing X509Certificate"))?;
    let signature_value = doc
        .child(sig, "SignatureValue")
        .map(|v| decode_base64(&doc.text(v)))
        .transpose()
        .map_err(|e| invalid(&name, format!("SignatureValue: {}", e)))?
        .ok_or_else(|| invalid(&name, "missing SignatureValue"))?;

    let canonical_signed_info = c14n::canonicalize(doc, signed_info, None, &c14n_algorithm);
    verify_signature_value(
        &der,
        signature_method,
        canonical_signed_info.as_bytes(),
        &signature_value,
    )
    .map_err(|reason| invalid(&name, reason))?;

    let thumbprint = certificate_thumbprint(&der);
    debug!(element = %name, thumbprint = %thumbprint, "Signature verified");

    Ok(VerifiedSignature {
        signed_element: parent,
        thumbprint,
    })
}

fn canonicalization(doc: &Document, method: NodeId) -> Option<Algorithm> {
    let algorithm = Algorithm::from_uri(doc.attribute(method, "Algorithm")?)?;
    Some(match doc.child(method, "InclusiveNamespaces") {
        Some(inclusive) => {
            algorithm.with_prefix_list(doc.attribute(inclusive, "PrefixList").unwrap_or(""))
        }
        None => algorithm,
    })
}

fn verify_reference(
    doc: &Document,
    sig: NodeId,
    parent: NodeId,
    reference: NodeId,
    name: &str,
) -> Result<(), SamlError> {
    let uri = doc.attribute(reference, "URI").unwrap_or("");
    let target = match uri.strip_prefix('#') {
        Some(id) => match doc.elements_with_id(id).as_slice() {
            [target] => *target,
            [] => return Err(invalid(name, format!("Reference '{}' not found", uri))),
            _ => return Err(invalid(name, format!("Reference '{}' is ambiguous", uri))),
        },
        None if uri.is_empty() => doc.root(),
        None => return Err(invalid(name, format!("unsupported Reference URI '{}'", uri))),
    };
    if target != parent {
        return Err(invalid(
            name,
            "Reference does not point at the signature's parent element",
        ));
    }

    let mut exclude = None;
    let mut algorithm = Algorithm::Inclusive { with_comments: false };
    if let Some(transforms) = doc.child(reference, "Transforms") {
        for transform in doc.child_elements(transforms) {
            match doc.attribute(transform, "Algorithm") {
                Some(ENVELOPED_SIGNATURE) => exclude = Some(sig),
                Some(_) => {
                    algorithm = canonicalization(doc, transform)
                        .ok_or_else(|| invalid(name, "unsupported Transform"))?;
                }
                None => return Err(invalid(name, "Transform without Algorithm")),
            }
        }
    }

    let digest_algorithm = doc
        .child(reference, "DigestMethod")
        .and_then(|m| doc.attribute(m, "Algorithm"))
        .and_then(digest_algorithm)
        .ok_or_else(|| invalid(name, "unsupported DigestMethod"))?;
    let expected = doc
        .child(reference, "DigestValue")
        .map(|v| decode_base64(&doc.text(v)))
        .transpose()
        .map_err(|e| invalid(name, format!("DigestValue: {}", e)))?
        .ok_or_else(|| invalid(name, "missing DigestValue"))?;

    // Same-document references select a node-set without comments.
    let canonical = c14n::canonicalize(doc, target, exclude, &without_comments(algorithm));
    let actual = digest::digest(digest_algorithm, canonical.as_bytes());
    if actual.as_ref() != expected.as_slice() {
        return Err(invalid(name, "digest mismatch"));
    }
    Ok(())
}

fn without_comments(algorithm: Algorithm) -> Algorithm {
    match algorithm {
        Algorithm::Inclusive { .. } => Algorithm::Inclusive {
            with_comments: false,
        },
        Algorithm::Exclusive {
            inclusive_prefixes,
            ..
        } => Algorithm::Exclusive {
            with_comments: false,
            inclusive_prefixes,
        },
    }
}

fn digest_algorithm(uri: &str) -> Option<&'static digest::Algorithm> {
    match uri {
        DIGEST_SHA1 => Some(&digest::SHA1_FOR_LEGACY_USE_ONLY),
        DIGEST_SHA256 => Some(&digest::SHA256),
        DIGEST_SHA384 => Some(&digest::SHA384),
        DIGEST_SHA512 => Some(&digest::SHA512),
        _ => None,
    }
}

fn signature_algorithm(
    uri: &str,
    key_type: KeyType,
) -> Option<&'static dyn signature::VerificationAlgorithm> {
    match (uri, key_type) {
        (RSA_SHA1, KeyType::Rsa) => Some(&signature::RSA_PKCS1_2048_8192_SHA1_FOR_LEGACY_USE_ONLY),
        (RSA_SHA256, KeyType::Rsa) => Some(&signature::RSA_PKCS1_2048_8192_SHA256),
        (RSA_SHA384, KeyType::Rsa) => Some(&signature::RSA_PKCS1_2048_8192_SHA384),
        (RSA_SHA512, KeyType::Rsa) => Some(&signature::RSA_PKCS1_2048_8192_SHA512),
        (ECDSA_SHA256, KeyType::Ec) => Some(&signature::ECDSA_P256_SHA256_FIXED),
        (ECDSA_SHA384, KeyType::Ec) => Some(&signature::ECDSA_P384_SHA384_FIXED),
        _ => None,
    }
}

fn signing_certificate(doc: &Document, sig: NodeId) -> Option<Vec<u8>> {
    let cert = doc.path(sig, &["KeyInfo", "X509Data", "X509Certificate"])?;
    decode_base64(&doc.text(cert)).ok()
}

fn verify_signature_value(
    der: &[u8],
    method: &str,
    message: &[u8],
    signature_value: &[u8],
) -> Result<(), String> {
    let (_, cert) = x509_parser::parse_x509_certificate(der)
        .map_err(|e| format!("invalid certificate: {}", e))?;
    let spki = cert.public_key();

    let key_type = if spki.algorithm.algorithm == OID_PKCS1_RSAENCRYPTION {
        KeyType::Rsa
    } else if spki.algorithm.algorithm == OID_KEY_TYPE_EC_PUBLIC_KEY {
        KeyType::Ec
    } else {
        return Err("unsupported certificate key type".to_string());
    };

    let algorithm = signature_algorithm(method, key_type)
        .ok_or_else(|| format!("unsupported SignatureMethod '{}'", method))?;

    signature::UnparsedPublicKey::new(algorithm, spki.subject_public_key.data.as_ref())
        .verify(message, signature_value)
        .map_err(|_| "signature value does not verify".to_string())
}

/// Base64 text content, ignoring the whitespace signers wrap it with.
fn decode_base64(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    BASE64.decode(compact)
}
