//! Inbound SAML response checks: status, detail extraction, audience and
//! validity window.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Duration, NaiveDateTime, SubsecRound, TimeZone, Utc};
use tracing::debug;

use crate::error::SamlError;
use crate::xml::{Document, NodeId};

/// Suffix every successful top-level status code carries.
pub const STATUS_SUCCESS_SUFFIX: &str = "status:Success";

/// Tolerated clock skew before `NotBefore`, in seconds.
pub const CLOCK_SKEW_SECS: i64 = 5;

/// Fields read from a verified response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SamlDetail {
    pub issuer: String,
    pub subject_name_id: String,
    /// `None` means unbounded.
    pub not_before: Option<DateTime<Utc>>,
    /// `None` means unbounded.
    pub not_on_or_after: Option<DateTime<Utc>>,
    pub audience_restrictions: Vec<String>,
}

/// Decode the base64 `SAMLResponse` form value into XML text.
pub fn decode_response(encoded: &str) -> Result<String, SamlError> {
    let compact: String = encoded.chars().filter(|c| !c.is_whitespace()).collect();
    let bytes = BASE64
        .decode(compact)
        .map_err(|e| SamlError::Encoding(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| SamlError::Encoding(e.to_string()))
}

/// The top-level `Status/StatusCode/@Value` must end with `status:Success`.
pub fn verify_status(doc: &Document) -> Result<(), SamlError> {
    let status = doc
        .path(doc.root(), &["Status", "StatusCode"])
        .and_then(|code| doc.attribute(code, "Value"))
        .unwrap_or_default();

    if status.ends_with(STATUS_SUCCESS_SUFFIX) {
        Ok(())
    } else {
        Err(SamlError::StatusNotSuccess {
            status: status.to_string(),
        })
    }
}

/// Read issuer, subject, conditions and audiences from the subtree at `within`.
pub fn extract(doc: &Document, within: NodeId) -> Result<SamlDetail, SamlError> {
    let mut detail = SamlDetail {
        issuer: String::new(),
        subject_name_id: String::new(),
        not_before: None,
        not_on_or_after: None,
        audience_restrictions: Vec::new(),
    };

    if let Some(conditions) = doc.find_first(within, "Conditions") {
        detail.not_before = doc
            .attribute(conditions, "NotBefore")
            .map(parse_instant)
            .transpose()?;
        detail.not_on_or_after = doc
            .attribute(conditions, "NotOnOrAfter")
            .map(parse_instant)
            .transpose()?;
    }

    detail.subject_name_id = doc
        .find_all(within, "Subject")
        .into_iter()
        .find_map(|subject| doc.child(subject, "NameID"))
        .map(|name_id| doc.text(name_id).trim().to_string())
        .filter(|name_id| !name_id.is_empty())
        .ok_or_else(|| SamlError::MissingRequiredClaim {
            claim: "NameID".to_string(),
        })?;

    detail.issuer = doc
        .find_first(within, "Issuer")
        .map(|issuer| doc.text(issuer).trim().to_string())
        .filter(|issuer| !issuer.is_empty())
        .ok_or_else(|| SamlError::MissingRequiredClaim {
            claim: "Issuer".to_string(),
        })?;

    for conditions in doc.find_all(within, "Conditions") {
        for restriction in doc.child_elements(conditions) {
            if doc.local_name(restriction) != Some("AudienceRestriction") {
                continue;
            }
            detail.audience_restrictions.extend(
                doc.child_elements(restriction)
                    .filter(|&a| doc.local_name(a) == Some("Audience"))
                    .map(|a| doc.text(a).trim().to_string()),
            );
        }
    }

    debug!(
        issuer = %detail.issuer,
        subject = %detail.subject_name_id,
        "Extracted SAML response detail"
    );
    Ok(detail)
}

/// Passes when nothing is configured, otherwise the configured audience must be listed.
pub fn verify_audience(detail: &SamlDetail, expected: Option<&str>) -> Result<(), SamlError> {
    match expected {
        None | Some("") => Ok(()),
        Some(expected) if detail.audience_restrictions.iter().any(|a| a == expected) => Ok(()),
        Some(expected) => Err(SamlError::AudienceMismatch {
            expected: expected.to_string(),
        }),
    }
}

/// `NotBefore - 5s <= now < NotOnOrAfter`, every instant truncated to whole seconds.
pub fn verify_window(detail: &SamlDetail, now: DateTime<Utc>) -> Result<(), SamlError> {
    let now = now.trunc_subsecs(0);

    let after_start = detail
        .not_before
        .map(|nb| nb.trunc_subsecs(0) - Duration::seconds(CLOCK_SKEW_SECS) <= now)
        .unwrap_or(true);
    let before_end = detail
        .not_on_or_after
        .map(|noa| now < noa.trunc_subsecs(0))
        .unwrap_or(true);

    if after_start && before_end {
        Ok(())
    } else {
        Err(SamlError::OutsideValidityWindow)
    }
}

/// xs:dateTime; values without a zone are taken as UTC.
fn parse_instant(value: &str) -> Result<DateTime<Utc>, SamlError> {
    let value = value.trim();
    if let Ok(instant) = DateTime::parse_from_rfc3339(value) {
        return Ok(instant.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Utc.from_utc_datetime(&naive))
        .map_err(|_| SamlError::MalformedResponse(format!("invalid timestamp '{}'", value)))
}
