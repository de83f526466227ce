//! Runtime claims and identities.

use serde::{Deserialize, Serialize};

/// Well-known claim type URIs.
pub mod claim_types {
    pub const NAME_IDENTIFIER: &str =
        "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/nameidentifier";
    pub const NAME: &str = "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/name";
    pub const EMAIL: &str = "http://schemas.xmlsoap.org/ws/2005/05/identity/claims/emailaddress";
    pub const ROLE: &str = "http://schemas.microsoft.com/ws/2008/06/identity/claims/role";
    pub const AUTHENTICATION_METHOD: &str =
        "http://schemas.microsoft.com/ws/2008/06/identity/claims/authenticationmethod";
    pub const AUTHENTICATION_INSTANT: &str =
        "http://schemas.microsoft.com/ws/2008/06/identity/claims/authenticationinstant";
}

/// Well-known claim value type URIs.
pub mod value_types {
    pub const STRING: &str = "http://www.w3.org/2001/XMLSchema#string";
    pub const DATE_TIME: &str = "http://www.w3.org/2001/XMLSchema#dateTime";
}

/// Issuer recorded on claims that carry no explicit issuer.
pub const LOCAL_AUTHORITY: &str = "LOCAL AUTHORITY";

/// A single assertion about a subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Claim {
    #[serde(rename = "type")]
    pub claim_type: String,
    pub value: String,
    #[serde(default = "default_value_type")]
    pub value_type: String,
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default)]
    pub original_issuer: String,
}

fn default_value_type() -> String {
    value_types::STRING.to_string()
}

fn default_issuer() -> String {
    LOCAL_AUTHORITY.to_string()
}

impl Claim {
    /// String-valued claim whose original issuer equals its issuer.
    pub fn new(
        claim_type: impl Into<String>,
        value: impl Into<String>,
        issuer: impl Into<String>,
    ) -> Self {
        let issuer = issuer.into();
        Self {
            claim_type: claim_type.into(),
            value: value.into(),
            value_type: default_value_type(),
            original_issuer: issuer.clone(),
            issuer,
        }
    }

    pub fn with_value_type(mut self, value_type: impl Into<String>) -> Self {
        self.value_type = value_type.into();
        self
    }

    pub fn with_original_issuer(mut self, original_issuer: impl Into<String>) -> Self {
        self.original_issuer = original_issuer.into();
        self
    }
}

/// A set of claims produced by one authentication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimsIdentity {
    /// Label of the authority that authenticated the subject.
    pub authentication_type: String,
    pub claims: Vec<Claim>,
}

impl ClaimsIdentity {
    pub fn new(authentication_type: impl Into<String>, claims: Vec<Claim>) -> Self {
        Self {
            authentication_type: authentication_type.into(),
            claims,
        }
    }

    pub fn add_claim(&mut self, claim: Claim) {
        self.claims.push(claim);
    }

    /// First claim of the given type (case-insensitive).
    pub fn find_first(&self, claim_type: &str) -> Option<&Claim> {
        self.claims
            .iter()
            .find(|c| c.claim_type.eq_ignore_ascii_case(claim_type))
    }

    /// Copy of this identity with every claim re-stamped with the given issuers.
    pub fn reissue(&self, issuer: &str, original_issuer: &str) -> ClaimsIdentity {
        let claims = self
            .claims
            .iter()
            .map(|c| Claim {
                claim_type: c.claim_type.clone(),
                value: c.value.clone(),
                value_type: c.value_type.clone(),
                issuer: issuer.to_string(),
                original_issuer: original_issuer.to_string(),
            })
            .collect();
        ClaimsIdentity::new(self.authentication_type.clone(), claims)
    }
}
