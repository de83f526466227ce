//! Validated in-memory policy entities.

use serde::{Deserialize, Serialize};

use crate::error::PolicyStoreError;

/// Input value that matches any claim value.
pub const WILDCARD: &str = "*";

/// A trusted claim source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issuer {
    pub uri: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thumbprint: Option<String>,
}

impl Issuer {
    /// Issuer whose display name is its URI.
    pub fn new(uri: impl Into<String>) -> Self {
        let uri = uri.into();
        Self {
            display_name: uri.clone(),
            uri,
            thumbprint: None,
        }
    }

    pub fn with_display_name(uri: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            display_name: display_name.into(),
            thumbprint: None,
        }
    }
}

/// Semantic type of a claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimType {
    pub full_name: String,
    pub display_name: String,
}

impl ClaimType {
    pub fn new(full_name: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            full_name: full_name.into(),
            display_name: display_name.into(),
        }
    }
}

/// How a rule combines its input specs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AssertionsMatch {
    /// Every input spec must match at least one claim.
    All,
    /// At least one input spec must match.
    #[default]
    Any,
}

/// What a copy-from-input output copies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CopyFromSource {
    #[default]
    InputValue,
    Issuer,
}

/// A rule's matching predicate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputPolicyClaim {
    pub issuer: Issuer,
    pub claim_type: ClaimType,
    pub value: String,
}

impl InputPolicyClaim {
    pub fn new(issuer: Issuer, claim_type: ClaimType, value: impl Into<String>) -> Self {
        Self {
            issuer,
            claim_type,
            value: value.into(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.value == WILDCARD
    }
}

/// Value produced by an output claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutputValue {
    Literal(String),
    CopyFromInput(CopyFromSource),
}

/// A rule's production template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputPolicyClaim {
    pub claim_type: ClaimType,
    pub value: OutputValue,
}

impl OutputPolicyClaim {
    pub fn literal(claim_type: ClaimType, value: impl Into<String>) -> Self {
        Self {
            claim_type,
            value: OutputValue::Literal(value.into()),
        }
    }

    pub fn copy_from_input(claim_type: ClaimType, source: CopyFromSource) -> Self {
        Self {
            claim_type,
            value: OutputValue::CopyFromInput(source),
        }
    }
}

/// A transformation rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    #[serde(default)]
    pub assertions_match: AssertionsMatch,
    pub input_claims: Vec<InputPolicyClaim>,
    pub output_claim: OutputPolicyClaim,
}

impl PolicyRule {
    pub fn new(
        assertions_match: AssertionsMatch,
        input_claims: Vec<InputPolicyClaim>,
        output_claim: OutputPolicyClaim,
    ) -> Self {
        Self {
            assertions_match,
            input_claims,
            output_claim,
        }
    }

    /// Check the rule's own shape, independent of any catalog.
    pub fn validate(&self, scope: &str) -> Result<(), PolicyStoreError> {
        if self.input_claims.is_empty() {
            return Err(PolicyStoreError::RuleWithoutInputs {
                scope: scope.to_string(),
            });
        }

        match &self.output_claim.value {
            OutputValue::Literal(value) if value == WILDCARD => {
                Err(PolicyStoreError::WildcardOutputValue {
                    scope: scope.to_string(),
                })
            }
            OutputValue::Literal(_) => Ok(()),
            OutputValue::CopyFromInput(_) => {
                let literal_inputs = self.input_claims.iter().filter(|c| !c.is_wildcard()).count();
                if literal_inputs > 1 {
                    return Err(PolicyStoreError::AmbiguousCopySource {
                        scope: scope.to_string(),
                    });
                }
                Ok(())
            }
        }
    }

    pub fn references_issuer(&self, uri: &str) -> bool {
        self.input_claims.iter().any(|c| c.issuer.uri == uri)
    }
}

/// A relying-party trust boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyScope {
    pub uri: String,
    #[serde(default)]
    pub issuers: Vec<Issuer>,
    #[serde(default)]
    pub claim_types: Vec<ClaimType>,
    #[serde(default)]
    pub rules: Vec<PolicyRule>,
}

impl PolicyScope {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            issuers: Vec::new(),
            claim_types: Vec::new(),
            rules: Vec::new(),
        }
    }

    /// Case-insensitive lookup by display name.
    pub fn issuer(&self, display_name: &str) -> Option<&Issuer> {
        self.issuers
            .iter()
            .find(|i| i.display_name.eq_ignore_ascii_case(display_name))
    }

    pub fn issuer_by_uri(&self, uri: &str) -> Option<&Issuer> {
        self.issuers.iter().find(|i| i.uri == uri)
    }

    pub fn claim_type(&self, display_name: &str) -> Option<&ClaimType> {
        self.claim_types
            .iter()
            .find(|t| t.display_name.eq_ignore_ascii_case(display_name))
    }

    pub fn claim_type_by_full_name(&self, full_name: &str) -> Option<&ClaimType> {
        self.claim_types.iter().find(|t| t.full_name == full_name)
    }

    /// Add an issuer unless one with the same URI is already present.
    ///
    /// Returns the catalog entry the caller should reference.
    pub fn ensure_issuer(&mut self, issuer: &Issuer) -> Result<Issuer, PolicyStoreError> {
        if let Some(existing) = self.issuer_by_uri(&issuer.uri) {
            return Ok(existing.clone());
        }
        if self.issuer(&issuer.display_name).is_some() {
            return Err(PolicyStoreError::DuplicateCatalogEntry {
                scope: self.uri.clone(),
                entry: issuer.display_name.clone(),
            });
        }
        self.issuers.push(issuer.clone());
        Ok(issuer.clone())
    }

    /// Add a claim type unless one with the same full name is already present.
    pub fn ensure_claim_type(&mut self, claim_type: &ClaimType) -> Result<ClaimType, PolicyStoreError> {
        if let Some(existing) = self.claim_type_by_full_name(&claim_type.full_name) {
            return Ok(existing.clone());
        }
        if self.claim_type(&claim_type.display_name).is_some() {
            return Err(PolicyStoreError::DuplicateCatalogEntry {
                scope: self.uri.clone(),
                entry: claim_type.display_name.clone(),
            });
        }
        self.claim_types.push(claim_type.clone());
        Ok(claim_type.clone())
    }

    /// Append a rule, growing the catalog with any entries it introduces.
    pub fn add_rule(&mut self, rule: PolicyRule) -> Result<(), PolicyStoreError> {
        rule.validate(&self.uri)?;

        let mut rule = rule;
        for input in &mut rule.input_claims {
            input.issuer = self.ensure_issuer(&input.issuer)?;
            input.claim_type = self.ensure_claim_type(&input.claim_type)?;
        }
        rule.output_claim.claim_type = self.ensure_claim_type(&rule.output_claim.claim_type)?;

        self.rules.push(rule);
        Ok(())
    }

    /// Remove the first rule equal to `rule`. Returns whether one was removed.
    pub fn remove_rule(&mut self, rule: &PolicyRule) -> bool {
        match self.rules.iter().position(|r| r == rule) {
            Some(index) => {
                self.rules.remove(index);
                true
            }
            None => false,
        }
    }

    /// Remove an issuer by URI. Fails while any rule still references it.
    pub fn remove_issuer(&mut self, issuer: &Issuer) -> Result<bool, PolicyStoreError> {
        if self.rules.iter().any(|r| r.references_issuer(&issuer.uri)) {
            return Err(PolicyStoreError::IssuerInUse {
                scope: self.uri.clone(),
                issuer: issuer.uri.clone(),
            });
        }
        let before = self.issuers.len();
        self.issuers.retain(|i| i.uri != issuer.uri);
        Ok(self.issuers.len() < before)
    }

    /// Check catalog uniqueness and that every rule only references this scope's catalog.
    pub fn validate(&self) -> Result<(), PolicyStoreError> {
        for (index, issuer) in self.issuers.iter().enumerate() {
            let duplicate = self.issuers[..index].iter().any(|other| {
                other.uri == issuer.uri
                    || other.display_name.eq_ignore_ascii_case(&issuer.display_name)
            });
            if duplicate {
                return Err(PolicyStoreError::DuplicateCatalogEntry {
                    scope: self.uri.clone(),
                    entry: issuer.display_name.clone(),
                });
            }
        }

        for (index, claim_type) in self.claim_types.iter().enumerate() {
            let duplicate = self.claim_types[..index].iter().any(|other| {
                other.full_name == claim_type.full_name
                    || other.display_name.eq_ignore_ascii_case(&claim_type.display_name)
            });
            if duplicate {
                return Err(PolicyStoreError::DuplicateCatalogEntry {
                    scope: self.uri.clone(),
                    entry: claim_type.display_name.clone(),
                });
            }
        }

        for rule in &self.rules {
            rule.validate(&self.uri)?;

            for input in &rule.input_claims {
                if self.issuer_by_uri(&input.issuer.uri).is_none() {
                    return Err(PolicyStoreError::UnknownIssuer {
                        scope: self.uri.clone(),
                        issuer: input.issuer.uri.clone(),
                    });
                }
                if self.claim_type_by_full_name(&input.claim_type.full_name).is_none() {
                    return Err(PolicyStoreError::UnknownClaimType {
                        scope: self.uri.clone(),
                        claim_type: input.claim_type.full_name.clone(),
                    });
                }
            }

            let output = &rule.output_claim.claim_type;
            if self.claim_type_by_full_name(&output.full_name).is_none() {
                return Err(PolicyStoreError::UnknownClaimType {
                    scope: self.uri.clone(),
                    claim_type: output.full_name.clone(),
                });
            }
        }

        Ok(())
    }
}

/// Validate a whole catalog: every scope individually plus unique scope URIs.
pub fn validate_scopes(scopes: &[PolicyScope]) -> Result<(), PolicyStoreError> {
    for (index, scope) in scopes.iter().enumerate() {
        if scopes[..index].iter().any(|s| s.uri == scope.uri) {
            return Err(PolicyStoreError::DuplicateScope {
                uri: scope.uri.clone(),
            });
        }
        scope.validate()?;
    }
    Ok(())
}
