//! Persisted shape of the policy document.
//!
//! Rules refer to issuers and claim types by display name, the way a
//! hand-edited document does. Converting to the model resolves those
//! references and runs every load-time check, so a document that was edited
//! outside the store is re-validated on each read.

use serde::{Deserialize, Serialize};

use super::model::{
    validate_scopes, AssertionsMatch, ClaimType, CopyFromSource, InputPolicyClaim, Issuer,
    OutputPolicyClaim, OutputValue, PolicyRule, PolicyScope,
};
use crate::error::PolicyStoreError;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyDocument {
    #[serde(default)]
    pub scopes: Vec<ScopeElement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScopeElement {
    pub uri: String,
    #[serde(default)]
    pub issuers: Vec<IssuerElement>,
    #[serde(default)]
    pub claim_types: Vec<ClaimTypeElement>,
    #[serde(default)]
    pub rules: Vec<RuleElement>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuerElement {
    pub uri: String,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub thumbprint: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimTypeElement {
    pub full_name: String,
    #[serde(default)]
    pub display_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleElement {
    #[serde(default)]
    pub assertions_match: AssertionsMatch,
    #[serde(default)]
    pub input_claims: Vec<InputClaimElement>,
    pub output_claim: OutputClaimElement,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputClaimElement {
    /// Issuer display name.
    pub issuer: String,
    /// Claim type display name.
    pub claim_type: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputClaimElement {
    /// Claim type display name.
    pub claim_type: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub copy_from_input: bool,
    #[serde(default, alias = "copyFromSource")]
    pub copy_from: Option<CopyFromSource>,
}

impl PolicyDocument {
    /// Parse the JSON form.
    pub fn from_json(json: &str) -> Result<Self, PolicyStoreError> {
        serde_json::from_str(json).map_err(|e| PolicyStoreError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, PolicyStoreError> {
        serde_json::to_string_pretty(self).map_err(|e| PolicyStoreError::Malformed(e.to_string()))
    }

    /// Resolve references and validate, producing the model.
    pub fn to_scopes(&self) -> Result<Vec<PolicyScope>, PolicyStoreError> {
        for (index, scope) in self.scopes.iter().enumerate() {
            if self.scopes[..index].iter().any(|s| s.uri == scope.uri) {
                return Err(PolicyStoreError::DuplicateScope {
                    uri: scope.uri.clone(),
                });
            }
        }

        let catalogs: Vec<PolicyScope> = self.scopes.iter().map(ScopeElement::catalog).collect();

        let mut scopes = Vec::with_capacity(self.scopes.len());
        for (element, catalog) in self.scopes.iter().zip(&catalogs) {
            let mut scope = catalog.clone();
            for rule in &element.rules {
                scope.rules.push(rule.resolve(catalog, &catalogs)?);
            }
            scopes.push(scope);
        }

        validate_scopes(&scopes)?;
        Ok(scopes)
    }

    /// Serialize a model back into document form.
    pub fn from_scopes(scopes: &[PolicyScope]) -> Self {
        let scopes = scopes
            .iter()
            .map(|scope| ScopeElement {
                uri: scope.uri.clone(),
                issuers: scope
                    .issuers
                    .iter()
                    .map(|i| IssuerElement {
                        uri: i.uri.clone(),
                        display_name: Some(i.display_name.clone()),
                        thumbprint: i.thumbprint.clone(),
                    })
                    .collect(),
                claim_types: scope
                    .claim_types
                    .iter()
                    .map(|t| ClaimTypeElement {
                        full_name: t.full_name.clone(),
                        display_name: Some(t.display_name.clone()),
                    })
                    .collect(),
                rules: scope.rules.iter().map(RuleElement::from_rule).collect(),
            })
            .collect();
        Self { scopes }
    }
}

impl ScopeElement {
    fn catalog(&self) -> PolicyScope {
        let mut scope = PolicyScope::new(self.uri.clone());
        scope.issuers = self
            .issuers
            .iter()
            .map(|i| Issuer {
                uri: i.uri.clone(),
                display_name: i.display_name.clone().unwrap_or_else(|| i.uri.clone()),
                thumbprint: i.thumbprint.clone(),
            })
            .collect();
        scope.claim_types = self
            .claim_types
            .iter()
            .map(|t| ClaimType {
                full_name: t.full_name.clone(),
                display_name: t.display_name.clone().unwrap_or_else(|| t.full_name.clone()),
            })
            .collect();
        scope
    }
}

impl RuleElement {
    /// Resolve display-name references against one scope's catalog.
    pub fn resolve_in(&self, scope: &PolicyScope) -> Result<PolicyRule, PolicyStoreError> {
        self.resolve(scope, std::slice::from_ref(scope))
    }

    fn resolve(
        &self,
        scope: &PolicyScope,
        all: &[PolicyScope],
    ) -> Result<PolicyRule, PolicyStoreError> {
        let mut inputs = Vec::with_capacity(self.input_claims.len());
        for input in &self.input_claims {
            inputs.push(InputPolicyClaim {
                issuer: resolve_issuer(scope, all, &input.issuer)?,
                claim_type: resolve_claim_type(scope, all, &input.claim_type)?,
                value: input.value.clone(),
            });
        }

        let output = &self.output_claim;
        let claim_type = resolve_claim_type(scope, all, &output.claim_type)?;
        let literal = output.value.as_deref().filter(|v| !v.is_empty());
        let value = match (output.copy_from_input, literal) {
            (true, Some(_)) => {
                return Err(PolicyStoreError::LiteralWithCopyFromInput {
                    scope: scope.uri.clone(),
                })
            }
            (true, None) => OutputValue::CopyFromInput(output.copy_from.unwrap_or_default()),
            (false, Some(value)) => OutputValue::Literal(value.to_string()),
            (false, None) => {
                return Err(PolicyStoreError::MissingOutputValue {
                    scope: scope.uri.clone(),
                })
            }
        };

        let rule = PolicyRule {
            assertions_match: self.assertions_match,
            input_claims: inputs,
            output_claim: OutputPolicyClaim { claim_type, value },
        };
        rule.validate(&scope.uri)?;
        Ok(rule)
    }

    fn from_rule(rule: &PolicyRule) -> Self {
        let (value, copy_from_input, copy_from) = match &rule.output_claim.value {
            OutputValue::Literal(v) => (Some(v.clone()), false, None),
            OutputValue::CopyFromInput(source) => (None, true, Some(*source)),
        };
        Self {
            assertions_match: rule.assertions_match,
            input_claims: rule
                .input_claims
                .iter()
                .map(|c| InputClaimElement {
                    issuer: c.issuer.display_name.clone(),
                    claim_type: c.claim_type.display_name.clone(),
                    value: c.value.clone(),
                })
                .collect(),
            output_claim: OutputClaimElement {
                claim_type: rule.output_claim.claim_type.display_name.clone(),
                value,
                copy_from_input,
                copy_from,
            },
        }
    }
}

fn resolve_issuer(
    scope: &PolicyScope,
    all: &[PolicyScope],
    name: &str,
) -> Result<Issuer, PolicyStoreError> {
    if let Some(issuer) = scope.issuer(name) {
        return Ok(issuer.clone());
    }
    if all.iter().any(|s| s.uri != scope.uri && s.issuer(name).is_some()) {
        return Err(PolicyStoreError::ForeignIssuer {
            scope: scope.uri.clone(),
            issuer: name.to_string(),
        });
    }
    Err(PolicyStoreError::UnknownIssuer {
        scope: scope.uri.clone(),
        issuer: name.to_string(),
    })
}

fn resolve_claim_type(
    scope: &PolicyScope,
    all: &[PolicyScope],
    name: &str,
) -> Result<ClaimType, PolicyStoreError> {
    if let Some(claim_type) = scope.claim_type(name) {
        return Ok(claim_type.clone());
    }
    if all.iter().any(|s| s.uri != scope.uri && s.claim_type(name).is_some()) {
        return Err(PolicyStoreError::ForeignClaimType {
            scope: scope.uri.clone(),
            claim_type: name.to_string(),
        });
    }
    Err(PolicyStoreError::UnknownClaimType {
        scope: scope.uri.clone(),
        claim_type: name.to_string(),
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Two scopes, each with its own issuers, claim types and rules.
    pub(crate) const SAMPLE: &str = r#"{
      "scopes": [
        {
          "uri": "http://localhost/1",
          "issuers": [
            { "uri": "http://myIssuer1", "displayName": "myIssuer1" },
            { "uri": "http://myIssuer2", "displayName": "myIssuer2" }
          ],
          "claimTypes": [
            { "fullName": "http://myClaimType", "displayName": "myClaimType" }
          ],
          "rules": [
            {
              "assertionsMatch": "any",
              "inputClaims": [
                { "issuer": "myIssuer1", "claimType": "myClaimType", "value": "myInputClaim" }
              ],
              "outputClaim": { "claimType": "myClaimType", "value": "myOutputClaimValue" }
            }
          ]
        },
        {
          "uri": "http://localhost/2",
          "issuers": [
            { "uri": "http://myIssuer3", "displayName": "myIssuer3" },
            { "uri": "http://myIssuer4" }
          ],
          "claimTypes": [
            { "fullName": "http://myClaimType2", "displayName": "myClaimType2" }
          ],
          "rules": [
            {
              "assertionsMatch": "all",
              "inputClaims": [
                { "issuer": "myIssuer3", "claimType": "myClaimType2", "value": "scope 2 - input claim value from myIssuer3" },
                { "issuer": "http://myIssuer4", "claimType": "myClaimType2", "value": "scope 2 - input claim value from myIssuer4" }
              ],
              "outputClaim": { "claimType": "myClaimType2", "value": "scope 2 - output claim value" }
            }
          ]
        }
      ]
    }"#;

    fn load(json: &str) -> Result<Vec<PolicyScope>, PolicyStoreError> {
        PolicyDocument::from_json(json)?.to_scopes()
    }

    /// Single scope document with one rule whose pieces are supplied by the caller.
    fn single_rule(inputs: &str, output: &str) -> String {
        format!(
            r#"{{
              "scopes": [{{
                "uri": "http://localhost/1",
                "issuers": [{{ "uri": "http://myIssuer1", "displayName": "myIssuer1" }}],
                "claimTypes": [{{ "fullName": "http://myClaimType", "displayName": "myClaimType" }}],
                "rules": [{{ "inputClaims": [{}], "outputClaim": {} }}]
              }}]
            }}"#,
            inputs, output
        )
    }

    const INPUT: &str = r#"{ "issuer": "myIssuer1", "claimType": "myClaimType", "value": "x" }"#;

    #[test]
    fn test_retrieve_claims_policies() {
        let scopes = load(SAMPLE).unwrap();
        assert_eq!(scopes.len(), 2);

        let second = &scopes[1];
        assert_eq!(second.uri, "http://localhost/2");
        assert_eq!(second.rules[0].assertions_match, AssertionsMatch::All);
        assert_eq!(
            second.rules[0].input_claims[0].value,
            "scope 2 - input claim value from myIssuer3"
        );
        assert_eq!(second.rules[0].input_claims[1].issuer.uri, "http://myIssuer4");
        assert_eq!(
            second.rules[0].output_claim.value,
            OutputValue::Literal("scope 2 - output claim value".to_string())
        );
    }

    #[test]
    fn test_issuer_without_display_name_uses_uri() {
        let scopes = load(SAMPLE).unwrap();
        let issuer = scopes[1].issuer_by_uri("http://myIssuer4").unwrap();
        assert_eq!(issuer.display_name, "http://myIssuer4");
    }

    #[test]
    fn test_unknown_input_claim_type() {
        let json = single_rule(
            r#"{ "issuer": "myIssuer1", "claimType": "nope", "value": "x" }"#,
            r#"{ "claimType": "myClaimType", "value": "y" }"#,
        );
        assert!(matches!(load(&json), Err(PolicyStoreError::UnknownClaimType { .. })));
    }

    #[test]
    fn test_unknown_output_claim_type() {
        let json = single_rule(INPUT, r#"{ "claimType": "nope", "value": "y" }"#);
        assert!(matches!(load(&json), Err(PolicyStoreError::UnknownClaimType { .. })));
    }

    #[test]
    fn test_unknown_input_issuer() {
        let json = single_rule(
            r#"{ "issuer": "nope", "claimType": "myClaimType", "value": "x" }"#,
            r#"{ "claimType": "myClaimType", "value": "y" }"#,
        );
        assert!(matches!(load(&json), Err(PolicyStoreError::UnknownIssuer { .. })));
    }

    #[test]
    fn test_wildcard_on_output_claim() {
        let json = single_rule(INPUT, r#"{ "claimType": "myClaimType", "value": "*" }"#);
        assert!(matches!(load(&json), Err(PolicyStoreError::WildcardOutputValue { .. })));
    }

    #[test]
    fn test_copy_from_input_with_multiple_literal_inputs() {
        let inputs = format!("{}, {}", INPUT, INPUT.replace("\"x\"", "\"z\""));
        let json = single_rule(&inputs, r#"{ "claimType": "myClaimType", "copyFromInput": true }"#);
        assert!(matches!(load(&json), Err(PolicyStoreError::AmbiguousCopySource { .. })));
    }

    #[test]
    fn test_copy_from_input_with_output_value() {
        let json = single_rule(
            INPUT,
            r#"{ "claimType": "myClaimType", "value": "y", "copyFromInput": true }"#,
        );
        assert!(matches!(
            load(&json),
            Err(PolicyStoreError::LiteralWithCopyFromInput { .. })
        ));
    }

    #[test]
    fn test_output_value_required_without_copy() {
        let absent = single_rule(INPUT, r#"{ "claimType": "myClaimType" }"#);
        assert!(matches!(load(&absent), Err(PolicyStoreError::MissingOutputValue { .. })));

        let disabled = single_rule(
            INPUT,
            r#"{ "claimType": "myClaimType", "copyFromInput": false }"#,
        );
        assert!(matches!(
            load(&disabled),
            Err(PolicyStoreError::MissingOutputValue { .. })
        ));
    }

    #[test]
    fn test_copy_from_source_aliases() {
        let json = single_rule(
            r#"{ "issuer": "myIssuer1", "claimType": "myClaimType", "value": "*" }"#,
            r#"{ "claimType": "myClaimType", "copyFromInput": true, "copyFromSource": "issuer" }"#,
        );
        let scopes = load(&json).unwrap();
        assert_eq!(
            scopes[0].rules[0].output_claim.value,
            OutputValue::CopyFromInput(CopyFromSource::Issuer)
        );
    }

    #[test]
    fn test_duplicated_scope_uris() {
        let json = r#"{ "scopes": [ { "uri": "http://localhost/1" }, { "uri": "http://localhost/1" } ] }"#;
        assert!(matches!(load(json), Err(PolicyStoreError::DuplicateScope { .. })));
    }

    #[test]
    fn test_claim_type_declared_on_different_scope() {
        let json = SAMPLE.replace(
            r#""outputClaim": { "claimType": "myClaimType2""#,
            r#""outputClaim": { "claimType": "myClaimType""#,
        );
        assert!(matches!(load(&json), Err(PolicyStoreError::ForeignClaimType { .. })));
    }

    #[test]
    fn test_issuer_declared_on_different_scope() {
        let json = SAMPLE.replace(
            r#"{ "issuer": "myIssuer3", "claimType": "myClaimType2""#,
            r#"{ "issuer": "myIssuer1", "claimType": "myClaimType2""#,
        );
        assert!(matches!(load(&json), Err(PolicyStoreError::ForeignIssuer { .. })));
    }

    #[test]
    fn test_model_round_trip_preserves_references() {
        let scopes = load(SAMPLE).unwrap();
        let reloaded = PolicyDocument::from_scopes(&scopes).to_scopes().unwrap();
        assert_eq!(scopes, reloaded);
    }

    #[test]
    fn test_rule_element_resolves_in_scope() {
        let scopes = load(SAMPLE).unwrap();
        let rule: RuleElement = serde_json::from_str(
            r#"{
              "inputClaims": [{ "issuer": "myIssuer2", "claimType": "myClaimType", "value": "*" }],
              "outputClaim": { "claimType": "myClaimType", "copyFromInput": true }
            }"#,
        )
        .unwrap();

        let resolved = rule.resolve_in(&scopes[0]).unwrap();
        assert_eq!(resolved.input_claims[0].issuer.uri, "http://myIssuer2");
        assert_eq!(
            resolved.output_claim.value,
            OutputValue::CopyFromInput(CopyFromSource::InputValue)
        );

        // issuers of another scope are not visible
        assert!(matches!(
            rule.resolve_in(&scopes[1]),
            Err(PolicyStoreError::UnknownIssuer { .. })
        ));
    }
}
