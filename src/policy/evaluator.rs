//! Claims policy evaluation.
//!
//! Maps the claims an identity provider asserted into the claims a relying
//! party receives, using the rules of the relying party's scope.

use std::sync::Arc;
use tracing::debug;

use super::model::{
    AssertionsMatch, CopyFromSource, InputPolicyClaim, OutputValue, PolicyRule, PolicyScope,
};
use super::store::PolicyStore;
use crate::claims::Claim;
use crate::error::{EvaluationError, PolicyStoreError};

pub struct ClaimsPolicyEvaluator {
    store: Arc<PolicyStore>,
}

impl ClaimsPolicyEvaluator {
    pub fn new(store: Arc<PolicyStore>) -> Self {
        Self { store }
    }

    /// Apply the rules of `scope_uri` to `input`.
    ///
    /// An empty input yields an empty output without touching the store.
    pub fn evaluate(&self, scope_uri: &str, input: &[Claim]) -> Result<Vec<Claim>, EvaluationError> {
        if input.is_empty() {
            return Ok(Vec::new());
        }

        let scope = match self.store.retrieve_scope(scope_uri) {
            Ok(scope) => scope,
            Err(PolicyStoreError::ScopeNotFound { uri }) => {
                return Err(EvaluationError::ScopeNotFound { uri })
            }
            Err(e) => return Err(e.into()),
        };

        let output = evaluate_scope(&scope, input);
        debug!(
            scope = %scope_uri,
            input = input.len(),
            output = output.len(),
            "Claims evaluated"
        );
        Ok(output)
    }
}

/// Apply every rule of `scope` in order and concatenate what they produce.
pub fn evaluate_scope(scope: &PolicyScope, input: &[Claim]) -> Vec<Claim> {
    scope
        .rules
        .iter()
        .flat_map(|rule| {
            matched_claims(rule, input)
                .into_iter()
                .map(|claim| produce(scope, rule, claim))
                .collect::<Vec<_>>()
        })
        .collect()
}

/// Claims selected by a rule.
///
/// Matches are the union over the rule's specs; a claim selected by several
/// specs appears once. With `All`, every spec must select at least one claim
/// or the rule selects nothing.
fn matched_claims<'a>(rule: &PolicyRule, input: &'a [Claim]) -> Vec<&'a Claim> {
    let mut matched: Vec<&Claim> = Vec::new();

    for spec in &rule.input_claims {
        let mut hit = false;
        for claim in input.iter().filter(|c| spec_matches(spec, c)) {
            hit = true;
            if !matched.iter().any(|m| std::ptr::eq(*m, claim)) {
                matched.push(claim);
            }
        }
        if !hit && rule.assertions_match == AssertionsMatch::All {
            return Vec::new();
        }
    }

    matched
}

fn spec_matches(spec: &InputPolicyClaim, claim: &Claim) -> bool {
    let issuer = &spec.issuer.uri;
    (claim.issuer == *issuer || claim.original_issuer == *issuer)
        && eq_ignore_case(&claim.claim_type, &spec.claim_type.full_name)
        && (spec.is_wildcard() || eq_ignore_case(&claim.value, &spec.value))
}

fn eq_ignore_case(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b) || a.to_uppercase() == b.to_uppercase()
}

fn produce(scope: &PolicyScope, rule: &PolicyRule, claim: &Claim) -> Claim {
    let value = match (&rule.output_claim.value, rule.input_claims.first()) {
        (OutputValue::Literal(value), _) => value.clone(),
        (OutputValue::CopyFromInput(source), Some(copy_spec)) => {
            copy_value(scope, *source, copy_spec, claim)
        }
        // rules are validated to carry at least one input
        (OutputValue::CopyFromInput(_), None) => claim.value.clone(),
    };

    let original_issuer = scope
        .issuer_by_uri(&claim.original_issuer)
        .map(|i| i.display_name.clone())
        .unwrap_or_else(|| claim.issuer.clone());

    Claim {
        claim_type: rule.output_claim.claim_type.full_name.clone(),
        value,
        value_type: claim.value_type.clone(),
        issuer: claim.issuer.clone(),
        original_issuer,
    }
}

/// The copied value. The rule's first input spec decides between its own
/// literal and the matched claim, for every claim the rule matched.
fn copy_value(
    scope: &PolicyScope,
    source: CopyFromSource,
    copy_spec: &InputPolicyClaim,
    claim: &Claim,
) -> String {
    match (copy_spec.is_wildcard(), source) {
        (false, CopyFromSource::InputValue) => copy_spec.value.clone(),
        (false, CopyFromSource::Issuer) => copy_spec.issuer.display_name.clone(),
        (true, CopyFromSource::InputValue) => claim.value.clone(),
        (true, CopyFromSource::Issuer) => scope
            .issuer_by_uri(&claim.issuer)
            .map(|i| i.display_name.clone())
            .unwrap_or_else(|| claim.issuer.clone()),
    }
}
