//! Sign-in orchestration: home realm discovery, the redirect to a claim
//! provider, and turning the provider's reply into relying-party claims.

use chrono::{SecondsFormat, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use crate::claims::{claim_types, value_types, Claim, ClaimsIdentity};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, PolicyStoreError};
use crate::policy::{ClaimsPolicyEvaluator, PolicyScope, PolicyStore};
use crate::protocol::{HttpRequest, ProtocolDiscovery, SignInRedirect};

/// Form field an IdP-initiated post carries the return address in.
pub const RELAY_STATE_FIELD: &str = "RelayState";

/// A claim provider offered to the user for home realm discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderSummary {
    pub identifier: String,
    pub display_name: String,
}

/// Outcome of a completed sign-in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignInCompletion {
    /// Claims after the realm's policy was applied.
    pub identity: ClaimsIdentity,
    /// Where the caller should send the browser next.
    pub original_url: String,
}

pub struct AuthBridge {
    config: BridgeConfig,
    store: Arc<PolicyStore>,
    evaluator: ClaimsPolicyEvaluator,
    discovery: ProtocolDiscovery,
}

impl AuthBridge {
    pub fn new(config: BridgeConfig, store: Arc<PolicyStore>, discovery: ProtocolDiscovery) -> Self {
        let evaluator = ClaimsPolicyEvaluator::new(store.clone());
        Self {
            config,
            store,
            evaluator,
            discovery,
        }
    }

    /// Providers a user may pick from; IdP-initiated-only providers are hidden.
    pub fn home_realm_discovery(&self) -> Vec<ProviderSummary> {
        self.config
            .claim_providers
            .iter()
            .filter(|p| !p.idp_initiated_only)
            .map(|p| ProviderSummary {
                identifier: p.identifier.clone(),
                display_name: p.display_name.clone(),
            })
            .collect()
    }

    /// Start sign-in at claim provider `issuer_id` on behalf of `realm`.
    pub fn sign_in(
        &self,
        issuer_id: &str,
        realm: &str,
        request: &HttpRequest,
    ) -> Result<SignInRedirect, BridgeError> {
        self.provider(issuer_id)?;
        let handler = self.discovery.handler(issuer_id)?;

        if realm.is_empty() {
            return Err(BridgeError::MissingContext(
                "the realm was not found, try to sign in again".to_string(),
            ));
        }
        let scope = self.scope(realm)?;

        info!(issuer = %issuer_id, realm = %realm, "Redirecting to claim provider");
        handler.process_sign_in_request(&scope, request)
    }

    /// Verify the provider's reply, re-issue its claims under the bridge's
    /// identity and apply the realm's policy.
    pub fn complete_sign_in(
        &self,
        issuer_id: &str,
        realm: &str,
        original_url: &str,
        request: &HttpRequest,
    ) -> Result<SignInCompletion, BridgeError> {
        self.provider(issuer_id)?;
        let handler = self.discovery.handler(issuer_id)?;

        let identity = handler.process_sign_in_response(realm, original_url, request)?;

        let bridge_id = &self.config.multi_protocol_issuer.identifier;
        let mut reissued = identity.reissue(bridge_id, issuer_id);
        reissued.add_claim(Claim::new(
            claim_types::AUTHENTICATION_METHOD,
            issuer_id,
            bridge_id.clone(),
        ));
        reissued.add_claim(
            Claim::new(
                claim_types::AUTHENTICATION_INSTANT,
                Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                bridge_id.clone(),
            )
            .with_value_type(value_types::DATE_TIME),
        );

        for claim in &reissued.claims {
            debug!(
                claim_type = %claim.claim_type,
                issuer = %claim.issuer,
                original_issuer = %claim.original_issuer,
                "Claim re-issued"
            );
        }

        let claims = self.evaluator.evaluate(realm, &reissued.claims)?;
        info!(
            issuer = %issuer_id,
            realm = %realm,
            claims = claims.len(),
            "Sign-in completed"
        );

        Ok(SignInCompletion {
            identity: ClaimsIdentity::new(reissued.authentication_type, claims),
            original_url: original_url.to_string(),
        })
    }

    /// Complete a sign-in the identity provider started on its own.
    ///
    /// The provider is the one registered as `urn:<protocol>`, the realm is
    /// the configured default scope and the return address comes from the
    /// posted `RelayState`.
    pub fn complete_idp_initiated(
        &self,
        protocol: &str,
        request: &HttpRequest,
    ) -> Result<SignInCompletion, BridgeError> {
        let issuer_id = format!("urn:{}", protocol);
        let scope = self.config.default_scope.as_deref().ok_or_else(|| {
            BridgeError::MissingContext(format!(
                "{} IdP initiated sign-in requires a default scope",
                protocol
            ))
        })?;

        let relay_state = request
            .form(RELAY_STATE_FIELD)
            .map(str::trim)
            .unwrap_or_default();
        let original_url = format!(
            "?wa=wsignin1.0&wtrealm={}&wctx=ru={}&whr={}",
            urlencoding::encode(scope),
            relay_state,
            urlencoding::encode(&issuer_id)
        );

        self.complete_sign_in(&issuer_id, scope, &original_url, request)
    }

    fn provider(&self, issuer_id: &str) -> Result<(), BridgeError> {
        self.config
            .claim_provider(issuer_id)
            .map(|_| ())
            .ok_or_else(|| BridgeError::UnknownIssuer {
                identifier: issuer_id.to_string(),
            })
    }

    fn scope(&self, realm: &str) -> Result<PolicyScope, BridgeError> {
        self.store.retrieve_scope(realm).map_err(|e| match e {
            PolicyStoreError::ScopeNotFound { uri } => BridgeError::ScopeNotFound { uri },
            other => other.into(),
        })
    }
}
