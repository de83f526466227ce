//! Error types for the bridge.
//!
//! Each component owns an error enum so callers can tell a broken policy
//! document apart from a runtime evaluation failure or a rejected assertion
//! without looking at messages.

use thiserror::Error;

/// Load-time and mutation errors raised by the policy store.
#[derive(Debug, Error)]
pub enum PolicyStoreError {
    #[error("scope not found: {uri}")]
    ScopeNotFound { uri: String },

    #[error("duplicate scope: {uri}")]
    DuplicateScope { uri: String },

    #[error("scope {scope}: unknown claim type reference '{claim_type}'")]
    UnknownClaimType { scope: String, claim_type: String },

    #[error("scope {scope}: unknown issuer reference '{issuer}'")]
    UnknownIssuer { scope: String, issuer: String },

    #[error("scope {scope}: the wildcard '*' cannot be used as an output value")]
    WildcardOutputValue { scope: String },

    #[error("scope {scope}: copy-from-input rule has more than one literal input claim")]
    AmbiguousCopySource { scope: String },

    #[error("scope {scope}: output value cannot be set when copy-from-input is enabled")]
    LiteralWithCopyFromInput { scope: String },

    #[error("scope {scope}: output value is required when copy-from-input is disabled")]
    MissingOutputValue { scope: String },

    #[error("scope {scope}: rule has no input claims")]
    RuleWithoutInputs { scope: String },

    #[error("scope {scope}: claim type '{claim_type}' is declared in another scope")]
    ForeignClaimType { scope: String, claim_type: String },

    #[error("scope {scope}: issuer '{issuer}' is declared in another scope")]
    ForeignIssuer { scope: String, issuer: String },

    #[error("scope {scope}: '{entry}' is declared more than once")]
    DuplicateCatalogEntry { scope: String, entry: String },

    #[error("scope {scope}: issuer '{issuer}' is still referenced by a rule")]
    IssuerInUse { scope: String, issuer: String },

    #[error("policy document was modified concurrently (expected version {expected}, found {found})")]
    ConcurrentModification { expected: u64, found: u64 },

    #[error("policy document is malformed: {0}")]
    Malformed(String),

    #[error("policy storage error: {0}")]
    Storage(String),
}

/// Runtime errors raised while evaluating claims.
#[derive(Debug, Error)]
pub enum EvaluationError {
    #[error("the scope '{uri}' was not found when evaluating claims")]
    ScopeNotFound { uri: String },

    #[error(transparent)]
    Store(#[from] PolicyStoreError),
}

/// Rejections and failures of the SAML sign-in pipeline.
#[derive(Debug, Error)]
pub enum SamlError {
    #[error("signature verification failed for <{element}>: {reason}")]
    SignatureInvalid { element: String, reason: String },

    #[error("the thumbprint doesn't match the white list values")]
    NoTrustedSigner,

    #[error("the SAML response status was not 'status:Success' (got '{status}')")]
    StatusNotSuccess { status: String },

    #[error("required claim missing from response: {claim}")]
    MissingRequiredClaim { claim: String },

    #[error("audience '{expected}' does not match the white list values")]
    AudienceMismatch { expected: String },

    #[error("the SAML response is outside its validity window")]
    OutsideValidityWindow,

    #[error("malformed SAML message: {0}")]
    MalformedResponse(String),

    #[error("metadata error: {0}")]
    Metadata(String),

    #[error("SAML configuration error: {0}")]
    Configuration(String),

    #[error("encoding error: {0}")]
    Encoding(String),
}

/// Top-level error for the bridge orchestration layer.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("unknown claim provider: {identifier}")]
    UnknownIssuer { identifier: String },

    #[error("the protocol handler '{protocol}' is not supported")]
    UnsupportedProtocol { protocol: String },

    #[error("the scope '{uri}' was not found in the configuration")]
    ScopeNotFound { uri: String },

    #[error("missing sign-in context: {0}")]
    MissingContext(String),

    #[error(transparent)]
    Policy(#[from] PolicyStoreError),

    #[error(transparent)]
    Evaluation(#[from] EvaluationError),

    #[error(transparent)]
    Saml(#[from] SamlError),
}
