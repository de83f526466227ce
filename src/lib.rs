//! Identity federation bridge.
//!
//! Relying parties sign in through the bridge, which forwards the user to a
//! configured identity provider, verifies what comes back and rewrites the
//! asserted claims according to the relying party's claims policy.

pub mod bridge;
pub mod claims;
pub mod config;
pub mod error;
pub mod policy;
pub mod protocol;
pub mod saml;
pub mod xml;

pub use bridge::{AuthBridge, ProviderSummary, SignInCompletion};
pub use claims::{Claim, ClaimsIdentity};
pub use config::BridgeConfig;
pub use error::{BridgeError, EvaluationError, PolicyStoreError, SamlError};
pub use policy::{ClaimsPolicyEvaluator, PolicyStore};
pub use protocol::{HttpRequest, ProtocolDiscovery, ProtocolHandler, SignInRedirect};
