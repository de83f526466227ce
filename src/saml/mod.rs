//! SAML 2.0 protocol support.
//!
//! Builds redirect-binding AuthnRequests and runs inbound responses through
//! signature, status, audience and validity-window checks before trusting
//! the asserted subject.

pub mod config;
pub mod handler;
pub mod metadata;
pub mod request;
pub mod response;
pub mod signature;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{AuthnContextComparison, SamlHandlerConfig};
pub use handler::SamlHandler;
pub use metadata::IdpMetadata;
pub use request::{AuthnRequest, RequestFormat};
pub use response::SamlDetail;

use crate::error::SamlError;
use crate::xml::XmlError;

impl From<XmlError> for SamlError {
    fn from(err: XmlError) -> Self {
        SamlError::MalformedResponse(err.to_string())
    }
}
