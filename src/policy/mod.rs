//! Claims policy engine: the per-scope rule catalog and its evaluator.

pub mod document;
pub mod evaluator;
pub mod model;
pub mod repository;
pub mod store;

pub use document::PolicyDocument;
pub use evaluator::{evaluate_scope, ClaimsPolicyEvaluator};
pub use model::{
    AssertionsMatch, ClaimType, CopyFromSource, InputPolicyClaim, Issuer, OutputPolicyClaim,
    OutputValue, PolicyRule, PolicyScope, WILDCARD,
};
pub use repository::{
    FilePolicyRepository, MemoryPolicyRepository, PolicyRepository, RedbPolicyRepository,
    VersionedDocument,
};
pub use store::PolicyStore;
