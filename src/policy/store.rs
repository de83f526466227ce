//! Policy store: validated access to the per-scope rule catalog.
//!
//! Reads load and re-validate the whole document. Mutations are
//! read-modify-write of the whole document; writers in this process are
//! serialized by a mutex and the repository's version check catches writers
//! in other processes.

use std::sync::Mutex;
use tracing::{debug, info};

use super::document::PolicyDocument;
use super::model::{validate_scopes, ClaimType, Issuer, PolicyRule, PolicyScope};
use super::repository::PolicyRepository;
use crate::error::PolicyStoreError;

pub struct PolicyStore {
    repository: Box<dyn PolicyRepository>,
    write_lock: Mutex<()>,
}

impl PolicyStore {
    pub fn new(repository: impl PolicyRepository + 'static) -> Self {
        Self::from_boxed(Box::new(repository))
    }

    pub fn from_boxed(repository: Box<dyn PolicyRepository>) -> Self {
        Self {
            repository,
            write_lock: Mutex::new(()),
        }
    }

    /// All scopes, fully validated.
    pub fn retrieve_scopes(&self) -> Result<Vec<PolicyScope>, PolicyStoreError> {
        let loaded = self.repository.load()?;
        let scopes = loaded.document.to_scopes()?;
        debug!(scopes = scopes.len(), version = loaded.version, "Loaded policy scopes");
        Ok(scopes)
    }

    pub fn retrieve_scope(&self, uri: &str) -> Result<PolicyScope, PolicyStoreError> {
        self.retrieve_scopes()?
            .into_iter()
            .find(|s| s.uri == uri)
            .ok_or_else(|| PolicyStoreError::ScopeNotFound {
                uri: uri.to_string(),
            })
    }

    /// Case-insensitive issuer lookup by display name within one scope.
    pub fn retrieve_issuer(
        &self,
        scope_uri: &str,
        display_name: &str,
    ) -> Result<Option<Issuer>, PolicyStoreError> {
        let scope = self.retrieve_scope(scope_uri)?;
        Ok(scope.issuer(display_name).cloned())
    }

    /// Create an empty scope.
    pub fn add_scope(&self, uri: &str) -> Result<(), PolicyStoreError> {
        self.write(|scopes| {
            if scopes.iter().any(|s| s.uri == uri) {
                return Err(PolicyStoreError::DuplicateScope {
                    uri: uri.to_string(),
                });
            }
            scopes.push(PolicyScope::new(uri));
            Ok(())
        })?;
        info!(scope = %uri, "Policy scope added");
        Ok(())
    }

    /// Append a rule, creating any catalog entries it introduces.
    pub fn add_policy_rule(&self, scope_uri: &str, rule: PolicyRule) -> Result<(), PolicyStoreError> {
        self.write_scope(scope_uri, |scope| scope.add_rule(rule))?;
        info!(scope = %scope_uri, "Policy rule added");
        Ok(())
    }

    /// Remove a rule. A rule that is not present is not an error.
    pub fn remove_policy_rule(
        &self,
        scope_uri: &str,
        rule: &PolicyRule,
    ) -> Result<(), PolicyStoreError> {
        let removed = self.write_scope(scope_uri, |scope| Ok(scope.remove_rule(rule)))?;
        info!(scope = %scope_uri, removed, "Policy rule removal");
        Ok(())
    }

    /// Remove an issuer, refusing while a rule still references it.
    pub fn remove_issuer(&self, scope_uri: &str, issuer: &Issuer) -> Result<(), PolicyStoreError> {
        let removed = self.write_scope(scope_uri, |scope| scope.remove_issuer(issuer))?;
        info!(scope = %scope_uri, issuer = %issuer.uri, removed, "Issuer removal");
        Ok(())
    }

    /// Add an issuer to a scope's catalog. Existing URIs are left alone.
    pub fn add_issuer(&self, scope_uri: &str, issuer: &Issuer) -> Result<(), PolicyStoreError> {
        self.write_scope(scope_uri, |scope| scope.ensure_issuer(issuer).map(|_| ()))
    }

    /// Add a claim type to a scope's catalog. Existing full names are left alone.
    pub fn add_claim_type(
        &self,
        scope_uri: &str,
        claim_type: &ClaimType,
    ) -> Result<(), PolicyStoreError> {
        self.write_scope(scope_uri, |scope| scope.ensure_claim_type(claim_type).map(|_| ()))
    }

    fn write_scope<T>(
        &self,
        scope_uri: &str,
        mutate: impl FnOnce(&mut PolicyScope) -> Result<T, PolicyStoreError>,
    ) -> Result<T, PolicyStoreError> {
        self.write(|scopes| {
            let scope = scopes.iter_mut().find(|s| s.uri == scope_uri).ok_or_else(|| {
                PolicyStoreError::ScopeNotFound {
                    uri: scope_uri.to_string(),
                }
            })?;
            mutate(scope)
        })
    }

    fn write<T>(
        &self,
        mutate: impl FnOnce(&mut Vec<PolicyScope>) -> Result<T, PolicyStoreError>,
    ) -> Result<T, PolicyStoreError> {
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| PolicyStoreError::Storage("policy writer lock poisoned".to_string()))?;

        let loaded = self.repository.load()?;
        let mut scopes = loaded.document.to_scopes()?;
        let result = mutate(&mut scopes)?;
        validate_scopes(&scopes)?;

        let version = self
            .repository
            .save(&PolicyDocument::from_scopes(&scopes), loaded.version)?;
        debug!(version, "Policy document saved");
        Ok(result)
    }
}
