//! Scheme and policy registry

use crate::error::AuthFailure;
use crate::policy::{AuthPolicy, PolicyViolation};
use crate::scheme::{AuthScheme, Credentials, IDENTITY_NAME_LOCAL};
use dashmap::DashMap;
use nautilus_core::{Binding, Error, Result, ValueKind};
use nautilus_scripting::{
    CompiledHandler, ExecutionContext, HandlerOutput, Identity, ResponseSink, ResultKind,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Registered schemes and policies, keyed case-insensitively
#[derive(Debug, Clone, Default)]
pub struct AuthRegistry {
    schemes: Arc<DashMap<String, AuthScheme>>,
    policies: Arc<DashMap<String, AuthPolicy>>,
}

impl AuthRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a scheme
    pub fn register_scheme(&self, scheme: AuthScheme) -> Result<()> {
        match self.schemes.entry(scheme.name.to_lowercase()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::DuplicateScheme(scheme.name)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(scheme = %scheme.name, kind = scheme.kind.as_str(), "Authentication scheme registered");
                slot.insert(scheme);
                Ok(())
            }
        }
    }

    /// Attach a credential validator to a scheme
    pub fn attach_validator(&self, scheme: &str, handler: CompiledHandler) -> Result<()> {
        expect_kind(&handler, ResultKind::Verdict)?;
        let mut entry = self
            .schemes
            .get_mut(&scheme.to_lowercase())
            .ok_or_else(|| Error::UnknownScheme(scheme.to_string()))?;
        debug!(scheme = %entry.name, handler = %handler.name(), "Validator attached");
        entry.validator = Some(handler);
        Ok(())
    }

    /// Attach a claim issuer to a scheme
    pub fn attach_claim_issuer(&self, scheme: &str, handler: CompiledHandler) -> Result<()> {
        expect_kind(&handler, ResultKind::Claims)?;
        let mut entry = self
            .schemes
            .get_mut(&scheme.to_lowercase())
            .ok_or_else(|| Error::UnknownScheme(scheme.to_string()))?;
        debug!(scheme = %entry.name, handler = %handler.name(), "Claim issuer attached");
        entry.claim_issuer = Some(handler);
        Ok(())
    }

    /// Look up a scheme
    pub fn scheme(&self, name: &str) -> Option<AuthScheme> {
        self.schemes.get(&name.to_lowercase()).map(|s| s.clone())
    }

    /// Whether a scheme is registered
    pub fn has_scheme(&self, name: &str) -> bool {
        self.schemes.contains_key(&name.to_lowercase())
    }

    /// Register a policy
    pub fn register_policy(&self, policy: AuthPolicy) -> Result<()> {
        for scheme in &policy.schemes {
            if !self.has_scheme(scheme) {
                return Err(Error::UnknownScheme(scheme.clone()));
            }
        }
        match self.policies.entry(policy.name.to_lowercase()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(Error::validation(format!(
                "authorization policy already registered: {}",
                policy.name
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                debug!(policy = %policy.name, "Authorization policy registered");
                slot.insert(policy);
                Ok(())
            }
        }
    }

    /// Look up a policy
    pub fn policy(&self, name: &str) -> Option<AuthPolicy> {
        self.policies.get(&name.to_lowercase()).map(|p| p.clone())
    }

    /// Whether a policy is registered
    pub fn has_policy(&self, name: &str) -> bool {
        self.policies.contains_key(&name.to_lowercase())
    }

    /// Fail on the first scheme or policy that is not registered
    pub fn check_references(&self, schemes: &[String], policies: &[String]) -> Result<()> {
        if let Some(missing) = schemes.iter().find(|s| !self.has_scheme(s)) {
            return Err(Error::UnknownScheme(missing.clone()));
        }
        if let Some(missing) = policies.iter().find(|p| !self.has_policy(p)) {
            return Err(Error::UnknownPolicy(missing.clone()));
        }
        Ok(())
    }

    /// Try each scheme in order until one accepts the caller
    ///
    /// A scheme without a validator rejects every credential. Validator
    /// faults count as rejection; claim issuer faults are internal errors.
    pub async fn authenticate(
        &self,
        schemes: &[String],
        ctx: &ExecutionContext,
    ) -> std::result::Result<Identity, AuthFailure> {
        let mut challenges = Vec::new();
        let mut presented = false;

        for name in schemes {
            let scheme = self
                .scheme(name)
                .ok_or_else(|| AuthFailure::Internal(format!("scheme '{name}' is not registered")))?;
            challenges.extend(scheme.challenge());

            let Some(credentials) = scheme.kind.extract(&ctx.request) else {
                trace!(scheme = %scheme.name, request_id = %ctx.request_id, "No credentials for scheme");
                continue;
            };
            presented = true;

            if !self.validate(&scheme, &credentials, ctx).await {
                debug!(scheme = %scheme.name, request_id = %ctx.request_id, "Credentials rejected");
                continue;
            }

            let name = credentials.principal().unwrap_or(&scheme.name).to_string();
            let identity = Identity::authenticated(name, scheme.name.clone());
            let identity = self.issue_claims(&scheme, &credentials, identity, ctx).await?;

            debug!(
                scheme = %scheme.name,
                identity = identity.name.as_deref().unwrap_or_default(),
                claims = identity.claims.len(),
                request_id = %ctx.request_id,
                "Caller authenticated"
            );
            return Ok(identity);
        }

        let message = if presented {
            "credentials were rejected"
        } else {
            "no credentials supplied"
        };
        Err(AuthFailure::Unauthenticated {
            message: message.to_string(),
            challenges,
        })
    }

    async fn validate(
        &self,
        scheme: &AuthScheme,
        credentials: &Credentials,
        ctx: &ExecutionContext,
    ) -> bool {
        let Some(validator) = &scheme.validator else {
            warn!(scheme = %scheme.name, "Scheme has no validator; rejecting credentials");
            return false;
        };

        let delegate_ctx = delegate_context(ctx, credentials, None);
        let mut sink = ResponseSink::new();
        match validator.invoke(&delegate_ctx, &mut sink).await {
            Ok(output) => output.is_accepted(),
            Err(err) => {
                warn!(scheme = %scheme.name, error = %err, "Validator failed; rejecting credentials");
                false
            }
        }
    }

    async fn issue_claims(
        &self,
        scheme: &AuthScheme,
        credentials: &Credentials,
        identity: Identity,
        ctx: &ExecutionContext,
    ) -> std::result::Result<Identity, AuthFailure> {
        let Some(issuer) = &scheme.claim_issuer else {
            return Ok(identity);
        };

        let delegate_ctx = delegate_context(ctx, credentials, Some(&identity));
        let mut sink = ResponseSink::new();
        match issuer.invoke(&delegate_ctx, &mut sink).await {
            Ok(HandlerOutput::Claims(claims)) => Ok(identity.with_claims(claims)),
            Ok(other) => Err(AuthFailure::Internal(format!(
                "claim issuer for '{}' produced {other:?}",
                scheme.name
            ))),
            Err(err) => {
                warn!(scheme = %scheme.name, error = %err, "Claim issuer failed");
                Err(AuthFailure::Internal(err.to_string()))
            }
        }
    }

    /// Check an identity against each named policy
    pub fn authorize(
        &self,
        policies: &[String],
        identity: &Identity,
    ) -> std::result::Result<(), AuthFailure> {
        for name in policies {
            let policy = self
                .policy(name)
                .ok_or_else(|| AuthFailure::Internal(format!("policy '{name}' is not registered")))?;

            match policy.evaluate(identity) {
                Ok(()) => {}
                Err(PolicyViolation::Unauthenticated) => {
                    return Err(AuthFailure::unauthenticated(format!(
                        "policy '{}' requires an authenticated caller",
                        policy.name
                    )));
                }
                Err(PolicyViolation::Scheme(scheme)) => {
                    return Err(AuthFailure::Forbidden(format!(
                        "policy '{}' does not accept scheme '{scheme}'",
                        policy.name
                    )));
                }
                Err(PolicyViolation::MissingClaim(kind)) => {
                    return Err(AuthFailure::Forbidden(format!(
                        "policy '{}' requires claim '{kind}'",
                        policy.name
                    )));
                }
            }
        }
        Ok(())
    }

    /// Registered scheme names
    pub fn scheme_names(&self) -> Vec<String> {
        self.schemes.iter().map(|s| s.name.clone()).collect()
    }

    /// Registered policy names
    pub fn policy_names(&self) -> Vec<String> {
        self.policies.iter().map(|p| p.name.clone()).collect()
    }
}

fn expect_kind(handler: &CompiledHandler, kind: ResultKind) -> Result<()> {
    if handler.result_kind() == kind {
        Ok(())
    } else {
        Err(Error::validation(format!(
            "handler '{}' returns {:?}, expected {kind:?}",
            handler.name(),
            handler.result_kind()
        )))
    }
}

fn delegate_context(
    ctx: &ExecutionContext,
    credentials: &Credentials,
    identity: Option<&Identity>,
) -> ExecutionContext {
    let mut locals = credentials.to_locals();
    if let Some(identity) = identity {
        let name = identity.name.clone().unwrap_or_default();
        locals.insert(Binding::typed(
            IDENTITY_NAME_LOCAL,
            Value::String(name),
            ValueKind::String,
        ));
    }
    ExecutionContext {
        request: ctx.request.clone(),
        globals: ctx.globals.clone(),
        locals,
        identity: identity.cloned(),
        request_id: ctx.request_id,
    }
}
