//! Authorization policies

use nautilus_scripting::Identity;
use serde::{Deserialize, Serialize};

/// Claim a policy requires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRequirement {
    /// Claim kind, compared case-insensitively
    #[serde(rename = "type")]
    pub kind: String,

    /// Required value; `None` or `"*"` accept any value
    #[serde(default)]
    pub value: Option<String>,
}

impl ClaimRequirement {
    /// Require a claim kind with any value
    pub fn any(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: None,
        }
    }

    /// Require a claim kind with a specific value
    pub fn with_value(kind: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            value: Some(value.into()),
        }
    }

    fn is_met_by(&self, identity: &Identity) -> bool {
        identity.has_claim(&self.kind, self.value.as_deref())
    }
}

/// Why a policy refused an identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyViolation {
    /// Caller is anonymous
    Unauthenticated,
    /// Caller authenticated through a scheme the policy does not allow
    Scheme(String),
    /// Caller lacks a required claim
    MissingClaim(String),
}

/// Named set of requirements a caller must satisfy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthPolicy {
    /// Policy name referenced by routes
    pub name: String,

    /// Caller must be authenticated
    #[serde(default = "default_true")]
    pub require_authenticated: bool,

    /// Caller must have been authenticated by one of these schemes
    #[serde(default)]
    pub schemes: Vec<String>,

    /// Claims the caller must hold
    #[serde(default)]
    pub claims: Vec<ClaimRequirement>,
}

fn default_true() -> bool {
    true
}

impl AuthPolicy {
    /// Policy that only requires authentication
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            require_authenticated: true,
            schemes: Vec::new(),
            claims: Vec::new(),
        }
    }

    /// Allow anonymous callers
    pub fn allow_anonymous(mut self) -> Self {
        self.require_authenticated = false;
        self
    }

    /// Restrict to a scheme
    pub fn require_scheme(mut self, scheme: impl Into<String>) -> Self {
        self.schemes.push(scheme.into());
        self
    }

    /// Require a claim
    pub fn require_claim(mut self, claim: ClaimRequirement) -> Self {
        self.claims.push(claim);
        self
    }

    /// Check an identity against the policy
    pub fn evaluate(&self, identity: &Identity) -> Result<(), PolicyViolation> {
        let needs_identity =
            self.require_authenticated || !self.schemes.is_empty() || !self.claims.is_empty();
        if needs_identity && !identity.authenticated {
            return Err(PolicyViolation::Unauthenticated);
        }

        if !self.schemes.is_empty() {
            let scheme = identity.scheme.as_deref().unwrap_or_default();
            if !self.schemes.iter().any(|s| s.eq_ignore_ascii_case(scheme)) {
                return Err(PolicyViolation::Scheme(scheme.to_string()));
            }
        }

        match self.claims.iter().find(|claim| !claim.is_met_by(identity)) {
            Some(missing) => Err(PolicyViolation::MissingClaim(missing.kind.clone())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nautilus_scripting::Claim;

    #[test]
    fn test_authentication_required() {
        let policy = AuthPolicy::new("Users");
        assert_eq!(
            policy.evaluate(&Identity::anonymous()),
            Err(PolicyViolation::Unauthenticated)
        );
        assert!(policy
            .evaluate(&Identity::authenticated("alice", "Basic"))
            .is_ok());

        assert!(AuthPolicy::new("Open")
            .allow_anonymous()
            .evaluate(&Identity::anonymous())
            .is_ok());
    }

    #[test]
    fn test_scheme_restriction() {
        let policy = AuthPolicy::new("AdminOnly").require_scheme("admin");
        assert!(policy
            .evaluate(&Identity::authenticated("root", "Admin"))
            .is_ok());
        assert_eq!(
            policy.evaluate(&Identity::authenticated("alice", "Basic")),
            Err(PolicyViolation::Scheme("Basic".to_string()))
        );
    }

    #[test]
    fn test_claims() {
        let identity = Identity::authenticated("alice", "Basic").with_claims([
            Claim::new("role", "editor"),
            Claim::new("dept", "sales"),
        ]);

        let editors = AuthPolicy::new("Editors")
            .require_claim(ClaimRequirement::with_value("Role", "editor"));
        assert!(editors.evaluate(&identity).is_ok());

        let any_dept = AuthPolicy::new("Staff").require_claim(ClaimRequirement::with_value("dept", "*"));
        assert!(any_dept.evaluate(&identity).is_ok());

        let admins = AuthPolicy::new("Admins")
            .require_claim(ClaimRequirement::with_value("role", "admin"));
        assert_eq!(
            admins.evaluate(&identity),
            Err(PolicyViolation::MissingClaim("role".to_string()))
        );

        let badge = AuthPolicy::new("Badge").require_claim(ClaimRequirement::any("badge"));
        assert!(badge.evaluate(&identity).is_err());
    }

    #[test]
    fn test_policy_deserialize() {
        let policy: AuthPolicy = serde_json::from_str(
            r#"{"name":"Admins","claims":[{"type":"role","value":"admin"}]}"#,
        )
        .unwrap();
        assert!(policy.require_authenticated);
        assert_eq!(policy.claims, vec![ClaimRequirement::with_value("role", "admin")]);
    }
}
