//! Authentication schemes and credential extraction

use base64::{engine::general_purpose::STANDARD, Engine as _};
use nautilus_core::{Binding, BindingTable, ValueKind};
use nautilus_scripting::{CompiledHandler, RequestData};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default header carrying API keys
pub const DEFAULT_API_KEY_HEADER: &str = "X-Api-Key";

/// Local naming the accepted caller inside claim issuers
pub const IDENTITY_NAME_LOCAL: &str = "identity_name";

/// How a scheme reads credentials from a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchemeKind {
    /// `Authorization: Basic base64(user:password)`
    Basic,
    /// Key in a request header
    ApiKey {
        /// Header name
        #[serde(default = "default_api_key_header")]
        header: String,
    },
    /// `Authorization: Bearer <token>`
    Bearer,
}

fn default_api_key_header() -> String {
    DEFAULT_API_KEY_HEADER.to_string()
}

impl SchemeKind {
    /// API key scheme reading the default header
    pub fn api_key() -> Self {
        SchemeKind::ApiKey {
            header: default_api_key_header(),
        }
    }

    /// Pull credentials for this scheme out of a request
    pub fn extract(&self, request: &RequestData) -> Option<Credentials> {
        match self {
            SchemeKind::Basic => {
                let encoded = authorization_param(request, "basic")?;
                let decoded = STANDARD.decode(encoded).ok()?;
                let text = String::from_utf8(decoded).ok()?;
                let (username, password) = text.split_once(':')?;
                Some(Credentials::Basic {
                    username: username.to_string(),
                    password: password.to_string(),
                })
            }
            SchemeKind::ApiKey { header } => request
                .header(header)
                .map(str::trim)
                .filter(|key| !key.is_empty())
                .map(|key| Credentials::ApiKey {
                    key: key.to_string(),
                }),
            SchemeKind::Bearer => {
                authorization_param(request, "bearer").map(|token| Credentials::Bearer {
                    token: token.to_string(),
                })
            }
        }
    }

    /// Names and kinds of the locals a validator for this scheme receives
    pub fn credential_locals(&self) -> BindingTable {
        let names: &[&str] = match self {
            SchemeKind::Basic => &["username", "password"],
            SchemeKind::ApiKey { .. } => &["key"],
            SchemeKind::Bearer => &["token"],
        };
        names
            .iter()
            .map(|name| Binding::typed(*name, Value::String(String::new()), ValueKind::String))
            .collect()
    }

    /// Locals a claim issuer for this scheme receives
    pub fn claim_issuer_locals(&self) -> BindingTable {
        let mut locals = self.credential_locals();
        locals.insert(Binding::typed(
            IDENTITY_NAME_LOCAL,
            Value::String(String::new()),
            ValueKind::String,
        ));
        locals
    }

    /// Name used in logs and configuration
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemeKind::Basic => "basic",
            SchemeKind::ApiKey { .. } => "api_key",
            SchemeKind::Bearer => "bearer",
        }
    }
}

fn authorization_param<'a>(request: &'a RequestData, scheme: &str) -> Option<&'a str> {
    let value = request.header("authorization")?.trim();
    let (name, param) = value.split_once(' ')?;
    if !name.eq_ignore_ascii_case(scheme) {
        return None;
    }
    Some(param.trim()).filter(|p| !p.is_empty())
}

/// Credentials presented by a caller
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    /// User name and password
    Basic {
        /// User name
        username: String,
        /// Password
        password: String,
    },
    /// API key
    ApiKey {
        /// Key
        key: String,
    },
    /// Bearer token
    Bearer {
        /// Token
        token: String,
    },
}

impl Credentials {
    /// Locals handed to validator and claim issuer scripts
    pub fn to_locals(&self) -> BindingTable {
        let pairs: Vec<(&str, &str)> = match self {
            Credentials::Basic { username, password } => {
                vec![("username", username.as_str()), ("password", password.as_str())]
            }
            Credentials::ApiKey { key } => vec![("key", key.as_str())],
            Credentials::Bearer { token } => vec![("token", token.as_str())],
        };
        pairs
            .into_iter()
            .map(|(name, value)| {
                Binding::typed(name, Value::String(value.to_string()), ValueKind::String)
            })
            .collect()
    }

    /// Name the identity takes when no claim issuer renames it
    pub fn principal(&self) -> Option<&str> {
        match self {
            Credentials::Basic { username, .. } => Some(username.as_str()),
            Credentials::ApiKey { .. } | Credentials::Bearer { .. } => None,
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credentials::ApiKey { .. } => f.write_str("ApiKey(<redacted>)"),
            Credentials::Bearer { .. } => f.write_str("Bearer(<redacted>)"),
        }
    }
}

/// Registered scheme with its script delegates
#[derive(Debug, Clone)]
pub struct AuthScheme {
    /// Scheme name referenced by routes
    pub name: String,

    /// Credential format
    pub kind: SchemeKind,

    /// Realm advertised in challenges
    pub realm: Option<String>,

    /// Script deciding whether credentials are valid
    pub validator: Option<CompiledHandler>,

    /// Script producing claims for an accepted caller
    pub claim_issuer: Option<CompiledHandler>,
}

impl AuthScheme {
    /// Scheme without delegates
    pub fn new(name: impl Into<String>, kind: SchemeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            realm: None,
            validator: None,
            claim_issuer: None,
        }
    }

    /// Set the challenge realm
    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = Some(realm.into());
        self
    }

    /// `WWW-Authenticate` value, if the scheme issues challenges
    pub fn challenge(&self) -> Option<String> {
        let realm = self.realm.as_deref().unwrap_or(&self.name);
        match self.kind {
            SchemeKind::Basic => Some(format!("Basic realm=\"{realm}\", charset=\"UTF-8\"")),
            SchemeKind::Bearer => Some(format!("Bearer realm=\"{realm}\"")),
            SchemeKind::ApiKey { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::Request;

    fn request(name: &str, value: &str) -> RequestData {
        let (parts, _) = Request::builder()
            .uri("/secure")
            .header(name, value)
            .body(())
            .unwrap()
            .into_parts();
        RequestData::from_parts(&parts, Default::default())
    }

    #[test]
    fn test_basic_credentials() {
        let encoded = STANDARD.encode("alice:s3cr:et");
        let creds = SchemeKind::Basic
            .extract(&request("Authorization", &format!("Basic {encoded}")))
            .unwrap();

        assert_eq!(
            creds,
            Credentials::Basic {
                username: "alice".to_string(),
                password: "s3cr:et".to_string(),
            }
        );
        assert_eq!(creds.principal(), Some("alice"));
        assert!(!format!("{creds:?}").contains("s3cr"));

        assert!(SchemeKind::Basic
            .extract(&request("Authorization", "Basic not-base64!"))
            .is_none());
        assert!(SchemeKind::Basic
            .extract(&request("Authorization", "Bearer abc"))
            .is_none());
    }

    #[test]
    fn test_bearer_and_api_key() {
        let creds = SchemeKind::Bearer
            .extract(&request("Authorization", "bearer abc.def"))
            .unwrap();
        assert_eq!(
            creds.to_locals().get("token").map(|b| b.value.clone()),
            Some(Value::String("abc.def".to_string()))
        );

        let kind = SchemeKind::ApiKey {
            header: "X-Token".to_string(),
        };
        assert!(kind.extract(&request("x-token", "k-1")).is_some());
        assert!(kind.extract(&request("x-api-key", "k-1")).is_none());
        assert!(SchemeKind::api_key().extract(&request("X-Api-Key", " ")).is_none());
    }

    #[test]
    fn test_challenges() {
        assert_eq!(
            AuthScheme::new("Admin", SchemeKind::Basic).challenge().as_deref(),
            Some("Basic realm=\"Admin\", charset=\"UTF-8\"")
        );
        assert_eq!(
            AuthScheme::new("Api", SchemeKind::Bearer)
                .with_realm("api")
                .challenge()
                .as_deref(),
            Some("Bearer realm=\"api\"")
        );
        assert!(AuthScheme::new("Keys", SchemeKind::api_key()).challenge().is_none());
    }

    #[test]
    fn test_scheme_kind_serde() {
        let kind: SchemeKind = serde_json::from_str(r#"{"type":"api_key"}"#).unwrap();
        assert_eq!(kind, SchemeKind::api_key());

        let kind: SchemeKind = serde_json::from_str(r#"{"type":"basic"}"#).unwrap();
        assert_eq!(kind, SchemeKind::Basic);
    }
}
