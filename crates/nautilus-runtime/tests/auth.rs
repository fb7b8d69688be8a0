//! Authentication and authorization on script routes

mod common;

use base64::{engine::general_purpose, Engine as _};
use bytes::Bytes;
use common::{body_text, get, send};
use http::{header, Method, Request, StatusCode};
use http_body_util::Full;
use nautilus_auth::{AuthPolicy, AuthScheme, ClaimRequirement, SchemeKind};
use nautilus_core::Error;
use nautilus_runtime::{HostError, RouteRegistration, ScriptHost};
use nautilus_scripting::ScriptLanguage;

fn basic(path: &str, user: &str, password: &str) -> Request<Full<Bytes>> {
    let token = general_purpose::STANDARD.encode(format!("{user}:{password}"));
    Request::builder()
        .method(Method::GET)
        .uri(path)
        .header(header::AUTHORIZATION, format!("Basic {token}"))
        .body(Full::new(Bytes::new()))
        .unwrap()
}

async fn admin_host() -> ScriptHost {
    let host = ScriptHost::default();
    host.register_scheme(AuthScheme::new("Admin", SchemeKind::Basic).with_realm("ops"))
        .unwrap();
    host.register_validator("Admin", ScriptLanguage::Rhai, r#"password == "hunter2""#)
        .await
        .unwrap();
    host.register_claim_issuer(
        "Admin",
        ScriptLanguage::Rhai,
        r#"if username == "root" { #{ role: "admin" } } else { #{ role: "viewer" } }"#,
    )
    .await
    .unwrap();
    host.register_policy(AuthPolicy::new("Admins").require_claim(ClaimRequirement::with_value("role", "admin")))
        .unwrap();

    host.register(
        RouteRegistration::new(
            "/admin",
            ScriptLanguage::Rhai,
            r#"response.write("hello " + identity.name);"#,
        )
        .auth_scheme("Admin")
        .auth_policy("Admins"),
    )
    .await
    .unwrap();
    host
}

#[tokio::test]
async fn test_missing_credentials_challenge() {
    let host = admin_host().await;
    let response = get(&host, "/admin").await;

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(
        response.headers()[header::WWW_AUTHENTICATE],
        r#"Basic realm="ops", charset="UTF-8""#
    );
}

#[tokio::test]
async fn test_wrong_password_is_unauthorized() {
    let host = admin_host().await;
    let response = send(&host, basic("/admin", "root", "guess")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_missing_claim_is_forbidden() {
    let host = admin_host().await;
    let response = send(&host, basic("/admin", "guest", "hunter2")).await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert!(response.headers().get(header::WWW_AUTHENTICATE).is_none());
}

#[tokio::test]
async fn test_accepted_caller_reaches_handler() {
    let host = admin_host().await;
    let response = send(&host, basic("/admin", "root", "hunter2")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "hello root");
}

#[tokio::test]
async fn test_api_key_validated_by_shell() {
    let host = ScriptHost::default();
    host.register_scheme(AuthScheme::new("Keys", SchemeKind::api_key()))
        .unwrap();
    host.register_validator("Keys", ScriptLanguage::Shell, "$key -eq 'k-123'")
        .await
        .unwrap();
    host.register(
        RouteRegistration::new("/data", ScriptLanguage::Basic, "Response.Status = 204")
            .auth_scheme("keys"),
    )
    .await
    .unwrap();

    let request = Request::builder()
        .uri("/data")
        .header("X-Api-Key", "k-123")
        .body(Full::new(Bytes::new()))
        .unwrap();
    assert_eq!(send(&host, request).await.status(), StatusCode::NO_CONTENT);

    let request = Request::builder()
        .uri("/data")
        .header("X-Api-Key", "nope")
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = send(&host, request).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(response.headers().get(header::WWW_AUTHENTICATE).is_none());
}

#[tokio::test]
async fn test_policy_without_scheme_rejects_anonymous() {
    let host = ScriptHost::default();
    host.register_policy(AuthPolicy::new("Members")).unwrap();
    host.register(
        RouteRegistration::new("/members", ScriptLanguage::Rhai, "response.status = 204;")
            .auth_policy("Members"),
    )
    .await
    .unwrap();

    assert_eq!(get(&host, "/members").await.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_invalid_delegates_fail_to_register() {
    let host = ScriptHost::default();
    host.register_scheme(AuthScheme::new("Admin", SchemeKind::Basic))
        .unwrap();

    let err = host
        .register_validator("Admin", ScriptLanguage::Rhai, "undeclared_name == 1")
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::Script(_)));

    let err = host
        .register_claim_issuer("Other", ScriptLanguage::Rhai, "#{}")
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::Core(Error::UnknownScheme(_))));
}

#[tokio::test]
async fn test_duplicate_scheme() {
    let host = ScriptHost::default();
    host.register_scheme(AuthScheme::new("Admin", SchemeKind::Basic))
        .unwrap();
    let err = host
        .register_scheme(AuthScheme::new("admin", SchemeKind::Bearer))
        .unwrap_err();
    assert!(err.is_duplicate());
}
