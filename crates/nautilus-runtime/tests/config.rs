//! Building a host from configuration

mod common;

use common::{body_text, get};
use http::StatusCode;
use nautilus_config::{load_from_str, ConfigFormat};
use nautilus_core::Error;
use nautilus_runtime::{HostError, ScriptHost};
use serde_json::json;

const CONFIG: &str = r#"
engine:
  duplicate_policy: reject
  host_name: edge

globals:
  - name: greeting
    value: "Hello"
    read_only: true
  - name: limit
    value: 3
    kind: int

modules:
  - name: helpers
    language: rhai
    source: 'fn shout(s) { s + "!" }'

schemes:
  - name: Admin
    type: basic
    realm: ops
    validator:
      language: rhai
      source: 'username == "root" && password == "hunter2"'

policies:
  - name: Admins
    schemes: [Admin]

routes:
  - pattern: /hello/:name
    methods: [GET]
    language: rhai
    imports: [helpers]
    source: 'response.write(shout(greeting + ", " + request.params.name) + suffix);'
    locals:
      suffix: "?"
  - pattern: /hello/:who
    language: basic
    source: "Response.Status = 500"
  - pattern: /admin
    language: shell
    source: "Set-Status 204"
    auth_schemes: [Admin]
    auth_policies: [Admins]
"#;

#[tokio::test]
async fn test_host_from_config() {
    let config = load_from_str(CONFIG, ConfigFormat::Yaml).unwrap();
    let host = ScriptHost::from_config(config).await.unwrap();

    assert_eq!(host.options().host_name, "edge");
    assert_eq!(host.globals().get("limit"), Some(json!(3)));
    assert!(host.globals().update_value("greeting", json!("Hi")).is_err());

    // The second /hello route is a structural duplicate and was skipped
    assert_eq!(host.router().len(), 2);

    let response = get(&host, "/hello/ann").await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_text(response).await, "Hello, ann!?");

    let response = get(&host, "/admin").await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_scripts_from_files() {
    let dir = tempfile::tempdir().unwrap();
    let script = dir.path().join("ping.rhai");
    std::fs::write(&script, "response.status = 204;").unwrap();

    let config = format!(
        "routes:\n  - pattern: /ping\n    language: rhai\n    file: {}\n",
        script.display()
    );
    let host = ScriptHost::from_config(load_from_str(&config, ConfigFormat::Yaml).unwrap())
        .await
        .unwrap();
    assert_eq!(get(&host, "/ping").await.status(), StatusCode::NO_CONTENT);

    let missing = "routes:\n  - pattern: /gone\n    language: rhai\n    file: /nonexistent/gone.rhai\n";
    let err = ScriptHost::from_config(load_from_str(missing, ConfigFormat::Yaml).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::Io { .. }));
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let config = "routes:\n  - pattern: /admin\n    language: rhai\n    source: 'response.status = 204;'\n    auth_schemes: [Admin]\n";
    let err = ScriptHost::from_config(load_from_str(config, ConfigFormat::Yaml).unwrap())
        .await
        .unwrap_err();
    assert!(matches!(err, HostError::Core(Error::UnknownScheme(_))));
}
