//! Resolver tests against a canned Cumulocity REST surface.

mod support;

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use c8ylp_core::{AcceptorMode, ExitStatus, LocalEndpoint, ProxyError};
use c8ylp_proxy::{
    BridgeConfig, Credentials, CumulocityResolver, ResolveRequest, RunOptions, Supervisor,
};

use support::{MockRest, MockResponse};

const LOGIN_OPTIONS: &str = r#"{
    "loginOptions": [
        {"type": "OAUTH2", "initRequest": "https://sso.example.com/oauth?tenant_id=ssotenant"},
        {"type": "OAUTH2_INTERNAL", "initRequest": "https://x.y/tenant/oauth?tenant_id=t123"}
    ]
}"#;

fn request_for(rest: &MockRest, token: &str) -> ResolveRequest {
    ResolveRequest {
        host: rest.base_url(),
        tenant: None,
        credentials: Credentials {
            token: Some(token.to_string()),
            ..Default::default()
        },
        device: "d01".into(),
        external_type: "c8y_Serial".into(),
        config_name: "Passthrough".into(),
        verify_tls: true,
    }
}

/// The default happy-path REST surface.
async fn happy_rest() -> MockRest {
    MockRest::spawn(|_, path, _| match path {
        "/tenant/loginOptions" => MockResponse::json(200, LOGIN_OPTIONS),
        "/tenant/currentTenant" => MockResponse::json(200, r#"{"name": "t123"}"#),
        "/identity/externalIds/c8y_Serial/d01" => MockResponse::json(
            200,
            r#"{"externalId": "d01", "managedObject": {"id": "4711"}}"#,
        ),
        "/service/remoteaccess/devices/4711/configurations" => MockResponse::json(
            200,
            r#"[
                {"id": "7", "name": "webssh", "protocol": "SSH"},
                {"id": "42", "name": "Passthrough", "protocol": "PASSTHROUGH"}
            ]"#,
        ),
        _ => MockResponse::json(404, r#"{"message": "not found"}"#),
    })
    .await
}

#[tokio::test]
async fn full_resolve_builds_descriptor() {
    let rest = happy_rest().await;
    let request = request_for(&rest, "tok");

    let resolver = CumulocityResolver::new(&request.host, true).unwrap();
    let descriptor = resolver.resolve(&request).await.unwrap();

    assert_eq!(descriptor.tenant, "t123");
    assert_eq!(descriptor.device_id, "4711");
    assert_eq!(descriptor.config_id, "42");
    assert!(descriptor
        .tunnel_url()
        .as_str()
        .ends_with("/service/remoteaccess/client/4711/configurations/42"));
    // http base maps to a ws tunnel scheme.
    assert!(descriptor.tunnel_url().as_str().starts_with("ws://"));
}

#[tokio::test]
async fn tenant_discovery_prefers_internal_option() {
    let rest = happy_rest().await;
    let resolver = CumulocityResolver::new(&rest.base_url(), true).unwrap();
    assert_eq!(resolver.resolve_tenant().await.unwrap(), "t123");
}

#[tokio::test]
async fn explicit_tenant_skips_discovery() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counted = hits.clone();
    let rest = MockRest::spawn(move |_, path, _| {
        if path == "/tenant/loginOptions" {
            counted.fetch_add(1, Ordering::SeqCst);
        }
        match path {
            "/tenant/currentTenant" => MockResponse::json(200, r#"{"name": "t9"}"#),
            "/identity/externalIds/c8y_Serial/d01" => {
                MockResponse::json(200, r#"{"managedObject": {"id": "1"}}"#)
            }
            "/service/remoteaccess/devices/1/configurations" => {
                MockResponse::json(200, r#"[{"id": "2", "name": "Passthrough"}]"#)
            }
            _ => MockResponse::json(404, "{}"),
        }
    })
    .await;

    let mut request = request_for(&rest, "tok");
    request.tenant = Some("t9".into());
    let resolver = CumulocityResolver::new(&request.host, true).unwrap();
    let descriptor = resolver.resolve(&request).await.unwrap();

    assert_eq!(descriptor.tenant, "t9");
    assert_eq!(hits.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn bad_token_is_auth_error() {
    let rest = MockRest::spawn(|_, path, _| match path {
        "/tenant/loginOptions" => MockResponse::json(200, LOGIN_OPTIONS),
        "/tenant/currentTenant" => MockResponse::json(401, r#"{"message": "invalid token"}"#),
        _ => MockResponse::json(404, "{}"),
    })
    .await;

    let request = request_for(&rest, "BAD");
    let resolver = CumulocityResolver::new(&request.host, true).unwrap();
    let err = resolver.resolve(&request).await.unwrap_err();
    assert!(matches!(err, ProxyError::Auth(_)), "{err}");
}

#[tokio::test]
async fn missing_device_is_device_not_found() {
    let rest = MockRest::spawn(|_, path, _| match path {
        "/tenant/loginOptions" => MockResponse::json(200, LOGIN_OPTIONS),
        "/tenant/currentTenant" => MockResponse::json(200, "{}"),
        _ => MockResponse::json(404, r#"{"message": "no such identity"}"#),
    })
    .await;

    let request = request_for(&rest, "tok");
    let resolver = CumulocityResolver::new(&request.host, true).unwrap();
    let err = resolver.resolve(&request).await.unwrap_err();
    assert!(matches!(err, ProxyError::DeviceNotFound(_)), "{err}");
}

#[tokio::test]
async fn configuration_name_match_is_case_sensitive() {
    let rest = MockRest::spawn(|_, path, _| match path {
        "/tenant/loginOptions" => MockResponse::json(200, LOGIN_OPTIONS),
        "/tenant/currentTenant" => MockResponse::json(200, "{}"),
        "/identity/externalIds/c8y_Serial/d01" => {
            MockResponse::json(200, r#"{"managedObject": {"id": "4711"}}"#)
        }
        "/service/remoteaccess/devices/4711/configurations" => {
            MockResponse::json(200, r#"[{"id": "42", "name": "passthrough"}]"#)
        }
        _ => MockResponse::json(404, "{}"),
    })
    .await;

    let request = request_for(&rest, "tok");
    let resolver = CumulocityResolver::new(&request.host, true).unwrap();
    let err = resolver.resolve(&request).await.unwrap_err();
    assert!(matches!(err, ProxyError::ConfigurationNotFound(_)), "{err}");
}

#[tokio::test]
async fn transient_5xx_is_retried() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counted = attempts.clone();
    let rest = MockRest::spawn(move |_, path, _| {
        if path == "/tenant/currentTenant" {
            let n = counted.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                return MockResponse::json(503, r#"{"message": "try later"}"#);
            }
            return MockResponse::json(200, "{}");
        }
        MockResponse::json(404, "{}")
    })
    .await;

    let resolver = CumulocityResolver::new(&rest.base_url(), true).unwrap();
    resolver.validate_token("tok").await.unwrap();
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn auth_failures_are_not_retried() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counted = attempts.clone();
    let rest = MockRest::spawn(move |_, path, _| {
        if path == "/tenant/currentTenant" {
            counted.fetch_add(1, Ordering::SeqCst);
        }
        MockResponse::json(401, "{}")
    })
    .await;

    let resolver = CumulocityResolver::new(&rest.base_url(), true).unwrap();
    let err = resolver.validate_token("tok").await.unwrap_err();
    assert!(matches!(err, ProxyError::Auth(_)));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn persistent_5xx_is_service_unavailable() {
    let rest = MockRest::spawn(|_, _, _| MockResponse::json(503, "{}")).await;

    let resolver = CumulocityResolver::new(&rest.base_url(), true).unwrap();
    let err = resolver.validate_token("tok").await.unwrap_err();
    assert!(matches!(err, ProxyError::TunnelUnavailable(_)), "{err}");
}

#[tokio::test]
async fn oauth_login_extracts_cookie_token() {
    let rest = MockRest::spawn(|method, path, body| {
        if method == "POST" && path.starts_with("/tenant/oauth") {
            assert!(body.contains("grant_type=PASSWORD"));
            assert!(body.contains("username=alice"));
            return MockResponse::json(200, "{}")
                .with_header("Set-Cookie", "authorization=tok-from-cookie; Path=/");
        }
        MockResponse::json(404, "{}")
    })
    .await;

    let resolver = CumulocityResolver::new(&rest.base_url(), true).unwrap();
    let token = resolver
        .login_oauth("t123", "alice", "secret", None)
        .await
        .unwrap();
    assert_eq!(token, "tok-from-cookie");
}

#[tokio::test]
async fn oauth_login_reports_missing_tfa() {
    let rest = MockRest::spawn(|method, path, _| {
        if method == "POST" && path.starts_with("/tenant/oauth") {
            return MockResponse::json(401, r#"{"message": "TFA TOTP code required"}"#);
        }
        MockResponse::json(404, "{}")
    })
    .await;

    let resolver = CumulocityResolver::new(&rest.base_url(), true).unwrap();
    let err = resolver
        .login_oauth("t123", "alice", "secret", None)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Auth(_)));
    assert!(err.to_string().contains("TFA"), "{err}");
}

#[tokio::test]
async fn supervisor_maps_auth_failure_without_binding() {
    let rest = MockRest::spawn(|_, path, _| match path {
        "/tenant/loginOptions" => MockResponse::json(200, LOGIN_OPTIONS),
        _ => MockResponse::json(401, "{}"),
    })
    .await;

    let bound = Arc::new(AtomicBool::new(false));
    let bound_flag = bound.clone();

    let supervisor = Supervisor::new();
    let status = supervisor
        .run(
            RunOptions {
                resolve: request_for(&rest, "BAD"),
                endpoint: LocalEndpoint::loopback(0),
                mode: AcceptorMode::OneShot,
                bridge: BridgeConfig::default(),
            },
            move |_| {
                bound_flag.store(true, Ordering::SeqCst);
            },
        )
        .await;

    assert_eq!(status, ExitStatus::AuthFailed);
    assert!(!bound.load(Ordering::SeqCst), "no port must be bound");
}

#[tokio::test]
async fn supervisor_maps_missing_device() {
    let rest = MockRest::spawn(|_, path, _| match path {
        "/tenant/loginOptions" => MockResponse::json(200, LOGIN_OPTIONS),
        "/tenant/currentTenant" => MockResponse::json(200, "{}"),
        _ => MockResponse::json(404, "{}"),
    })
    .await;

    let supervisor = Supervisor::new();
    let status = supervisor
        .run(
            RunOptions {
                resolve: request_for(&rest, "tok"),
                endpoint: LocalEndpoint::loopback(0),
                mode: AcceptorMode::OneShot,
                bridge: BridgeConfig::default(),
            },
            |_| {},
        )
        .await;

    assert_eq!(status, ExitStatus::DeviceNotFound);
}

#[tokio::test]
async fn supervisor_maps_port_in_use() {
    let rest = happy_rest().await;

    // Occupy a port, then ask the supervisor for the same one.
    let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let taken = blocker.local_addr().unwrap().port();

    let supervisor = Supervisor::new();
    let status = tokio::time::timeout(
        Duration::from_secs(10),
        supervisor.run(
            RunOptions {
                resolve: request_for(&rest, "tok"),
                endpoint: LocalEndpoint::loopback(taken),
                mode: AcceptorMode::OneShot,
                bridge: BridgeConfig::default(),
            },
            |_| {},
        ),
    )
    .await
    .unwrap();

    assert_eq!(status, ExitStatus::PortInUse);
}
