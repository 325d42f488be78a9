mod common;

use anyhow::Result;
use reqwest::StatusCode;
use serde_json::json;

async fn login(
    server: &common::TestServer,
    client: &reqwest::Client,
    tenant_id: uuid::Uuid,
) -> Result<serde_json::Value> {
    let res = client
        .post(format!("{}/auth/login", server.base_url))
        .json(&json!({
            "username": "alice",
            "password": "Hunter2!!Hunter2",
            "tenant_id": tenant_id,
        }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    Ok(res.json().await?)
}

/// Rotation and reuse detection, end to end: refresh once, replay the old
/// token, observe the breach response.
#[tokio::test]
async fn refresh_rotation_and_reuse_detection() -> Result<()> {
    let server = common::spawn_server().await?;
    let client = reqwest::Client::new();

    let tenant = common::create_tenant(&server.state, "acme", "acme.example").await;
    let alice =
        common::create_user(&server.state, Some(tenant.id), "alice", "Hunter2!!Hunter2").await;

    let tokens = login(&server, &client, tenant.id).await?;
    let r1 = tokens["refresh_token"].as_str().unwrap().to_string();
    let a1 = tokens["access_token"].as_str().unwrap().to_string();

    // Rotate: new pair, R1 dead.
    let res = client
        .post(format!("{}/auth/token/refresh", server.base_url))
        .json(&json!({ "refresh_token": r1 }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await?;
    let r2 = body["refresh_token"].as_str().unwrap().to_string();
    assert_ne!(r1, r2);

    // Replay R1: reuse detected, everything revoked.
    let res = client
        .post(format!("{}/auth/token/refresh", server.base_url))
        .json(&json!({ "refresh_token": r1 }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    let active = server
        .state
        .storage
        .refresh_tokens
        .count_active_for_user(alice.id)
        .await
        .unwrap();
    assert_eq!(active, 0);

    // R2 died with the breach response too.
    let res = client
        .post(format!("{}/auth/token/refresh", server.base_url))
        .json(&json!({ "refresh_token": r2 }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    // Access tokens keep validating until their natural expiry.
    let res = client
        .get(format!("{}/auth/whoami", server.base_url))
        .bearer_auth(&a1)
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    Ok(())
}

#[tokio::test]
async fn revoke_and_logout() -> Result<()> {
    let server = common::spawn_server().await?;
    let client = reqwest::Client::new();

    let tenant = common::create_tenant(&server.state, "acme", "acme.example").await;
    let alice =
        common::create_user(&server.state, Some(tenant.id), "alice", "Hunter2!!Hunter2").await;

    let tokens = login(&server, &client, tenant.id).await?;
    let access = tokens["access_token"].as_str().unwrap().to_string();
    let refresh = tokens["refresh_token"].as_str().unwrap().to_string();

    // Revoke the refresh token explicitly.
    let res = client
        .post(format!("{}/auth/token/revoke", server.base_url))
        .bearer_auth(&access)
        .json(&json!({ "refresh_token": refresh }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .post(format!("{}/auth/token/refresh", server.base_url))
        .json(&json!({ "refresh_token": refresh }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    // A fresh session, ended by logout without a body: all tokens revoked.
    let tokens = login(&server, &client, tenant.id).await?;
    let access = tokens["access_token"].as_str().unwrap().to_string();
    let res = client
        .post(format!("{}/auth/logout", server.base_url))
        .bearer_auth(&access)
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    let active = server
        .state
        .storage
        .refresh_tokens
        .count_active_for_user(alice.id)
        .await
        .unwrap();
    assert_eq!(active, 0);
    Ok(())
}

#[tokio::test]
async fn introspection_reports_token_state() -> Result<()> {
    let server = common::spawn_server().await?;
    let client = reqwest::Client::new();

    let tenant = common::create_tenant(&server.state, "acme", "acme.example").await;
    common::create_user(&server.state, Some(tenant.id), "alice", "Hunter2!!Hunter2").await;

    let tokens = login(&server, &client, tenant.id).await?;
    let access = tokens["access_token"].as_str().unwrap().to_string();

    let res = client
        .post(format!("{}/auth/token/introspect", server.base_url))
        .bearer_auth(&access)
        .json(&json!({ "token": access }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await?;
    assert_eq!(body["active"], true);
    assert_eq!(body["token_type"], "Bearer");

    let res = client
        .post(format!("{}/auth/token/introspect", server.base_url))
        .bearer_auth(&access)
        .json(&json!({ "token": "garbage" }))
        .send()
        .await?;
    let body: serde_json::Value = res.json().await?;
    assert_eq!(body["active"], false);
    Ok(())
}

#[tokio::test]
async fn whoami_requires_a_valid_bearer() -> Result<()> {
    let server = common::spawn_server().await?;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/auth/whoami", server.base_url))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);

    let res = client
        .get(format!("{}/auth/whoami", server.base_url))
        .bearer_auth("not.a.token")
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    Ok(())
}

#[tokio::test]
async fn jwks_endpoint_is_public() -> Result<()> {
    let server = common::spawn_server().await?;
    let client = reqwest::Client::new();

    let res = client
        .get(format!("{}/.well-known/jwks.json", server.base_url))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await?;
    // HS256 development fallback publishes no keys, but the shape holds.
    assert!(body["keys"].is_array());
    Ok(())
}
