mod common;

use anyhow::Result;
use reqwest::StatusCode;
use serde_json::json;
use uuid::Uuid;

async fn login_token(
    server: &common::TestServer,
    client: &reqwest::Client,
    username: &str,
    tenant_id: Option<Uuid>,
) -> Result<String> {
    let mut body = json!({ "username": username, "password": "Hunter2!!Hunter2" });
    if let Some(tenant_id) = tenant_id {
        body["tenant_id"] = json!(tenant_id);
    }
    let res = client
        .post(format!("{}/auth/login", server.base_url))
        .json(&body)
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK, "login failed for {}", username);
    let body: serde_json::Value = res.json().await?;
    Ok(body["access_token"].as_str().unwrap().to_string())
}

/// Capability gating: the system disables "saml"; the tenant admin's
/// enable-feature call is refused with the layer reason and writes nothing.
#[tokio::test]
async fn feature_enable_refused_when_system_disabled() -> Result<()> {
    let server = common::spawn_server().await?;
    let client = reqwest::Client::new();

    let tenant = common::create_tenant(&server.state, "acme", "acme.example").await;
    let admin =
        common::create_user(&server.state, Some(tenant.id), "admin", "Hunter2!!Hunter2").await;
    common::grant_role(&server.state, &admin, "tenant_admin", &[("features", "manage")]).await;

    // saml allowed end-to-end, then killed at the system layer.
    server
        .state
        .capabilities
        .set_system_capability("saml", true, None)
        .await
        .unwrap();
    server
        .state
        .capabilities
        .set_tenant_capability(tenant.id, "saml", true, None)
        .await
        .unwrap();
    server
        .state
        .capabilities
        .set_system_capability("saml", false, None)
        .await
        .unwrap();

    let token = login_token(&server, &client, "admin", Some(tenant.id)).await?;
    let res = client
        .put(format!("{}/features/saml", server.base_url))
        .bearer_auth(&token)
        .json(&json!({ "enabled": true }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::CONFLICT);
    let body: serde_json::Value = res.json().await?;
    assert_eq!(body["message"], "not allowed for tenant");

    // No row was written.
    let feature = server
        .state
        .storage
        .capabilities
        .get_feature(tenant.id, "saml")
        .await
        .unwrap();
    assert!(feature.is_none());
    Ok(())
}

#[tokio::test]
async fn capability_evaluation_endpoint_reports_layers() -> Result<()> {
    let server = common::spawn_server().await?;
    let client = reqwest::Client::new();

    let tenant = common::create_tenant(&server.state, "acme", "acme.example").await;
    common::create_user(&server.state, Some(tenant.id), "alice", "Hunter2!!Hunter2").await;
    common::enable_capability_stack(&server.state, tenant.id, "webhooks").await;

    let token = login_token(&server, &client, "alice", Some(tenant.id)).await?;
    let res = client
        .get(format!("{}/capabilities/webhooks", server.base_url))
        .bearer_auth(&token)
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await?;
    assert_eq!(body["system_supported"], true);
    assert_eq!(body["tenant_allowed"], true);
    assert_eq!(body["tenant_enabled"], true);
    assert_eq!(body["can_use"], true);

    // A key the tenant was never assigned.
    server
        .state
        .capabilities
        .set_system_capability("scim", true, None)
        .await
        .unwrap();
    let res = client
        .get(format!("{}/capabilities/scim", server.base_url))
        .bearer_auth(&token)
        .send()
        .await?;
    let body: serde_json::Value = res.json().await?;
    assert_eq!(body["can_use"], false);
    assert_eq!(body["reason"], "not allowed for tenant");
    Ok(())
}

#[tokio::test]
async fn tenant_token_carries_capability_map() -> Result<()> {
    let server = common::spawn_server().await?;
    let client = reqwest::Client::new();

    let tenant = common::create_tenant(&server.state, "acme", "acme.example").await;
    common::create_user(&server.state, Some(tenant.id), "alice", "Hunter2!!Hunter2").await;
    common::enable_capability_stack(&server.state, tenant.id, "webhooks").await;
    // Assigned but not enabled: appears as false.
    server
        .state
        .capabilities
        .set_system_capability("scim", true, None)
        .await
        .unwrap();
    server
        .state
        .capabilities
        .set_tenant_capability(tenant.id, "scim", true, None)
        .await
        .unwrap();

    let token = login_token(&server, &client, "alice", Some(tenant.id)).await?;
    let claims = common::decode_claims(&token);
    assert_eq!(claims["capabilities"]["webhooks"], true);
    assert_eq!(claims["capabilities"]["scim"], false);
    Ok(())
}

#[tokio::test]
async fn user_can_enroll_then_withdraw_from_a_capability() -> Result<()> {
    let server = common::spawn_server().await?;
    let client = reqwest::Client::new();

    let tenant = common::create_tenant(&server.state, "acme", "acme.example").await;
    let alice =
        common::create_user(&server.state, Some(tenant.id), "alice", "Hunter2!!Hunter2").await;
    common::enable_capability_stack(&server.state, tenant.id, "passwordless").await;

    let token = login_token(&server, &client, "alice", Some(tenant.id)).await?;
    let res = client
        .post(format!("{}/capabilities/passwordless/enroll", server.base_url))
        .bearer_auth(&token)
        .json(&json!({}))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    let state = server
        .state
        .storage
        .capabilities
        .get_user_state(alice.id, "passwordless")
        .await
        .unwrap()
        .unwrap();
    assert!(state.enrolled);
    assert!(state.enrolled_at.is_some());

    let res = client
        .post(format!("{}/capabilities/passwordless/enroll", server.base_url))
        .bearer_auth(&token)
        .json(&json!({ "enroll": false }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await?;
    assert_eq!(body["enrolled"], false);

    let state = server
        .state
        .storage
        .capabilities
        .get_user_state(alice.id, "passwordless")
        .await
        .unwrap()
        .unwrap();
    assert!(!state.enrolled);

    // The evaluation reflects the withdrawal: the gate closes again.
    let res = client
        .get(format!("{}/capabilities/passwordless", server.base_url))
        .bearer_auth(&token)
        .send()
        .await?;
    let body: serde_json::Value = res.json().await?;
    assert_eq!(body["can_use"], false);
    assert_eq!(body["reason"], "user not enrolled");
    Ok(())
}

/// Cross-tenant isolation: SYSTEM needs the header; a tenant principal
/// reaching into another tenant is refused and audited.
#[tokio::test]
async fn cross_tenant_isolation() -> Result<()> {
    let server = common::spawn_server().await?;
    let client = reqwest::Client::new();

    let t1 = common::create_tenant(&server.state, "acme", "acme.example").await;
    let t2 = common::create_tenant(&server.state, "globex", "globex.example").await;
    let admin1 =
        common::create_user(&server.state, Some(t1.id), "admin1", "Hunter2!!Hunter2").await;
    common::grant_role(&server.state, &admin1, "tenant_admin", &[("features", "manage")]).await;
    common::enable_capability_stack(&server.state, t1.id, "webhooks").await;

    let root = common::create_user(&server.state, None, "root", "Hunter2!!Hunter2").await;
    common::grant_role(&server.state, &root, "ops", &[("features", "manage")]).await;

    // SYSTEM principal without X-Tenant-ID: 400.
    let root_token = login_token(&server, &client, "root", None).await?;
    let res = client
        .put(format!("{}/features/webhooks", server.base_url))
        .bearer_auth(&root_token)
        .json(&json!({ "enabled": true }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    // With the header it works.
    let res = client
        .put(format!("{}/features/webhooks", server.base_url))
        .bearer_auth(&root_token)
        .header("X-Tenant-ID", t1.id.to_string())
        .json(&json!({ "enabled": true }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);

    // T1's admin aiming at T2: 403.
    let admin_token = login_token(&server, &client, "admin1", Some(t1.id)).await?;
    let res = client
        .put(format!("{}/features/webhooks", server.base_url))
        .bearer_auth(&admin_token)
        .header("X-Tenant-ID", t2.id.to_string())
        .json(&json!({ "enabled": true }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
    Ok(())
}

#[tokio::test]
async fn permission_checks_gate_admin_surfaces() -> Result<()> {
    let server = common::spawn_server().await?;
    let client = reqwest::Client::new();

    let tenant = common::create_tenant(&server.state, "acme", "acme.example").await;
    common::create_user(&server.state, Some(tenant.id), "alice", "Hunter2!!Hunter2").await;

    // A tenant principal on a /system route: 403 regardless of permissions.
    let token = login_token(&server, &client, "alice", Some(tenant.id)).await?;
    let res = client
        .put(format!("{}/system/capabilities/saml", server.base_url))
        .bearer_auth(&token)
        .json(&json!({ "enabled": true }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    // A system principal without the permission: 403 and an audit trail.
    let root = common::create_user(&server.state, None, "root", "Hunter2!!Hunter2").await;
    common::grant_role(&server.state, &root, "helpdesk", &[("audit", "read")]).await;
    let root_token = login_token(&server, &client, "root", None).await?;
    let res = client
        .put(format!("{}/system/capabilities/saml", server.base_url))
        .bearer_auth(&root_token)
        .json(&json!({ "enabled": true }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    // The audit read path shows the denial to an auditor.
    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;
    let res = client
        .get(format!(
            "{}/audit/events?event_type=authz.denied",
            server.base_url
        ))
        .bearer_auth(&root_token)
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await?;
    assert!(body["count"].as_u64().unwrap() >= 1);
    Ok(())
}

#[tokio::test]
async fn audit_queries_are_tenant_scoped() -> Result<()> {
    let server = common::spawn_server().await?;
    let client = reqwest::Client::new();

    let t1 = common::create_tenant(&server.state, "acme", "acme.example").await;
    let t2 = common::create_tenant(&server.state, "globex", "globex.example").await;
    let auditor =
        common::create_user(&server.state, Some(t1.id), "auditor", "Hunter2!!Hunter2").await;
    common::grant_role(&server.state, &auditor, "auditor", &[("audit", "read")]).await;
    common::create_user(&server.state, Some(t2.id), "bob", "Hunter2!!Hunter2").await;

    // Generate login events in both tenants.
    login_token(&server, &client, "auditor", Some(t1.id)).await?;
    login_token(&server, &client, "bob", Some(t2.id)).await?;
    tokio::time::sleep(std::time::Duration::from_millis(1200)).await;

    let token = login_token(&server, &client, "auditor", Some(t1.id)).await?;
    let res = client
        .get(format!(
            "{}/audit/events?event_type=login.success",
            server.base_url
        ))
        .bearer_auth(&token)
        .send()
        .await?;
    let body: serde_json::Value = res.json().await?;
    for event in body["events"].as_array().unwrap() {
        assert_eq!(event["tenant_id"], t1.id.to_string());
    }
    Ok(())
}

#[tokio::test]
async fn impersonation_adds_act_claim() -> Result<()> {
    let server = common::spawn_server().await?;
    let client = reqwest::Client::new();

    let tenant = common::create_tenant(&server.state, "acme", "acme.example").await;
    let alice =
        common::create_user(&server.state, Some(tenant.id), "alice", "Hunter2!!Hunter2").await;
    let root = common::create_user(&server.state, None, "root", "Hunter2!!Hunter2").await;
    common::grant_role(&server.state, &root, "ops", &[("impersonation", "use")]).await;

    let root_token = login_token(&server, &client, "root", None).await?;
    let res = client
        .post(format!("{}/system/impersonate", server.base_url))
        .bearer_auth(&root_token)
        .json(&json!({ "user_id": alice.id }))
        .send()
        .await?;
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await?;
    let claims = common::decode_claims(body["access_token"].as_str().unwrap());
    assert_eq!(claims["sub"], alice.id.to_string());
    assert_eq!(claims["act"]["sub"], root.id.to_string());
    assert_eq!(claims["act"]["principal_type"], "SYSTEM");
    Ok(())
}
