use chrono::{Duration as ChronoDuration, Utc};
use pulse_auth::{JwtClaims, PrincipalId, Role};
use pulse_core::TenantId;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::StatusCode;
use serde_json::json;

struct TestServer {
    base_url: String,
    handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn spawn(jwt_secret: &str) -> Self {
        // Same router as prod, bound to an ephemeral port.
        let app = pulse_api::app::build_app(jwt_secret.to_string()).await;
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind ephemeral port");
        let addr = listener.local_addr().unwrap();
        let base_url = format!("http://{}", addr);

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { base_url, handle }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn mint_jwt(jwt_secret: &str, tenant_id: TenantId, roles: Vec<Role>) -> String {
    let now = Utc::now();
    let claims = JwtClaims {
        sub: PrincipalId::new(),
        tenant_id,
        roles,
        issued_at: now,
        expires_at: now + ChronoDuration::minutes(10),
    };

    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(jwt_secret.as_bytes()),
    )
    .expect("failed to encode jwt")
}

fn define_body() -> serde_json::Value {
    json!({
        "name": "Households with safe water access",
        "description": "Cumulative households with access to a safe water point",
        "frequency": "monthly",
        "disaggregation": [
            { "name": "gender", "subcategories": ["female", "male"] }
        ],
        "spec": {
            "kind": "quantitative",
            "unit": "households",
            "baseline": 0.0,
            "target": 400.0,
            "calculation": { "method": "sum" }
        }
    })
}

/// The API is eventually consistent (command path vs projection updates);
/// poll briefly until the read model catches up.
async fn get_json_eventually(
    client: &reqwest::Client,
    url: &str,
    token: &str,
) -> serde_json::Value {
    for _ in 0..50 {
        let res = client.get(url).bearer_auth(token).send().await.unwrap();
        if res.status() == StatusCode::OK {
            return res.json().await.unwrap();
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("read model did not become visible within timeout: {url}");
}

#[tokio::test]
async fn auth_required_for_protected_endpoints() {
    let jwt_secret = "test-secret";
    let srv = TestServer::spawn(jwt_secret).await;

    let client = reqwest::Client::new();
    let res = client
        .get(format!("{}/whoami", srv.base_url))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn tenant_context_is_derived_from_token() {
    let jwt_secret = "test-secret";
    let srv = TestServer::spawn(jwt_secret).await;

    let tenant_id = TenantId::new();
    let token = mint_jwt(jwt_secret, tenant_id, vec![Role::new("admin")]);

    let client = reqwest::Client::new();
    let res = client
        .get(format!("{}/whoami", srv.base_url))
        .bearer_auth(token)
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["tenant_id"].as_str().unwrap(), tenant_id.to_string());
    assert!(body["roles"].as_array().unwrap().iter().any(|r| r == "admin"));
}

#[tokio::test]
async fn indicator_lifecycle_define_record_query() {
    let jwt_secret = "test-secret";
    let srv = TestServer::spawn(jwt_secret).await;

    let tenant_id = TenantId::new();
    let token = mint_jwt(jwt_secret, tenant_id, vec![Role::new("admin")]);
    let client = reqwest::Client::new();

    // Define.
    let res = client
        .post(format!("{}/indicators", srv.base_url))
        .bearer_auth(&token)
        .json(&define_body())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);
    let created: serde_json::Value = res.json().await.unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    // Registry catches up.
    let indicator =
        get_json_eventually(&client, &format!("{}/indicators/{}", srv.base_url, id), &token).await;
    assert_eq!(indicator["name"], "Households with safe water access");
    assert_eq!(indicator["kind"], "quantitative");
    assert_eq!(indicator["status"], "active");

    // Record two current values with slices.
    for (date, amount, female, male) in
        [("2024-01-31", 120.0, 70.0, 50.0), ("2024-02-29", 180.0, 100.0, 80.0)]
    {
        let res = client
            .post(format!("{}/indicators/{}/values", srv.base_url, id))
            .bearer_auth(&token)
            .json(&json!({
                "kind": "current",
                "value": { "type": "numeric", "amount": amount },
                "measured_at": date,
                "source": "district water office",
                "slices": [
                    { "category": "gender", "subcategory": "female", "value": female },
                    { "category": "gender", "subcategory": "male", "value": male }
                ]
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(res.status(), StatusCode::CREATED);
    }

    // Series shows both points once the projection catches up.
    let series_url = format!("{}/indicators/{}/values", srv.base_url, id);
    let mut series = get_json_eventually(&client, &series_url, &token).await;
    for _ in 0..50 {
        if series["total"].as_u64() == Some(2) {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        series = get_json_eventually(&client, &series_url, &token).await;
    }
    assert_eq!(series["total"], 2);
    assert_eq!(series["items"][0]["slices"].as_array().unwrap().len(), 2);

    // Progress reflects the latest value: 180/400 = 45%.
    let progress = get_json_eventually(
        &client,
        &format!("{}/indicators/{}/progress", srv.base_url, id),
        &token,
    )
    .await;
    assert_eq!(progress["latest"], 180.0);
    assert_eq!(progress["achievement_pct"], 45.0);

    // Calculation over the series, filtered to one slice.
    let res = client
        .post(format!("{}/indicators/{}/calculate", srv.base_url, id))
        .bearer_auth(&token)
        .json(&json!({
            "filter": { "category": "gender", "subcategory": "female" }
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let calc: serde_json::Value = res.json().await.unwrap();
    assert_eq!(calc["result"], 170.0);
    assert_eq!(calc["method"], "sum");
}

#[tokio::test]
async fn commands_require_permissions() {
    let jwt_secret = "test-secret";
    let srv = TestServer::spawn(jwt_secret).await;

    let tenant_id = TenantId::new();
    let viewer = mint_jwt(jwt_secret, tenant_id, vec![Role::new("viewer")]);
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/indicators", srv.base_url))
        .bearer_auth(&viewer)
        .json(&define_body())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);

    // An analyst can record but not define.
    let analyst = mint_jwt(jwt_secret, tenant_id, vec![Role::new("analyst")]);
    let res = client
        .post(format!("{}/indicators", srv.base_url))
        .bearer_auth(&analyst)
        .json(&define_body())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn tenants_are_isolated() {
    let jwt_secret = "test-secret";
    let srv = TestServer::spawn(jwt_secret).await;

    let tenant_a = TenantId::new();
    let token_a = mint_jwt(jwt_secret, tenant_a, vec![Role::new("admin")]);
    let token_b = mint_jwt(jwt_secret, TenantId::new(), vec![Role::new("admin")]);
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/indicators", srv.base_url))
        .bearer_auth(&token_a)
        .json(&define_body())
        .send()
        .await
        .unwrap();
    let created: serde_json::Value = res.json().await.unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    // Visible to tenant A.
    get_json_eventually(&client, &format!("{}/indicators/{}", srv.base_url, id), &token_a).await;

    // Invisible to tenant B.
    let res = client
        .get(format!("{}/indicators/{}", srv.base_url, id))
        .bearer_auth(&token_b)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn domain_validation_maps_to_http_errors() {
    let jwt_secret = "test-secret";
    let srv = TestServer::spawn(jwt_secret).await;

    let tenant_id = TenantId::new();
    let token = mint_jwt(jwt_secret, tenant_id, vec![Role::new("admin")]);
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/indicators", srv.base_url))
        .bearer_auth(&token)
        .json(&define_body())
        .send()
        .await
        .unwrap();
    let created: serde_json::Value = res.json().await.unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    // Rating on a quantitative indicator → 400 validation error.
    let res = client
        .post(format!("{}/indicators/{}/values", srv.base_url, id))
        .bearer_auth(&token)
        .json(&json!({
            "kind": "current",
            "value": { "type": "rating", "level": "good", "narrative": null },
            "measured_at": "2024-01-31",
            "source": "survey",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["error"], "validation_error");

    // Undeclared slice → 400.
    let res = client
        .post(format!("{}/indicators/{}/values", srv.base_url, id))
        .bearer_auth(&token)
        .json(&json!({
            "kind": "current",
            "value": { "type": "numeric", "amount": 10.0 },
            "measured_at": "2024-01-31",
            "source": "survey",
            "slices": [ { "category": "region", "subcategory": "north", "value": 10.0 } ]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::BAD_REQUEST);

    // Record a value, then backdate the next one → 409.
    let res = client
        .post(format!("{}/indicators/{}/values", srv.base_url, id))
        .bearer_auth(&token)
        .json(&json!({
            "kind": "current",
            "value": { "type": "numeric", "amount": 10.0 },
            "measured_at": "2024-02-29",
            "source": "survey",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    let res = client
        .post(format!("{}/indicators/{}/values", srv.base_url, id))
        .bearer_auth(&token)
        .json(&json!({
            "kind": "current",
            "value": { "type": "numeric", "amount": 11.0 },
            "measured_at": "2024-01-31",
            "source": "survey",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CONFLICT);

    // Retire, then further commands are refused.
    let res = client
        .post(format!("{}/indicators/{}/retire", srv.base_url, id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let res = client
        .post(format!("{}/indicators/{}/values", srv.base_url, id))
        .bearer_auth(&token)
        .json(&json!({
            "kind": "current",
            "value": { "type": "numeric", "amount": 12.0 },
            "measured_at": "2024-03-31",
            "source": "survey",
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn admin_event_inspection() {
    let jwt_secret = "test-secret";
    let srv = TestServer::spawn(jwt_secret).await;

    let tenant_id = TenantId::new();
    let admin = mint_jwt(jwt_secret, tenant_id, vec![Role::new("admin")]);
    let viewer = mint_jwt(jwt_secret, tenant_id, vec![Role::new("viewer")]);
    let client = reqwest::Client::new();

    let res = client
        .post(format!("{}/indicators", srv.base_url))
        .bearer_auth(&admin)
        .json(&define_body())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::CREATED);

    // Admin can inspect the stream.
    let res = client
        .get(format!(
            "{}/admin/events?event_type=indicators.indicator.defined",
            srv.base_url
        ))
        .bearer_auth(&admin)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    let body: serde_json::Value = res.json().await.unwrap();
    assert_eq!(body["total"], 1);

    // Viewers cannot.
    let res = client
        .get(format!("{}/admin/events", srv.base_url))
        .bearer_auth(&viewer)
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::FORBIDDEN);
}
