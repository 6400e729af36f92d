use apartment_axum::{ApartmentApp, ApartmentAxumError, BrokerState, Scope, Tenanted};
use apartment_core::{BrokerConfig, ConnectionBroker, MemoryPool, Statement, TenantPolicy, Value};
use axum::body::Body;
use axum::http::{HeaderValue, Request, StatusCode};
use axum::routing::get;
use axum::Router;
use http_body_util::BodyExt;
use serde_json::Value as Json;
use tower::ServiceExt;

async fn current_tenant(conn: Tenanted<MemoryPool>) -> Result<String, ApartmentAxumError> {
    let rows = conn.query(&Statement::new("SELECT DATABASE()")).await?;
    Ok(rows
        .first()
        .and_then(|row| row.get("DATABASE()"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string())
}

async fn scope(Scope(ctx): Scope) -> String {
    match (ctx.tenant(), ctx.request_token()) {
        (Some(tenant), Some(_)) => format!("bound:{tenant}"),
        _ => "unbound".to_string(),
    }
}

async fn failing(conn: Tenanted<MemoryPool>) -> Result<String, ApartmentAxumError> {
    conn.execute(&Statement::new("UPDATE accounts SET plan = 'pro'")).await?;
    Err(anyhow::anyhow!("billing provider unreachable").into())
}

fn app(pool: MemoryPool, config: BrokerConfig) -> (BrokerState<MemoryPool>, Router) {
    let app = ApartmentApp::new(ConnectionBroker::with_config(pool, config))
        .tenant_route("/tenant", get(current_tenant))
        .tenant_route("/scope", get(scope))
        .tenant_route("/upgrade", get(failing))
        .route("/health", get(|| async { "ok" }))
        .route("/public/tenant", get(current_tenant));
    let broker = app.broker.clone();
    (broker, app.into_router())
}

fn get_with_tenant(uri: &str, tenant: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(tenant) = tenant {
        builder = builder.header("tenant-id", tenant);
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_text(res: axum::response::Response) -> String {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn json_body(res: axum::response::Response) -> Json {
    let bytes = res.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn handler_sees_connection_switched_to_header_tenant() {
    let pool = MemoryPool::new(2);
    let (_broker, router) = app(pool.clone(), BrokerConfig::default());

    let res = router
        .oneshot(get_with_tenant("/tenant", Some("acme")))
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.headers().get("x-request-id").is_some());
    assert_eq!(body_text(res).await, "acme");

    let stats = pool.stats();
    assert_eq!((stats.acquired, stats.released, stats.in_use), (1, 1, 0));
}

#[tokio::test]
async fn request_id_is_preserved_when_provided() {
    let (_broker, router) = app(MemoryPool::new(1), BrokerConfig::default());
    let provided = HeaderValue::from_static("req-test-123");

    let mut req = get_with_tenant("/tenant", Some("acme"));
    req.headers_mut().insert("x-request-id", provided.clone());
    let res = router.oneshot(req).await.unwrap();

    assert_eq!(res.headers().get("x-request-id").unwrap(), &provided);
}

#[tokio::test]
async fn missing_tenant_is_bad_request_without_acquisition() {
    let pool = MemoryPool::new(1);
    let (_broker, router) = app(pool.clone(), BrokerConfig::default());

    let res = router.oneshot(get_with_tenant("/tenant", None)).await.unwrap();

    assert_eq!(res.status().as_u16(), 400);
    let body = json_body(res).await;
    assert_eq!(body["name"], "BadRequest");
    assert_eq!(body["code"], 400);
    assert_eq!(body["className"], "bad-request");
    assert_eq!(body["message"], "no tenant found");
    assert_eq!(pool.stats().acquired, 0);
}

#[tokio::test]
async fn rejected_tenant_is_bad_request() {
    let pool = MemoryPool::new(1);
    let config = BrokerConfig::default().with_policy(TenantPolicy::allow_list(["acme"]));
    let (_broker, router) = app(pool.clone(), config);

    for tenant in ["globex", "acme`; DROP DATABASE acme"] {
        let res = router
            .clone()
            .oneshot(get_with_tenant("/tenant", Some(tenant)))
            .await
            .unwrap();
        assert_eq!(res.status().as_u16(), 400);
        assert_eq!(json_body(res).await["name"], "BadRequest");
    }
    assert_eq!(pool.stats().acquired, 0);
}

#[tokio::test]
async fn acquisition_failure_is_unavailable() {
    let pool = MemoryPool::new(1);
    pool.fail_acquire("too many connections");
    let (_broker, router) = app(pool, BrokerConfig::default());

    let res = router
        .oneshot(get_with_tenant("/tenant", Some("acme")))
        .await
        .unwrap();

    assert_eq!(res.status().as_u16(), 503);
    let body = json_body(res).await;
    assert_eq!(body["name"], "Unavailable");
    assert_eq!(body["className"], "unavailable");
    assert!(!body["message"].as_str().unwrap().contains("too many connections"));
}

#[tokio::test]
async fn switch_failure_is_general_error_and_discards() {
    let pool = MemoryPool::new(1);
    pool.fail_switch("Unknown database 'acme'");
    let (_broker, router) = app(pool.clone(), BrokerConfig::default());

    let res = router
        .oneshot(get_with_tenant("/tenant", Some("acme")))
        .await
        .unwrap();

    assert_eq!(res.status().as_u16(), 500);
    assert_eq!(json_body(res).await["name"], "GeneralError");
    let stats = pool.stats();
    assert_eq!((stats.released, stats.discarded, stats.in_use), (1, 1, 0));
}

#[tokio::test]
async fn handler_error_still_releases() {
    let pool = MemoryPool::new(1);
    let (broker, router) = app(pool.clone(), BrokerConfig::default());

    let res = router
        .oneshot(get_with_tenant("/upgrade", Some("acme")))
        .await
        .unwrap();

    assert_eq!(res.status().as_u16(), 500);
    let body = json_body(res).await;
    assert_eq!(body["name"], "GeneralError");
    assert_eq!(body["message"], "internal server error");
    assert_eq!(pool.stats().in_use, 0);
    assert_eq!(broker.bound_count(), 0);
}

#[tokio::test]
async fn scope_extractor_carries_binding() {
    let (_broker, router) = app(MemoryPool::new(1), BrokerConfig::default());

    let res = router
        .oneshot(get_with_tenant("/scope", Some("globex")))
        .await
        .unwrap();

    assert_eq!(body_text(res).await, "bound:globex");
}

#[tokio::test]
async fn public_routes_skip_tenant_binding() {
    let pool = MemoryPool::new(1);
    let (_broker, router) = app(pool.clone(), BrokerConfig::default());

    let res = router
        .clone()
        .oneshot(get_with_tenant("/health", None))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(body_text(res).await, "ok");

    let res = router
        .clone()
        .oneshot(get_with_tenant("/public/tenant", Some("acme")))
        .await
        .unwrap();
    assert_eq!(res.status().as_u16(), 500);
    let body = json_body(res).await;
    assert_eq!(body["name"], "GeneralError");
    assert_eq!(body["message"], "no request bound for the context");

    let res = router
        .oneshot(get_with_tenant("/missing", None))
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::NOT_FOUND);
    assert_eq!(pool.stats().acquired, 0);
}
