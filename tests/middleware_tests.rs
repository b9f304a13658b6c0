/// Routing middleware tests
///
/// A tenant-scoped axum router behind a stand-in authentication layer. The
/// tenant reaches the middleware only through `TenantIdentity`; handler
/// writes go through the dual-write coordinator.
/// Run with: cargo test --test middleware_tests
mod common;

use axum::body::{Body, to_bytes};
use axum::extract::{Path, Request};
use axum::http::{StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use serde_json::{Value as JsonValue, json};
use shardwise::web::WebError;
use shardwise::{
    MigrationRequest, MigrationState, Row, ShardBackend, ShardBinding, ShardDescriptor,
    ShardingContext, TenantIdentity, TenantKey, tenant_routes,
};
use std::time::Duration;
use tower::ServiceExt;

const TENANT_HEADER: &str = "x-test-tenant";

/// Stand-in for real authentication: trusts a test header.
async fn fake_auth(mut request: Request, next: Next) -> Response {
    let tenant = request
        .headers()
        .get(TENANT_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| TenantKey::parse(value).ok());
    if let Some(tenant) = tenant {
        request.extensions_mut().insert(TenantIdentity::new(tenant));
    }
    next.run(request).await
}

async fn whoami(binding: ShardBinding) -> Json<JsonValue> {
    Json(json!({
        "tenant": binding.tenant.as_str(),
        "shard_id": binding.shard_id,
        "connection_shard": binding.connection_shard(),
    }))
}

async fn get_order(
    binding: ShardBinding,
    Path(id): Path<i64>,
) -> Result<Json<Row>, WebError> {
    let row = binding
        .get_row("orders", id)
        .await?
        .ok_or_else(|| WebError::NotFound(format!("order {id}")))?;
    Ok(Json(row))
}

async fn put_order(
    binding: ShardBinding,
    Path(id): Path<i64>,
    Json(body): Json<JsonValue>,
) -> Result<Json<JsonValue>, WebError> {
    let total = body["total_cents"].as_i64().unwrap_or_default();
    let row = Row::new(id, binding.tenant.clone())
        .with_field("total_cents", total)
        .updated_at(Utc::now() + ChronoDuration::seconds(1));
    let shard_id = binding.write("orders", row).await?;
    Ok(Json(json!({ "shard_id": shard_id })))
}

async fn touch_shard(
    binding: ShardBinding,
    Path(shard_id): Path<u32>,
) -> Result<StatusCode, WebError> {
    binding.ensure_same_shard(shard_id)?;
    Ok(StatusCode::NO_CONTENT)
}

fn app(ctx: &ShardingContext) -> Router {
    let tenant_api = Router::new()
        .route("/whoami", get(whoami))
        .route("/orders/{id}", get(get_order).put(put_order))
        .route("/shards/{shard_id}/touch", get(touch_shard));
    tenant_routes(ctx.dual_write.clone(), tenant_api).layer(middleware::from_fn(fake_auth))
}

async fn send(app: Router, uri: &str, tenant: Option<&str>) -> (StatusCode, JsonValue) {
    call(app, axum::http::Request::builder().uri(uri), tenant, Body::empty()).await
}

async fn put(app: Router, uri: &str, tenant: &str, body: JsonValue) -> (StatusCode, JsonValue) {
    let builder = axum::http::Request::builder()
        .method("PUT")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json");
    call(app, builder, Some(tenant), Body::from(body.to_string())).await
}

async fn call(
    app: Router,
    mut builder: axum::http::request::Builder,
    tenant: Option<&str>,
    body: Body,
) -> (StatusCode, JsonValue) {
    if let Some(tenant) = tenant {
        builder = builder.header(TENANT_HEADER, tenant);
    }
    let response = app.oneshot(builder.body(body).unwrap()).await.unwrap();
    let status = response.status();
    let is_json = response
        .headers()
        .get(header::CONTENT_TYPE)
        .is_some_and(|value| value.as_bytes().starts_with(b"application/json"));
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if is_json {
        serde_json::from_slice(&bytes).unwrap()
    } else {
        JsonValue::Null
    };
    (status, body)
}

#[tokio::test]
async fn test_request_without_identity_is_rejected() {
    let ctx = common::context(4).await;
    let (status, body) = send(app(&ctx), "/whoami", None).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "input_error");
    assert_eq!(body["error"], "Missing tenant context");
}

#[tokio::test]
async fn test_request_is_bound_to_the_tenant_shard() {
    let ctx = common::context(4).await;
    for shard in 0..4 {
        let tenant = common::tenants_on(shard, 4, 1).remove(0);
        let (status, body) = send(app(&ctx), "/whoami", Some(tenant.as_str())).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tenant"], tenant.as_str());
        assert_eq!(body["shard_id"], shard);
        assert_eq!(body["connection_shard"], shard);
    }
}

#[tokio::test]
async fn test_handler_reads_through_the_bound_connection() {
    let ctx = common::context(4).await;
    let tenants = common::tenants_on(1, 4, 2);
    common::seed_orders(&common::memory_shard(&ctx, 1), &tenants, 10).await;

    // Even ids belong to tenants[0].
    let (status, body) = send(app(&ctx), "/orders/4", Some(tenants[0].as_str())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], 4);

    let (status, _) = send(app(&ctx), "/orders/5", Some(tenants[0].as_str())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_cross_shard_access_is_forbidden() {
    let ctx = common::context(4).await;
    let tenant = common::tenants_on(2, 4, 1).remove(0);

    let (status, _) = send(app(&ctx), "/shards/2/touch", Some(tenant.as_str())).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (status, body) = send(app(&ctx), "/shards/3/touch", Some(tenant.as_str())).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "cross_shard_access");
}

#[tokio::test]
async fn test_unreachable_shard_is_unavailable() {
    let ctx = common::context(4).await;
    let tenant = common::tenants_on(3, 4, 1).remove(0);
    common::memory_shard(&ctx, 3).set_reachable(false);

    let (status, body) = send(app(&ctx), "/whoami", Some(tenant.as_str())).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["code"], "shard_unavailable");

    // Other shards keep serving.
    let healthy = common::tenants_on(0, 4, 1).remove(0);
    let (status, _) = send(app(&ctx), "/whoami", Some(healthy.as_str())).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_requests_follow_a_repointed_tenant() {
    let ctx = common::context(4).await;
    let tenant = common::tenants_on(0, 4, 1).remove(0);
    ctx.router
        .repoint(&shardwise::TenantRange::Keys([tenant.clone()].into()), 0, 1)
        .unwrap();

    let (status, body) = send(app(&ctx), "/whoami", Some(tenant.as_str())).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["shard_id"], 1);
}

#[tokio::test]
async fn test_handler_writes_reach_a_migrating_tenant_target() {
    let ctx = common::context(4).await;
    let tenants = common::tenants_on(0, 4, 2);
    let tenant = tenants[0].as_str();
    let source = common::memory_shard(&ctx, 0);
    common::seed_orders(&source, &tenants, 4_000).await;
    ctx.add_shard(ShardDescriptor::new(4, "memory-4")).await.unwrap();
    source.set_latency(Duration::from_millis(15));

    let id = ctx
        .migrations
        .start(MigrationRequest::new(0, 4).batch_size(250))
        .unwrap()
        .migration_id;
    for _ in 0..2_000 {
        if ctx.migrations.status(&id).unwrap().migrated_records >= 500 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Row 2 belongs to tenants[0] and was copied in the first batch.
    let update = json!({ "total_cents": 999_999 });
    let (status, body) = put(app(&ctx), "/orders/2", tenant, update).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["shard_id"], 0);

    source.set_latency(Duration::ZERO);
    let done = ctx.migrations.wait(&id).await.unwrap();
    assert_eq!(done.state, MigrationState::Completed, "{}", done.message);

    let target = common::memory_shard(&ctx, 4);
    let row = target.get_row("orders", 2).await.unwrap().unwrap();
    assert_eq!(row.fields.get("total_cents").and_then(|v| v.as_i64()), Some(999_999));

    let (status, body) = put(app(&ctx), "/orders/2", tenant, json!({ "total_cents": 1 })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["shard_id"], 4);
    let (_, body) = send(app(&ctx), "/orders/2", Some(tenant)).await;
    assert_eq!(body["fields"]["total_cents"], 1);
}
