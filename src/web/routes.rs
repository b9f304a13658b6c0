use super::{Result, WebError};
use crate::connection::config::ShardDescriptor;
use crate::context::ShardingContext;
use crate::core::{ShardId, TenantKey};
use crate::exporter::{Alert, MetricsReport};
use crate::health::{HealthSummary, HealthThresholds, MetricsSnapshot, ShardHealth};
use crate::migration::{DualWriteStats, MigrationRequest, MigrationStatus, VerificationReport};
use crate::sharding::RoutingTable;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use http::{HeaderName, Method, StatusCode, header};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

pub fn build_router(ctx: ShardingContext) -> Router {
    let request_id_header = HeaderName::from_static("x-request-id");

    Router::new()
        .route("/health", get(simple_health))
        .route("/metrics", get(prometheus_metrics))
        .route("/metrics/json", get(json_metrics))
        .route("/api/v1/admin/health", get(health_summary))
        .route("/api/v1/admin/health/shards", get(all_shard_health))
        .route("/api/v1/admin/health/shards/{id}", get(shard_health))
        .route("/api/v1/admin/health/shards/{id}/probe", post(probe_shard))
        .route("/api/v1/admin/health/shards/{id}/metrics", get(shard_metrics))
        .route(
            "/api/v1/admin/health/shards/{id}/metrics/reset",
            post(reset_shard_metrics),
        )
        .route(
            "/api/v1/admin/health/thresholds",
            get(get_thresholds).post(set_thresholds),
        )
        .route("/api/v1/admin/health/start", post(start_monitor))
        .route("/api/v1/admin/health/stop", post(stop_monitor))
        .route("/api/v1/admin/shards", get(list_shards).post(add_shard))
        .route("/api/v1/admin/routing", get(routing_table))
        .route("/api/v1/admin/routing/{tenant}", get(resolve_tenant))
        .route(
            "/api/v1/admin/migrations",
            get(list_migrations).post(start_migration),
        )
        .route("/api/v1/admin/migrations/{id}", get(migration_status))
        .route("/api/v1/admin/migrations/{id}/cancel", post(cancel_migration))
        .route(
            "/api/v1/admin/migrations/{id}/rollback",
            post(rollback_migration),
        )
        .route("/api/v1/admin/migrations/{id}/verify", post(verify_migration))
        .route("/api/v1/admin/dual-write", get(dual_write_stats))
        .route("/api/v1/admin/alerts", get(alerts))
        .layer(TraceLayer::new_for_http())
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(SetRequestIdLayer::new(request_id_header, MakeRequestUuid))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS]),
        )
        .with_state(ctx)
}

#[derive(Debug, Serialize)]
struct StatusBody {
    status: &'static str,
}

#[derive(Debug, Serialize)]
struct MonitorState {
    running: bool,
}

#[derive(Debug, Serialize)]
struct ShardView {
    #[serde(flatten)]
    descriptor: ShardDescriptor,
    drained: bool,
}

#[derive(Debug, Serialize)]
struct TenantLocation {
    tenant: TenantKey,
    shard_id: ShardId,
}

async fn simple_health(State(ctx): State<ShardingContext>) -> Result<impl IntoResponse> {
    let summary = ctx.monitor.summary()?;
    let label = summary.status_label();
    let status = if label == "UP" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    Ok((status, Json(StatusBody { status: label })))
}

async fn health_summary(State(ctx): State<ShardingContext>) -> Result<Json<HealthSummary>> {
    Ok(Json(ctx.monitor.summary()?))
}

async fn all_shard_health(State(ctx): State<ShardingContext>) -> Result<Json<Vec<ShardHealth>>> {
    Ok(Json(ctx.monitor.all_health()?))
}

async fn shard_health(
    State(ctx): State<ShardingContext>,
    Path(id): Path<ShardId>,
) -> Result<Json<ShardHealth>> {
    Ok(Json(ctx.monitor.shard_health(id)?))
}

async fn probe_shard(
    State(ctx): State<ShardingContext>,
    Path(id): Path<ShardId>,
) -> Result<Json<ShardHealth>> {
    Ok(Json(ctx.monitor.probe_shard(id).await?))
}

async fn shard_metrics(
    State(ctx): State<ShardingContext>,
    Path(id): Path<ShardId>,
) -> Result<Json<MetricsSnapshot>> {
    Ok(Json(ctx.monitor.metrics(id)?))
}

async fn reset_shard_metrics(
    State(ctx): State<ShardingContext>,
    Path(id): Path<ShardId>,
) -> Result<StatusCode> {
    ctx.monitor.reset_metrics(id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn get_thresholds(State(ctx): State<ShardingContext>) -> Result<Json<HealthThresholds>> {
    Ok(Json(ctx.monitor.thresholds()?))
}

async fn set_thresholds(
    State(ctx): State<ShardingContext>,
    Json(thresholds): Json<HealthThresholds>,
) -> Result<Json<HealthThresholds>> {
    thresholds
        .validate()
        .map_err(|err| WebError::Input(err.to_string()))?;
    ctx.monitor.set_thresholds(thresholds)?;
    Ok(Json(thresholds))
}

async fn start_monitor(State(ctx): State<ShardingContext>) -> Result<Json<MonitorState>> {
    if !ctx.monitor.is_running() {
        ctx.monitor.start()?;
    }
    Ok(Json(MonitorState { running: true }))
}

async fn stop_monitor(State(ctx): State<ShardingContext>) -> Result<Json<MonitorState>> {
    ctx.monitor.stop().await?;
    Ok(Json(MonitorState { running: false }))
}

async fn list_shards(State(ctx): State<ShardingContext>) -> Result<Json<Vec<ShardView>>> {
    let shards = ctx
        .router
        .all_shards()?
        .into_iter()
        .map(|descriptor| ShardView {
            drained: ctx.router.is_drained(descriptor.id),
            descriptor: descriptor.as_ref().clone(),
        })
        .collect();
    Ok(Json(shards))
}

async fn add_shard(
    State(ctx): State<ShardingContext>,
    Json(descriptor): Json<ShardDescriptor>,
) -> Result<impl IntoResponse> {
    if ctx.registry.contains(descriptor.id) {
        return Err(WebError::Conflict(format!(
            "shard {} is already registered",
            descriptor.id
        )));
    }
    let descriptor = ctx.add_shard(descriptor).await?;
    Ok((
        StatusCode::CREATED,
        Json(ShardView {
            drained: false,
            descriptor: descriptor.as_ref().clone(),
        }),
    ))
}

async fn routing_table(State(ctx): State<ShardingContext>) -> Result<Json<RoutingTable>> {
    Ok(Json(ctx.router.routing_table()?))
}

async fn resolve_tenant(
    State(ctx): State<ShardingContext>,
    Path(tenant): Path<String>,
) -> Result<Json<TenantLocation>> {
    let tenant = TenantKey::parse(&tenant)?;
    let shard_id = ctx.router.shard_for(&tenant)?;
    Ok(Json(TenantLocation { tenant, shard_id }))
}

async fn list_migrations(State(ctx): State<ShardingContext>) -> Result<Json<Vec<MigrationStatus>>> {
    Ok(Json(ctx.migrations.list()?))
}

async fn start_migration(
    State(ctx): State<ShardingContext>,
    Json(request): Json<MigrationRequest>,
) -> Result<impl IntoResponse> {
    let status = ctx.migrations.start(request)?;
    Ok((StatusCode::ACCEPTED, Json(status)))
}

async fn migration_status(
    State(ctx): State<ShardingContext>,
    Path(id): Path<String>,
) -> Result<Json<MigrationStatus>> {
    Ok(Json(ctx.migrations.status(&id)?))
}

async fn cancel_migration(
    State(ctx): State<ShardingContext>,
    Path(id): Path<String>,
) -> Result<Json<MigrationStatus>> {
    Ok(Json(ctx.migrations.cancel(&id)?))
}

async fn rollback_migration(
    State(ctx): State<ShardingContext>,
    Path(id): Path<String>,
) -> Result<Json<MigrationStatus>> {
    Ok(Json(ctx.migrations.rollback(&id).await?))
}

async fn verify_migration(
    State(ctx): State<ShardingContext>,
    Path(id): Path<String>,
) -> Result<Json<VerificationReport>> {
    Ok(Json(ctx.migrations.verify(&id).await?))
}

async fn dual_write_stats(State(ctx): State<ShardingContext>) -> Result<Json<Vec<DualWriteStats>>> {
    Ok(Json(ctx.dual_write.stats()?))
}

async fn prometheus_metrics(State(ctx): State<ShardingContext>) -> Result<impl IntoResponse> {
    let body = ctx.exporter.prometheus()?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        body,
    ))
}

async fn json_metrics(State(ctx): State<ShardingContext>) -> Result<Json<MetricsReport>> {
    Ok(Json(ctx.exporter.report()?))
}

async fn alerts(State(ctx): State<ShardingContext>) -> Result<Json<Vec<Alert>>> {
    Ok(Json(ctx.exporter.alerts()?))
}
