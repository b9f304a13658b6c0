//! Per-request shard routing for axum.
//!
//! An upstream authentication layer places a [`TenantIdentity`] in the request
//! extensions. [`route_tenant`] turns it into a [`ShardBinding`] (shard id plus
//! a pooled connection) before any handler runs; requests without an identity
//! are rejected with 400. The tenant is never read from headers, path or body.
//!
//! Handlers read through the bound connection but write through the
//! [`DualWriteCoordinator`], so writes made while the tenant is being
//! migrated also reach the target shard.

use crate::connection::PoolGuard;
use crate::core::{Result, Row, ShardError, ShardId, TenantKey};
use crate::migration::DualWriteCoordinator;
use crate::web::WebError;
use axum::Router;
use axum::extract::{FromRequestParts, Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use http::request::Parts;
use std::sync::Arc;
use tracing::{debug, warn};

/// Authenticated tenant of the current request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TenantIdentity {
    pub tenant: TenantKey,
}

impl TenantIdentity {
    pub fn new(tenant: TenantKey) -> Self {
        Self { tenant }
    }
}

/// The shard a request is bound to, with the connection checked out for it.
/// The connection returns to its pool when the last clone is dropped.
#[derive(Clone)]
pub struct ShardBinding {
    pub tenant: TenantKey,
    pub shard_id: ShardId,
    connection: Arc<PoolGuard>,
    writer: Arc<DualWriteCoordinator>,
}

impl ShardBinding {
    /// Shard of the checked-out connection.
    pub fn connection_shard(&self) -> ShardId {
        self.connection.shard_id()
    }

    /// Reads a row of this tenant on the bound shard. Rows of other tenants
    /// read as missing.
    pub async fn get_row(&self, table: &str, id: i64) -> Result<Option<Row>> {
        let row = self.connection.get_row(table, id).await?;
        Ok(row.filter(|row| row.tenant == self.tenant))
    }

    /// Upserts a row of this tenant and returns the shard that now holds
    /// it. Fails with [`ShardError::StaleWrite`] when a newer version exists.
    pub async fn write(&self, table: &str, row: Row) -> Result<ShardId> {
        self.writer.write(&self.tenant, table, row).await
    }

    /// Deletes a row of this tenant; `false` when it did not exist.
    pub async fn delete(&self, table: &str, id: i64) -> Result<bool> {
        self.writer.delete(&self.tenant, table, id).await
    }

    /// Fails with [`ShardError::CrossShardAccess`] unless `resource_shard`
    /// is the shard this request is bound to.
    pub fn ensure_same_shard(&self, resource_shard: ShardId) -> Result<()> {
        if validate_access(self.shard_id, resource_shard) {
            Ok(())
        } else {
            Err(ShardError::CrossShardAccess {
                request_shard: self.shard_id,
                resource_shard,
            })
        }
    }
}

impl std::fmt::Debug for ShardBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardBinding")
            .field("tenant", &self.tenant)
            .field("shard_id", &self.shard_id)
            .finish()
    }
}

impl<S: Send + Sync> FromRequestParts<S> for ShardBinding {
    type Rejection = WebError;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        parts.extensions.get::<ShardBinding>().cloned().ok_or_else(|| {
            WebError::Internal("shard routing middleware is not installed".to_string())
        })
    }
}

/// Cross-shard guard. A mismatch is a security violation: it is logged and
/// denied, never corrected by rerouting.
pub fn validate_access(request_shard: ShardId, resource_shard: ShardId) -> bool {
    if request_shard == resource_shard {
        return true;
    }
    warn!(
        request_shard,
        resource_shard,
        "security violation: cross-shard access denied"
    );
    false
}

/// Middleware binding the authenticated tenant to its shard.
pub async fn route_tenant(
    State(writer): State<Arc<DualWriteCoordinator>>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(identity) = request.extensions().get::<TenantIdentity>().cloned() else {
        return WebError::Input("Missing tenant context".to_string()).into_response();
    };

    match writer.router().connection(&identity.tenant).await {
        Ok((shard_id, connection)) => {
            debug!(tenant = %identity.tenant, shard_id, "request routed");
            request.extensions_mut().insert(ShardBinding {
                tenant: identity.tenant,
                shard_id,
                connection: Arc::new(connection),
                writer,
            });
            next.run(request).await
        }
        Err(err) => {
            warn!(tenant = %identity.tenant, error = %err, "failed to route request");
            WebError::from(err).into_response()
        }
    }
}

/// Wraps tenant-scoped routes in [`route_tenant`]. Mount the result behind
/// the layer that authenticates requests and inserts [`TenantIdentity`].
pub fn tenant_routes(writer: Arc<DualWriteCoordinator>, routes: Router) -> Router {
    routes.layer(middleware::from_fn_with_state(writer, route_tenant))
}
