pub mod hash;
pub mod middleware;
pub mod registry;
pub mod router;
pub mod routing;
pub mod store;

pub use hash::{bucket_for, jump_consistent_hash, stable_key_hash};
pub use middleware::{ShardBinding, TenantIdentity, route_tenant, tenant_routes, validate_access};
pub use registry::ShardRegistry;
pub use router::ShardRouter;
pub use routing::{RoutingChange, RoutingTable};
pub use store::{RoutingSnapshot, RoutingStore};
