pub mod error;
pub mod types;
pub mod value;

pub use error::{Result, ShardError, with_timeout};
pub use types::{Row, ShardId, TenantKey, TenantRange, validate_identifier};
pub use value::Value;
