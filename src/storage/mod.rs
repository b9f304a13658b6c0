pub mod engine;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod table;

pub use engine::{ShardBackend, ShardConnector, ShardStats};
pub use memory::{MemoryConnector, MemoryShard};
#[cfg(feature = "postgres")]
pub use postgres::{PgConnector, PgShard};
pub use table::Table;
