//! Online tenant migration between shards.

pub mod dual_write;
pub mod engine;
pub mod job;
pub mod plan;

pub use dual_write::{DualWriteBinding, DualWriteCoordinator, DualWriteStats, MirrorFailure};
pub use engine::{MigrationEngine, TableVerification, VerificationReport};
pub use job::{MigrationJob, MigrationRequest, MigrationState, MigrationStatus};
pub use plan::TablePlan;
