//! Repository traits and implementations.

pub mod build_job;
pub mod memory;
pub mod state;

pub use build_job::{
    BuildJobRepo, BuildJobStatistics, FinishedBuildJob, FinishedJobFilter, Page, PgBuildJobRepo,
};
pub use memory::MemoryBuildJobRepo;
pub use state::PgStateStore;
