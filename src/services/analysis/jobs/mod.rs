mod backoff;
pub mod memory;
pub mod postgres;
mod runner;
pub mod store;
mod types;

pub use backoff::RetryPolicy;
pub use runner::{AnalysisJobService, EngineStores, JobRun};
pub use types::*;
