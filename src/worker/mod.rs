//! Worker pool: drains the job queue through the pipeline.
//!
//! - `retry`: backoff and attempt ceiling
//! - `pool`: worker loops, delivery settlement, shutdown

pub mod pool;
pub mod retry;

pub use pool::{Settlement, WorkerConfig, WorkerHandle, WorkerPool, run_delivery};
pub use retry::RetryPolicy;
