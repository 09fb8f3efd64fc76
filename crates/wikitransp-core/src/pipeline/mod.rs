//! Scan pipeline components.
//!
//! - **input**: Read WIT TSV tables into candidate rows
//! - **channel**: Bounded channel between input and scheduler
//! - **fetch**: Fetch and classify one candidate
//! - **retry**: Retry policy and backoff for failed attempts
//! - **thumbnail**: Commons thumbnail URL derivation
//! - **scheduler**: Bounded pool of fetch workers
//! - **driver**: Orchestrates one complete scan

pub mod channel;
pub mod driver;
pub mod fetch;
pub mod input;
pub mod retry;
pub mod scheduler;
pub mod thumbnail;

// Re-exports for convenient access
pub use driver::{RunReport, Scan, ScanOptions};
pub use fetch::{FetchOptions, FetchWorker};
pub use input::{InputOptions, InputStats, Resume, Sample};
pub use retry::RetryPolicy;
pub use scheduler::{RunTally, Scheduler};
