//! Mailcheck Core - extraction accuracy scoring for email testing
//!
//! Scores AI-extracted fields against expected values and runs batches of
//! email test cases through an execution queue.

pub mod analysis;
pub mod batch;
pub mod clients;
pub mod config;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod queue;
pub mod server;
pub mod similarity;
pub mod store;

pub use analysis::{AIAnalysisResult, AnalysisRequest, AnalysisType, ValidationResult};
pub use batch::{BatchReport, run_batch};
pub use config::Settings;
pub use error::{ApiError, MonitorError};
pub use executor::{SimulatedExecutor, TaskExecutor};
pub use monitor::ExecutionMonitor;
pub use queue::{ExecutionOptions, ExecutionQueue, QueueStatus};
pub use similarity::{identify_issues, similarity};
pub use store::{MemoryQueueStore, QueueStore, SqliteQueueStore};
