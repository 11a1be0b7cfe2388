pub mod archive;
pub mod attach;
pub mod config;
pub mod exec;
pub mod lock;
pub mod orchestrator;
pub mod platform;
pub mod progress;
pub mod rotation;
pub mod rt;
pub mod volume;

// re-export selected public API
pub use config::Config;
pub use orchestrator::{Orchestrator, RunError, RunResult, Stage};
