pub mod config;
pub mod logging;
pub mod orchestrator;
pub mod report;
pub mod steam;
pub mod store;

pub mod util {
    pub mod env;
}

pub use config::FetchSettings;
pub use orchestrator::{BatchOrchestrator, RunReport};
