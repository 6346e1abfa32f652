pub mod orchestrator;
pub mod selection;

pub use orchestrator::{JobOrchestrator, OrchestratorConfig, OrchestratorError, TickAction};
pub use selection::select_next_job;
