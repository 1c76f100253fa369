// Orchestration layer: the shared ledger, the batch scheduler and the run controller

pub mod ledger;
pub mod orchestrator;
pub mod scheduler;

pub use ledger::ResultLedger;
pub use orchestrator::{
    LedgerView, OrchestratorSettings, RunPhase, RunRequest, StartedRun, StickerOrchestrator,
};
pub use scheduler::{BatchScheduler, RunOutcome, RunReport};
