// Result ledger: the single shared, observable record of every plan item's
// generation status.

use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::core::types::{GenerationResult, ItemStatus, LedgerEntryView, PlanItem, StatusCounts};

#[derive(Debug, Default)]
struct LedgerState {
    run_id: u64,
    entries: Vec<GenerationResult>,
}

impl LedgerState {
    fn position(&self, id: usize) -> Option<usize> {
        match self.entries.get(id) {
            Some(entry) if entry.id == id => Some(id),
            _ => self.entries.iter().position(|e| e.id == id),
        }
    }
}

/// Shared ledger keyed by plan item id.
///
/// Every update replaces a whole entry under the write lock, so readers
/// never see a half-applied change. Updates carry the run id that produced
/// them and are dropped when that run has been replaced.
#[derive(Clone)]
pub struct ResultLedger {
    state: Arc<RwLock<LedgerState>>,
    version: Arc<watch::Sender<u64>>,
}

impl ResultLedger {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            state: Arc::new(RwLock::new(LedgerState::default())),
            version: Arc::new(version),
        }
    }

    fn bump(&self) {
        self.version.send_modify(|v| *v += 1);
    }

    /// Start a fresh ledger for `run_id` with every item pending.
    pub fn reset(&self, run_id: u64, plan: &[PlanItem]) {
        {
            let mut state = self.state.write();
            state.run_id = run_id;
            state.entries = plan.iter().map(GenerationResult::pending).collect();
        }
        debug!("Ledger reset for run {} with {} items", run_id, plan.len());
        self.bump();
    }

    /// Drop every entry and detach from any run.
    pub fn clear(&self, run_id: u64) {
        {
            let mut state = self.state.write();
            state.run_id = run_id;
            state.entries.clear();
        }
        self.bump();
    }

    pub fn run_id(&self) -> u64 {
        self.state.read().run_id
    }

    /// Replace one entry. Returns `false` when the update was dropped: the
    /// run is stale, the id is unknown, or it would move a successful entry
    /// to any other status.
    pub fn apply(&self, run_id: u64, result: GenerationResult) -> bool {
        self.replace(run_id, result, false)
    }

    /// Replace one entry even if it is currently successful (explicit
    /// regeneration). Stale runs are still rejected.
    pub fn force_replace(&self, run_id: u64, result: GenerationResult) -> bool {
        self.replace(run_id, result, true)
    }

    fn replace(&self, run_id: u64, result: GenerationResult, force: bool) -> bool {
        let applied = {
            let mut state = self.state.write();
            if state.run_id != run_id {
                debug!("Dropping update for item {} from stale run {}", result.id, run_id);
                return false;
            }
            match state.position(result.id) {
                Some(index) => {
                    let current = &state.entries[index];
                    if !force && current.status == ItemStatus::Success && result.status != ItemStatus::Success {
                        false
                    } else {
                        state.entries[index] = result;
                        true
                    }
                }
                None => false,
            }
        };
        if applied {
            self.bump();
        }
        applied
    }

    /// Return every `generating` entry of `run_id` to `pending`.
    pub fn revert_in_flight(&self, run_id: u64) -> usize {
        let reverted = {
            let mut state = self.state.write();
            if state.run_id != run_id {
                return 0;
            }
            let mut reverted = 0;
            for entry in state.entries.iter_mut() {
                if entry.status == ItemStatus::Generating {
                    *entry = GenerationResult {
                        status: ItemStatus::Pending,
                        ..entry.clone()
                    };
                    reverted += 1;
                }
            }
            reverted
        };
        if reverted > 0 {
            self.bump();
        }
        reverted
    }

    pub fn get(&self, id: usize) -> Option<GenerationResult> {
        let state = self.state.read();
        state.position(id).map(|i| state.entries[i].clone())
    }

    pub fn is_success(&self, id: usize) -> bool {
        self.get(id).map(|e| e.status == ItemStatus::Success).unwrap_or(false)
    }

    pub fn snapshot(&self) -> Vec<GenerationResult> {
        self.state.read().entries.clone()
    }

    pub fn views(&self) -> Vec<LedgerEntryView> {
        self.state.read().entries.iter().map(LedgerEntryView::from).collect()
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn counts(&self) -> StatusCounts {
        let state = self.state.read();
        let mut counts = StatusCounts::default();
        for entry in state.entries.iter() {
            match entry.status {
                ItemStatus::Pending => counts.pending += 1,
                ItemStatus::Generating => counts.generating += 1,
                ItemStatus::Success => counts.success += 1,
                ItemStatus::Error => counts.error += 1,
            }
        }
        counts
    }

    pub fn all_terminal(&self) -> bool {
        self.state.read().entries.iter().all(|e| e.status.is_terminal())
    }

    /// Monotonic change counter, bumped on every replacement
    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    /// Receiver that changes whenever an entry is replaced
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }
}

impl Default for ResultLedger {
    fn default() -> Self {
        Self::new()
    }
}
