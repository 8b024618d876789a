// Divergence handling policies

use super::verdict::Verdict;
use crate::config::DivergencePolicy;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{error, warn};

/// Everything known about one disagreement between the stores.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DivergenceRecord {
    pub operation: &'static str,
    pub paths: Vec<String>,
    pub verdict: Verdict,
    pub primary: String,
    pub mirror: String,
    pub detail: String,
}

/// Invoked by the dispatcher for every MISMATCH or ASYMMETRIC verdict, after
/// the divergence has been logged. Returning means the call continues.
pub trait DivergenceHandler: Send + Sync {
    fn on_divergence(&self, record: &DivergenceRecord);
}

type Terminator = Box<dyn Fn(&DivergenceRecord) + Send + Sync>;

fn abort_process(record: &DivergenceRecord) {
    error!(
        operation = record.operation,
        verdict = %record.verdict,
        "Aborting on divergence"
    );
    std::process::abort();
}

/// Terminates on any divergence.
pub struct FailFast {
    terminate: Terminator,
}

impl FailFast {
    pub fn new() -> Self {
        Self { terminate: Box::new(abort_process) }
    }

    /// Replace process abort with a custom hook.
    pub fn with_terminator(terminate: impl Fn(&DivergenceRecord) + Send + Sync + 'static) -> Self {
        Self { terminate: Box::new(terminate) }
    }
}

impl Default for FailFast {
    fn default() -> Self {
        Self::new()
    }
}

impl DivergenceHandler for FailFast {
    fn on_divergence(&self, record: &DivergenceRecord) {
        (self.terminate)(record);
    }
}

/// Counts mismatches and keeps going. Asymmetric results still terminate:
/// there is no primary result that both stores stand behind.
pub struct DiagnosticOnly {
    mismatches: AtomicU64,
    terminate: Terminator,
}

impl DiagnosticOnly {
    pub fn new() -> Self {
        Self { mismatches: AtomicU64::new(0), terminate: Box::new(abort_process) }
    }

    pub fn with_terminator(terminate: impl Fn(&DivergenceRecord) + Send + Sync + 'static) -> Self {
        Self { mismatches: AtomicU64::new(0), terminate: Box::new(terminate) }
    }

    pub fn mismatch_count(&self) -> u64 {
        self.mismatches.load(Ordering::Relaxed)
    }
}

impl Default for DiagnosticOnly {
    fn default() -> Self {
        Self::new()
    }
}

impl DivergenceHandler for DiagnosticOnly {
    fn on_divergence(&self, record: &DivergenceRecord) {
        if record.verdict.is_fatal() {
            (self.terminate)(record);
            return;
        }

        let total = self.mismatches.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(operation = record.operation, total, "Continuing after mismatch");
    }
}

/// Keeps every record in memory and never terminates.
#[derive(Default)]
pub struct Recorder {
    records: Mutex<Vec<DivergenceRecord>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<DivergenceRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut records) = self.records.lock() {
            records.clear();
        }
    }
}

impl DivergenceHandler for Recorder {
    fn on_divergence(&self, record: &DivergenceRecord) {
        if let Ok(mut records) = self.records.lock() {
            records.push(record.clone());
        }
    }
}

/// Build the handler for a configured policy.
pub fn handler_for(policy: DivergencePolicy) -> Arc<dyn DivergenceHandler> {
    match policy {
        DivergencePolicy::FailFast => Arc::new(FailFast::new()),
        DivergencePolicy::DiagnosticOnly => Arc::new(DiagnosticOnly::new()),
    }
}
