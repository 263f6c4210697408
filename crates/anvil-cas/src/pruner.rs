//! Once-per-build store pruning
//!
//! Many tasks in one build share a store; the first to finish asks for it to
//! be pruned and later requests for the same options are dropped. Pruning
//! runs on the blocking pool since no task waits on it, and
//! [`CasPruner::wait_for_completion`] joins whatever is still running when the
//! build ends.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};

use anvil_core::serialization;
use anvil_core::{Signature, SignatureBuilder};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::options::{compute_size_limit, CasOptions, SizeLimitingStrategy};
use crate::store::ContentStore;

/// Outcome of one prune pass
#[derive(Debug, Clone)]
pub struct PruneReport {
    /// Activity signature for this prune
    pub signature: Signature,
    pub cas_path: PathBuf,
    pub db_size: Option<u64>,
    pub size_limit: Option<u64>,
    /// Informational notes, such as the store exceeding its limit
    pub notes: Vec<String>,
    pub error: Option<String>,
}

impl PruneReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Default)]
struct PrunerState {
    pruned: HashSet<CasOptions>,
    pending: Vec<JoinHandle<PruneReport>>,
}

/// Prunes each distinct store at most once
#[derive(Default)]
pub struct CasPruner {
    state: Mutex<PrunerState>,
}

impl std::fmt::Debug for CasPruner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("CasPruner")
            .field("pruned", &state.pruned.len())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl CasPruner {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PrunerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start pruning `store` in the background unless it was already pruned.
    ///
    /// Returns whether a prune was started. Must be called from within a
    /// tokio runtime.
    #[instrument(skip_all, fields(cas = %options.cas_path.display()))]
    pub fn prune_cas(&self, store: Arc<dyn ContentStore>, options: &CasOptions) -> bool {
        if options.limiting_strategy == SizeLimitingStrategy::Discarded {
            debug!("store is discarded after the build, not pruning");
            return false;
        }
        if !store.supports_pruning() {
            return false;
        }

        let mut state = self.lock();
        if !state.pruned.insert(options.clone()) {
            debug!("store already pruned in this build");
            return false;
        }

        let signature = SignatureBuilder::new()
            .add_str("CasPruneData")
            .add_bytes(&serialization::to_bytes(options))
            .finish();
        let options = options.clone();
        let handle = tokio::task::spawn_blocking(move || prune_store(&*store, &options, signature));
        state.pending.push(handle);
        true
    }

    /// Wait for every prune started so far
    pub async fn wait_for_completion(&self) -> Vec<PruneReport> {
        let pending = std::mem::take(&mut self.lock().pending);
        let mut reports = Vec::with_capacity(pending.len());
        for handle in pending {
            match handle.await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(error = %e, "prune task did not complete"),
            }
        }
        reports
    }
}

fn prune_store(store: &dyn ContentStore, options: &CasOptions, signature: Signature) -> PruneReport {
    let mut report = PruneReport {
        signature,
        cas_path: options.cas_path.clone(),
        db_size: None,
        size_limit: None,
        notes: Vec::new(),
        error: None,
    };

    let result = (|| -> crate::Result<()> {
        let db_size = store.on_disk_size()?;
        let size_limit = compute_size_limit(options.limiting_strategy, db_size, &options.cas_path)?;
        report.db_size = db_size;
        report.size_limit = size_limit;
        if let (Some(db_size), Some(limit)) = (db_size, size_limit) {
            if limit < db_size {
                let note = format!("cache size ({db_size}) larger than size limit ({limit})");
                info!(cas = %options.cas_path.display(), "{}", note);
                report.notes.push(note);
            }
        }
        store.set_on_disk_size_limit(size_limit)?;
        store.prune()
    })();

    if let Err(e) = result {
        warn!(cas = %options.cas_path.display(), error = %e, "CAS prune failed");
        report.error = Some(e.to_string());
    }
    report
}
