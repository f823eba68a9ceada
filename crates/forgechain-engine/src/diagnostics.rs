//! Diagnostics ingestion seam (§4.9, §1 non-goal).
//!
//! `pipeline.py` runs Windows/SSH host scripts itself
//! (`diagnostics.windows.collect_windows_diagnostics`,
//! `diagnostics.ssh.collect_ssh_diagnostics`) and folds their output into
//! the request. Running arbitrary host scripts is out of scope here; the
//! orchestrator instead consumes an already-materialized file list through
//! this trait, so a caller (CLI, test harness, future host-script runner)
//! owns collection and the orchestrator only owns what to do with the
//! result: bundle it into a JSON blob, upload it, and optionally attach it
//! to a vector store.

use async_trait::async_trait;
use camino::Utf8PathBuf;

/// One already-collected diagnostics bundle: a set of local files under
/// `root`, ready to be packaged and uploaded.
#[derive(Debug, Clone, Default)]
pub struct DiagnosticsBundle {
    pub root: Utf8PathBuf,
    pub files: Vec<Utf8PathBuf>,
}

/// Supplies a pre-collected diagnostics bundle for a run, if any was
/// requested. The default `NoDiagnostics` collector always returns `None`,
/// matching a run with neither `diag_windows_in` nor `diag_ssh_in` set.
#[async_trait]
pub trait DiagnosticsCollector: Send + Sync {
    async fn collect(&self) -> anyhow::Result<Option<DiagnosticsBundle>>;
}

/// No diagnostics requested for this run.
pub struct NoDiagnostics;

#[async_trait]
impl DiagnosticsCollector for NoDiagnostics {
    async fn collect(&self) -> anyhow::Result<Option<DiagnosticsBundle>> {
        Ok(None)
    }
}
