//! Pipeline orchestrator: GENERATE/MODIFY/QA/QFILE/BATCH (§4.9).
//!
//! Ports `pipeline.py`'s `RunWorker.run` onto an async `tokio` task in the
//! same shape [`forgechain_cascade::CascadeOrchestrator`] already
//! established for the generic cascade path: one struct holding the
//! long-lived collaborators (remote client, retry policy, breaker, receipt
//! db, price table, run-log base dir), a `run()` entry point that always
//! produces a terminal run-state record, and per-mode handlers dispatched
//! from it.
//!
//! Host-side diagnostics collection (Windows/SSH script execution) is
//! deliberately not ported; see [`diagnostics::DiagnosticsCollector`].
//! Whole-IN-directory zip-and-upload (`_prepare_in_dir_upload` /
//! `_zip_in_dir`) is also not ported — no crate in this workspace's
//! dependency stack writes zip archives, and MODIFY mode's per-file
//! manifest upload already covers IN-directory ingestion without one.

pub mod config;
pub mod diagnostics;
pub mod orchestrator;
pub mod payload;

pub use config::{Mode, RunConfig};
pub use diagnostics::{DiagnosticsBundle, DiagnosticsCollector, NoDiagnostics};
pub use orchestrator::{PipelineOrchestrator, PipelineResult, ProgressEvent};
