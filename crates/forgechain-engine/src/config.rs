//! Per-run configuration, ported from `pipeline.py`'s `UiRunConfig` (§4.9).
//!
//! The Windows/SSH diagnostics fields (`diag_windows_*`, `diag_ssh_*`,
//! `ssh_*`) are dropped: diagnostics collection is a
//! [`crate::diagnostics::DiagnosticsCollector`] seam, not a config-level
//! toggle, so the orchestrator never needs to know which host-side script
//! produced the files it was handed.

use camino::Utf8PathBuf;
use forgechain_capability::ModelCapabilities;
use serde_json::Value;

/// One GENERATE/MODIFY/QA/QFILE/BATCH run's configuration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub project: String,
    pub prompt: String,
    pub mode: Mode,
    pub send_as_c: bool,
    pub model: String,
    pub response_id: Option<String>,
    pub attached_file_ids: Vec<String>,
    pub input_file_ids: Vec<String>,
    pub attached_vector_store_ids: Vec<String>,
    pub in_dir: Option<Utf8PathBuf>,
    pub out_dir: Utf8PathBuf,
    pub versing: bool,
    pub temperature: f64,
    pub use_file_search: bool,
    pub skip_paths: Vec<String>,
    pub skip_exts: Vec<String>,
    pub model_caps: ModelCapabilities,
    /// Precomputed A2_STRUCTURE files plus the response id to chain from,
    /// for a GENERATE rerun that should skip A1/A2 entirely.
    pub resume_files: Option<Vec<Value>>,
    pub resume_prev_id: Option<String>,
}

impl RunConfig {
    /// Mirrors `_input_file_ids`: prefer the dedicated list, falling back to
    /// the general attachment list when it was never populated.
    #[must_use]
    pub fn input_file_ids_or_attached(&self) -> Vec<String> {
        if !self.input_file_ids.is_empty() {
            self.input_file_ids.clone()
        } else {
            self.attached_file_ids.clone()
        }
    }
}

/// The four user-selectable modes; `send_as_c` on [`Mode::Generate`] or
/// [`Mode::Modify`] additionally routes the run through the batch path
/// (§4.9.5), matching the original's independent `mode`/`send_as_c` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Generate,
    Modify,
    Qa,
    Qfile,
}

impl Mode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Generate => "GENERATE",
            Mode::Modify => "MODIFY",
            Mode::Qa => "QA",
            Mode::Qfile => "QFILE",
        }
    }
}
