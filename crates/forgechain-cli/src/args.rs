//! `clap`-derive argument surface (§6), grounded on the teacher's
//! `src/cli/args.rs`: one top-level `Cli` struct carrying the flags shared
//! by every subcommand, plus a `Commands` enum with one variant per verb.

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser, Debug)]
#[command(name = "forgechain", version, about = "LLM-backed code generation and modification pipeline")]
pub struct Cli {
    /// Path to a `forgechain.json` settings file; overrides discovery.
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Verbose (debug-level, span-annotated) logging.
    #[arg(long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ModeArg {
    Generate,
    Modify,
    Qa,
    Qfile,
    Batch,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    /// Which pipeline mode to run; `batch` means GENERATE/MODIFY with
    /// `send_as_c` set, per the original's independent mode/flag pair.
    #[arg(long, value_enum)]
    pub mode: ModeArg,

    #[arg(long)]
    pub project: String,

    #[arg(long)]
    pub prompt_file: String,

    #[arg(long)]
    pub in_dir: Option<String>,

    #[arg(long)]
    pub out_dir: String,

    /// Snapshot OUT into a timestamped sibling directory before overwriting.
    #[arg(long)]
    pub versing: bool,

    #[arg(long)]
    pub model: Option<String>,

    #[arg(long)]
    pub temperature: Option<f64>,

    #[arg(long)]
    pub use_file_search: bool,

    /// Existing response id to chain from (QA/QFILE only).
    #[arg(long)]
    pub response_id: Option<String>,
}

#[derive(Args, Debug)]
pub struct ResumeArgs {
    #[arg(long)]
    pub project: String,

    /// Response id whose A2_STRUCTURE output this resumes from.
    #[arg(long)]
    pub response_id: String,

    /// Path to the saved A2_STRUCTURE JSON array of `{path, content}` file
    /// entries to resume A3 generation from.
    #[arg(long)]
    pub files_json: String,

    #[arg(long)]
    pub out_dir: String,

    #[arg(long)]
    pub model: Option<String>,

    #[arg(long)]
    pub versing: bool,
}

#[derive(Subcommand, Debug)]
pub enum CascadeCommands {
    /// Execute every step of a cascade definition file in order.
    Run {
        definition: String,
        #[arg(long)]
        out_dir: Option<String>,
        #[arg(long)]
        project: Option<String>,
    },
    /// Parse and structurally validate a cascade definition file without
    /// calling the remote model.
    Validate { definition: String },
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run one GENERATE/MODIFY/QA/QFILE/BATCH pipeline invocation.
    Run(RunArgs),
    /// Resume a GENERATE run from previously saved A2_STRUCTURE output.
    Resume(ResumeArgs),
    #[command(subcommand)]
    Cascade(CascadeCommands),
    /// Reconcile receipts against `LOG/RUN_*`/`LOG/TEST_*` directories.
    Audit {
        #[arg(long)]
        log_root: Option<String>,
    },
    /// Probe one or more models for capability flags.
    Probe {
        /// Model id to probe; repeatable.
        #[arg(long = "model")]
        models: Vec<String>,
        /// Re-probe even if the cached record isn't stale yet.
        #[arg(long)]
        all: bool,
        /// Vector store id to use for the file_search capability probe.
        #[arg(long)]
        vector_store_id: Option<String>,
    },
}
