//! `clap` CLI surface (§6): `run`, `resume`, `cascade run`, `cascade
//! validate`, `audit`, `probe`. Grounded on the teacher's
//! `xchecker-cli/src/lib.rs` re-export shape and `src/cli/{args,run}.rs`'s
//! parse-then-dispatch-then-exit-code pattern, since the teacher's own
//! `xchecker-cli` crate is itself a placeholder and the real implementation
//! lived at its workspace root.

pub mod args;
mod commands;
mod run;

pub use args::{Cli, Commands};
pub use run::run;
