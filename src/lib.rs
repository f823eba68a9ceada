//! forgechain - an LLM-backed code generation and modification pipeline with
//! durable cost receipts and gateable JSON contracts (§1, §2).
//!
//! The root crate is a thin facade: every concern lives in its own
//! `forgechain-*` crate (`forgechain-engine` for the GENERATE/MODIFY/QA/
//! QFILE/BATCH state machine, `forgechain-cascade` for the generic N-step
//! cascade runner, `forgechain-cli` for the `clap` surface, and so on); this
//! crate only re-exports the pieces an external consumer or the `forgechain`
//! binary needs.

/// The crate's semantic version, as published.
#[must_use]
pub fn forgechain_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub use forgechain_cascade as cascade;
pub use forgechain_capability as capability;
pub use forgechain_client as client;
pub use forgechain_config as config;
pub use forgechain_engine as engine;
pub use forgechain_manifest as manifest;
pub use forgechain_pricing as pricing;
pub use forgechain_receipt as receipt;
pub use forgechain_utils as utils;

pub use forgechain_utils::error::ForgeError;
