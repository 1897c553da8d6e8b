//! LLM provider compatibility checks against an agent SDK, with an autofix loop.
//!
//! A run probes one provider profile through two stages (basic completion,
//! then a tool-calling agent loop) and records the outcome under a run
//! directory. A failed run can be handed to a coding agent that works in an
//! ephemeral git worktree; validated changes become an upstream pull request.
//!
//! - **[`core`]**: Pure, deterministic logic (redaction, failure classification,
//!   naming, change selection, record types). No I/O.
//! - **[`io`]**: Side-effecting adapters (filesystem, git, child processes,
//!   profile store, run ledger). Collaborators sit behind traits so tests can
//!   script them.
//!
//! Orchestration modules ([`run`], [`autofix`], [`cli`]) combine the two to
//! implement the `oh-llm` commands.

pub mod autofix;
pub mod cli;
pub mod core;
pub mod env;
pub mod error;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
