//! Side-effecting adapters: filesystem, git, child processes.

pub mod agent;
pub mod archive;
pub mod artifacts;
pub mod config;
pub mod gh;
pub mod git;
pub mod ledger;
pub mod probe;
pub mod process;
pub mod profiles;
pub mod sdk;
pub mod worktree;
