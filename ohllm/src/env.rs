//! Injectable view of the process environment.
//!
//! Everything that reads environment variables, the home directory, the clock,
//! or generates run identifiers goes through [`Env`], so tests can pin all four.

use std::path::PathBuf;

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;

pub trait Env {
    fn var(&self, name: &str) -> Option<String>;
    fn home_dir(&self) -> Option<PathBuf>;
    fn now(&self) -> DateTime<Utc>;
    /// 12 lowercase hex characters.
    fn new_run_id(&self) -> String;
}

/// The real process environment.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemEnv;

impl Env for SystemEnv {
    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }

    fn home_dir(&self) -> Option<PathBuf> {
        self.var("HOME")
            .or_else(|| self.var("USERPROFILE"))
            .filter(|value| !value.trim().is_empty())
            .map(PathBuf::from)
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn new_run_id(&self) -> String {
        let value: u64 = rand::thread_rng().r#gen::<u64>() & 0xffff_ffff_ffff;
        format!("{value:012x}")
    }
}

/// RFC 3339 timestamp with second precision and an explicit `+00:00` offset.
pub fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, false)
}
