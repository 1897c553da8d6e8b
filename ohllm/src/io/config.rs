//! Tool configuration stored at `~/.oh-llm/config.toml`.
//!
//! Precedence for every setting: CLI flag, then environment variable, then
//! this file, then the built-in default.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::env::Env;
use crate::error::Error;

pub const CONFIG_ENV: &str = "OH_LLM_CONFIG";
pub const RUNS_DIR_ENV: &str = "OH_LLM_RUNS_DIR";
pub const AGENT_SDK_PATH_ENV: &str = "OH_LLM_AGENT_SDK_PATH";

/// Tool configuration (TOML).
///
/// Missing fields default, so an absent file is equivalent to an empty one.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    /// Root for run directories. Defaults to `~/.oh-llm/runs`.
    pub runs_dir: Option<PathBuf>,

    /// Agent runtime checkout. Defaults to `~/repos/agent-sdk`.
    pub agent_sdk_path: Option<PathBuf>,

    pub stages: StageConfig,

    pub autofix: AutofixConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct StageConfig {
    /// Advisory timeout handed to the stage A probe.
    pub stage_a_timeout_secs: u64,
    /// Advisory timeout handed to the stage B probe.
    pub stage_b_timeout_secs: u64,
    pub stage_b_max_iterations: u32,
    pub stage_b_terminal_type: String,
    /// Package manager used to run probes inside the runtime checkout.
    pub uv_bin: String,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            stage_a_timeout_secs: 30,
            stage_b_timeout_secs: 60,
            stage_b_max_iterations: 50,
            stage_b_terminal_type: "subprocess".to_string(),
            uv_bin: "uv".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AutofixConfig {
    pub openhands_bin: String,
    pub gh_bin: String,
    /// `owner/name` of the repository pull requests target.
    pub upstream_repo: String,
    pub base: String,
    pub push_remote: String,
    pub draft: bool,
}

impl Default for AutofixConfig {
    fn default() -> Self {
        Self {
            openhands_bin: "openhands".to_string(),
            gh_bin: "gh".to_string(),
            upstream_repo: "OpenHands/software-agent-sdk".to_string(),
            base: "main".to_string(),
            push_remote: "oh-llm-fork".to_string(),
            draft: false,
        }
    }
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        if self.stages.stage_a_timeout_secs == 0 || self.stages.stage_b_timeout_secs == 0 {
            return Err(anyhow!("stage timeouts must be > 0"));
        }
        if self.stages.stage_b_max_iterations == 0 {
            return Err(anyhow!("stages.stage_b_max_iterations must be > 0"));
        }
        for (name, value) in [
            ("stages.uv_bin", &self.stages.uv_bin),
            ("autofix.openhands_bin", &self.autofix.openhands_bin),
            ("autofix.gh_bin", &self.autofix.gh_bin),
            ("autofix.base", &self.autofix.base),
            ("autofix.push_remote", &self.autofix.push_remote),
        ] {
            if value.trim().is_empty() {
                return Err(anyhow!("{name} must be non-empty"));
            }
        }
        let repo = self.autofix.upstream_repo.trim();
        if repo.split('/').filter(|part| !part.is_empty()).count() != 2 {
            return Err(anyhow!(
                "autofix.upstream_repo must look like owner/name, got '{repo}'"
            ));
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AppConfig::default()`.
pub fn load_config(path: &Path) -> Result<AppConfig> {
    if !path.exists() {
        let cfg = AppConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AppConfig = toml::from_str(&contents)
        .map_err(|err| Error::Config(format!("parse {}: {err}", path.display())))?;
    cfg.validate()
        .map_err(|err| Error::Config(format!("{}: {err}", path.display())))?;
    Ok(cfg)
}

/// `~/.oh-llm`, the tool's state root.
pub fn state_root(env: &dyn Env) -> Result<PathBuf> {
    Ok(home(env)?.join(".oh-llm"))
}

/// Config path: explicit flag, then `OH_LLM_CONFIG`, then `~/.oh-llm/config.toml`.
pub fn config_path(env: &dyn Env, flag: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(expand_home(env, path));
    }
    if let Some(value) = non_empty_var(env, CONFIG_ENV) {
        return Ok(expand_home(env, Path::new(&value)));
    }
    Ok(state_root(env)?.join("config.toml"))
}

pub fn resolve_runs_dir(env: &dyn Env, cfg: &AppConfig, flag: Option<&Path>) -> Result<PathBuf> {
    resolve_path(env, flag, RUNS_DIR_ENV, cfg.runs_dir.as_deref(), || {
        Ok(state_root(env)?.join("runs"))
    })
}

pub fn resolve_agent_sdk_path(
    env: &dyn Env,
    cfg: &AppConfig,
    flag: Option<&Path>,
) -> Result<PathBuf> {
    resolve_path(
        env,
        flag,
        AGENT_SDK_PATH_ENV,
        cfg.agent_sdk_path.as_deref(),
        || Ok(home(env)?.join("repos").join("agent-sdk")),
    )
}

/// Expand a leading `~` to the home directory.
pub fn expand_home(env: &dyn Env, path: &Path) -> PathBuf {
    let Ok(rest) = path.strip_prefix("~") else {
        return path.to_path_buf();
    };
    match env.home_dir() {
        Some(home) => home.join(rest),
        None => path.to_path_buf(),
    }
}

fn resolve_path(
    env: &dyn Env,
    flag: Option<&Path>,
    env_name: &str,
    configured: Option<&Path>,
    default: impl FnOnce() -> Result<PathBuf>,
) -> Result<PathBuf> {
    if let Some(path) = flag {
        return Ok(expand_home(env, path));
    }
    if let Some(value) = non_empty_var(env, env_name) {
        return Ok(expand_home(env, Path::new(&value)));
    }
    if let Some(path) = configured {
        return Ok(expand_home(env, path));
    }
    default()
}

fn non_empty_var(env: &dyn Env, name: &str) -> Option<String> {
    env.var(name).filter(|value| !value.trim().is_empty())
}

fn home(env: &dyn Env) -> Result<PathBuf> {
    env.home_dir()
        .ok_or_else(|| Error::Config("HOME is not set".to_string()).into())
}
