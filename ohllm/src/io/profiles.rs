//! Provider profiles.
//!
//! A profile is split across two files that share an id:
//!
//! - `~/.openhands/llm-profiles/<id>.json`: provider settings read by the agent
//!   runtime (`profile_id`, `model`, optional `base_url`).
//! - `~/.oh-llm/profiles/<id>.json`: tool metadata (`api_key_env`, timestamps).
//!
//! Neither file ever stores a key. The key is referenced by the name of the
//! environment variable that holds it, and any `api_key` field found in an
//! existing settings file is dropped on the next write.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, instrument};

use crate::core::types::ResolvedProfile;
use crate::env::{Env, timestamp};
use crate::error::Error;
use crate::io::artifacts::{PRIVATE_FILE_MODE, restrict_permissions, write_json};
use crate::io::config::state_root;

pub const PROFILE_SCHEMA_VERSION: u32 = 1;

static PROFILE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9._-]+$").expect("profile id pattern should compile"));
static ENV_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("env name pattern should compile")
});

/// Tool-side metadata for a profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileMetadata {
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
    pub profile_id: String,
    pub api_key_env: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

fn default_schema_version() -> u32 {
    PROFILE_SCHEMA_VERSION
}

/// Union of both profile files.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    pub profile_id: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key_env: Option<String>,
    pub sdk_profile_path: PathBuf,
    pub metadata_path: PathBuf,
}

impl Profile {
    pub fn resolved(&self) -> ResolvedProfile {
        ResolvedProfile {
            model: self.model.clone(),
            base_url: self.base_url.clone(),
            api_key_env: self.api_key_env.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewProfile {
    pub profile_id: String,
    pub model: String,
    pub base_url: Option<String>,
    pub api_key_env: String,
}

/// Field changes for `profile edit`. `None` leaves a field untouched.
#[derive(Debug, Clone, Default)]
pub struct ProfileUpdate {
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub clear_base_url: bool,
    pub api_key_env: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ProfileStore {
    sdk_dir: PathBuf,
    meta_dir: PathBuf,
}

impl ProfileStore {
    pub fn new(sdk_dir: impl Into<PathBuf>, meta_dir: impl Into<PathBuf>) -> Self {
        Self {
            sdk_dir: sdk_dir.into(),
            meta_dir: meta_dir.into(),
        }
    }

    /// Store rooted at the standard locations under the home directory.
    pub fn from_env(env: &dyn Env) -> Result<Self> {
        let home = env
            .home_dir()
            .ok_or_else(|| Error::Config("HOME is not set".to_string()))?;
        Ok(Self::new(
            home.join(".openhands").join("llm-profiles"),
            state_root(env)?.join("profiles"),
        ))
    }

    fn sdk_path(&self, id: &str) -> PathBuf {
        self.sdk_dir.join(format!("{id}.json"))
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.meta_dir.join(format!("{id}.json"))
    }

    #[instrument(skip_all, fields(profile_id = %new.profile_id))]
    pub fn add(&self, env: &dyn Env, new: &NewProfile, overwrite: bool) -> Result<Profile> {
        validate_profile_id(&new.profile_id)?;
        validate_env_name(&new.api_key_env)?;
        if new.model.trim().is_empty() {
            return Err(Error::InvalidInput("model must be non-empty".to_string()).into());
        }
        let sdk_path = self.sdk_path(&new.profile_id);
        let meta_path = self.meta_path(&new.profile_id);
        if !overwrite && (sdk_path.exists() || meta_path.exists()) {
            return Err(Error::InvalidInput(format!(
                "profile '{}' already exists (use --overwrite)",
                new.profile_id
            ))
            .into());
        }

        let created_at = match read_metadata(&meta_path)? {
            Some(existing) => existing.created_at,
            None => timestamp(env.now()),
        };
        let mut settings = Map::new();
        settings.insert("profile_id".into(), Value::String(new.profile_id.clone()));
        settings.insert("model".into(), Value::String(new.model.trim().to_string()));
        if let Some(url) = normalize_url(new.base_url.as_deref()) {
            settings.insert("base_url".into(), Value::String(url));
        }
        write_private(&sdk_path, &Value::Object(settings))?;

        let metadata = ProfileMetadata {
            schema_version: PROFILE_SCHEMA_VERSION,
            profile_id: new.profile_id.clone(),
            api_key_env: new.api_key_env.clone(),
            updated_at: overwrite.then(|| timestamp(env.now())),
            created_at,
        };
        write_private(&meta_path, &metadata)?;
        debug!("profile written");
        self.get(&new.profile_id)
    }

    pub fn get(&self, id: &str) -> Result<Profile> {
        validate_profile_id(id)?;
        let sdk_path = self.sdk_path(id);
        let meta_path = self.meta_path(id);
        let settings = read_settings(&sdk_path)?;
        let metadata = read_metadata(&meta_path)?;
        if settings.is_none() && metadata.is_none() {
            return Err(Error::Config(format!("profile '{id}' not found")).into());
        }
        let settings = settings.unwrap_or_default();
        let model = settings
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let base_url = settings
            .get("base_url")
            .and_then(Value::as_str)
            .and_then(|url| normalize_url(Some(url)));
        Ok(Profile {
            profile_id: id.to_string(),
            model,
            base_url,
            api_key_env: metadata.map(|meta| meta.api_key_env),
            sdk_profile_path: sdk_path,
            metadata_path: meta_path,
        })
    }

    /// Sorted union of ids present in either directory.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = BTreeSet::new();
        for dir in [&self.sdk_dir, &self.meta_dir] {
            ids.extend(json_stems(dir)?);
        }
        Ok(ids.into_iter().collect())
    }

    #[instrument(skip_all, fields(profile_id = id))]
    pub fn update(&self, env: &dyn Env, id: &str, update: &ProfileUpdate) -> Result<Profile> {
        let current = self.get(id)?;
        if let Some(name) = &update.api_key_env {
            validate_env_name(name)?;
        }
        if update.clear_base_url && update.base_url.is_some() {
            return Err(Error::InvalidInput(
                "--base-url and --clear-base-url are mutually exclusive".to_string(),
            )
            .into());
        }

        let sdk_path = self.sdk_path(id);
        let mut settings = read_settings(&sdk_path)?.unwrap_or_default();
        settings.remove("api_key");
        settings.insert("profile_id".into(), Value::String(id.to_string()));
        if let Some(model) = &update.model {
            if model.trim().is_empty() {
                return Err(Error::InvalidInput("model must be non-empty".to_string()).into());
            }
            settings.insert("model".into(), Value::String(model.trim().to_string()));
        }
        if update.clear_base_url {
            settings.remove("base_url");
        } else if let Some(url) = normalize_url(update.base_url.as_deref()) {
            settings.insert("base_url".into(), Value::String(url));
        }
        write_private(&sdk_path, &Value::Object(settings))?;

        let meta_path = self.meta_path(id);
        let api_key_env = match (&update.api_key_env, current.api_key_env) {
            (Some(name), _) => name.clone(),
            (None, Some(existing)) => existing,
            (None, None) => {
                return Err(Error::InvalidInput(format!(
                    "profile '{id}' has no api_key_env; pass --api-key-env"
                ))
                .into());
            }
        };
        let created_at = read_metadata(&meta_path)?
            .map(|meta| meta.created_at)
            .unwrap_or_else(|| timestamp(env.now()));
        let metadata = ProfileMetadata {
            schema_version: PROFILE_SCHEMA_VERSION,
            profile_id: id.to_string(),
            api_key_env,
            created_at,
            updated_at: Some(timestamp(env.now())),
        };
        write_private(&meta_path, &metadata)?;
        self.get(id)
    }

    /// Remove both files. Returns whether anything was deleted.
    pub fn delete(&self, id: &str, missing_ok: bool) -> Result<bool> {
        validate_profile_id(id)?;
        let mut removed = false;
        for path in [self.sdk_path(id), self.meta_path(id)] {
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("remove {}", path.display()));
                }
            }
        }
        if !removed && !missing_ok {
            return Err(Error::Config(format!("profile '{id}' not found")).into());
        }
        Ok(removed)
    }
}

pub fn validate_profile_id(id: &str) -> Result<()> {
    if id == "." || id == ".." || !PROFILE_ID_RE.is_match(id) {
        return Err(Error::InvalidInput(format!(
            "invalid profile id '{id}' (allowed: letters, digits, '.', '_', '-')"
        ))
        .into());
    }
    Ok(())
}

pub fn validate_env_name(name: &str) -> Result<()> {
    if !ENV_NAME_RE.is_match(name) {
        return Err(Error::InvalidInput(format!(
            "invalid environment variable name '{name}'"
        ))
        .into());
    }
    Ok(())
}

fn normalize_url(url: Option<&str>) -> Option<String> {
    url.map(str::trim)
        .filter(|url| !url.is_empty())
        .map(str::to_string)
}

fn write_private<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    write_json(path, value)?;
    restrict_permissions(path, PRIVATE_FILE_MODE);
    Ok(())
}

fn read_settings(path: &Path) -> Result<Option<Map<String, Value>>> {
    let Some(contents) = read_optional(path)? else {
        return Ok(None);
    };
    match serde_json::from_str::<Value>(&contents) {
        Ok(Value::Object(map)) => Ok(Some(map)),
        Ok(_) | Err(_) => Err(Error::Config(format!(
            "profile settings {} are not a JSON object",
            path.display()
        ))
        .into()),
    }
}

fn read_metadata(path: &Path) -> Result<Option<ProfileMetadata>> {
    let Some(contents) = read_optional(path)? else {
        return Ok(None);
    };
    let metadata = serde_json::from_str(&contents).map_err(|err| {
        Error::Config(format!("profile metadata {}: {err}", path.display()))
    })?;
    Ok(Some(metadata))
}

fn read_optional(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

fn json_stems(dir: &Path) -> Result<Vec<String>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("read {}", dir.display())),
    };
    let mut stems = Vec::new();
    for entry in entries {
        let path = entry
            .with_context(|| format!("read entry in {}", dir.display()))?
            .path();
        if path.extension().is_some_and(|ext| ext == "json")
            && let Some(stem) = path.file_stem().and_then(|stem| stem.to_str())
            && PROFILE_ID_RE.is_match(stem)
        {
            stems.push(stem.to_string());
        }
    }
    Ok(stems)
}
