//! Secret scrubbing for every persisted or emitted artifact.
//!
//! A [`Redactor`] is an immutable value built once per command from the secret
//! literals it must hide (typically the values of the profile's API key
//! variables). It is passed explicitly to every writer; there is no global
//! registry. On top of the literals, two heuristics catch credentials the
//! redactor was never told about: `Authorization: Bearer` headers and bare
//! `sk-` style keys.

use std::fmt;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::env::Env;

/// Replacement marker written in place of any secret.
pub const REDACTED: &str = "<REDACTED>";

/// Object keys whose values are always replaced, compared trimmed and lower-cased.
const SECRET_KEYS: [&str; 9] = [
    "api_key",
    "apikey",
    "api-key",
    "authorization",
    "token",
    "access_token",
    "refresh_token",
    "secret",
    "password",
];

static BEARER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(authorization\s*:\s*bearer)\s+[A-Za-z0-9\-._=+/]+")
        .expect("bearer pattern should compile")
});

static SK_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\bsk-[A-Za-z0-9]{20,}\b").expect("sk pattern should compile"));

#[derive(Clone, Default)]
pub struct Redactor {
    /// Non-empty literals, longest first so overlapping secrets leave no fragments.
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut secrets: Vec<String> = secrets
            .into_iter()
            .map(Into::into)
            .filter(|secret| !secret.is_empty())
            .collect();
        secrets.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        secrets.dedup();
        Self { secrets }
    }

    /// Build a redactor from the current values of the named environment variables.
    ///
    /// Unset or empty variables contribute nothing.
    pub fn from_env_names<S: AsRef<str>>(env: &dyn Env, names: &[S]) -> Self {
        Self::new(names.iter().filter_map(|name| env.var(name.as_ref())))
    }

    /// Number of literal secrets this redactor hides.
    pub fn secret_count(&self) -> usize {
        self.secrets.len()
    }

    pub fn redact_text(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), REDACTED);
            }
        }
        let out = BEARER_RE.replace_all(&out, format!("${{1}} {REDACTED}").as_str());
        SK_KEY_RE.replace_all(&out, REDACTED).into_owned()
    }

    pub fn redact_value(&self, value: &Value) -> Value {
        match value {
            Value::String(text) => Value::String(self.redact_text(text)),
            Value::Array(items) => {
                Value::Array(items.iter().map(|item| self.redact_value(item)).collect())
            }
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (key, item) in map {
                    let redacted = if is_secret_key(key) {
                        Value::String(REDACTED.to_string())
                    } else {
                        self.redact_value(item)
                    };
                    out.insert(key.clone(), redacted);
                }
                Value::Object(out)
            }
            Value::Null | Value::Bool(_) | Value::Number(_) => value.clone(),
        }
    }

    /// Serialize, redact and pretty-print `value` with a trailing newline.
    pub fn to_json<T: Serialize + ?Sized>(&self, value: &T) -> Result<String> {
        let raw = serde_json::to_value(value).context("serialize json")?;
        let mut buf =
            serde_json::to_string_pretty(&self.redact_value(&raw)).context("render json")?;
        buf.push('\n');
        Ok(buf)
    }
}

impl fmt::Debug for Redactor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Redactor")
            .field("secrets", &format_args!("[{} hidden]", self.secrets.len()))
            .finish()
    }
}

fn is_secret_key(key: &str) -> bool {
    let normalized = key.trim().to_ascii_lowercase();
    SECRET_KEYS.contains(&normalized.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn replaces_every_literal_occurrence() {
        let redactor = Redactor::new(["hunter2"]);
        assert_eq!(
            redactor.redact_text("a hunter2 b hunter2"),
            "a <REDACTED> b <REDACTED>"
        );
    }

    #[test]
    fn longer_secret_wins_over_its_prefix() {
        let redactor = Redactor::new(["abc", "abcdef"]);
        assert_eq!(redactor.redact_text("key=abcdef"), "key=<REDACTED>");
    }

    #[test]
    fn empty_secrets_are_ignored() {
        let redactor = Redactor::new(["", "x1"]);
        assert_eq!(redactor.secret_count(), 1);
        assert_eq!(redactor.redact_text("plain"), "plain");
    }

    #[test]
    fn bearer_header_keeps_prefix() {
        let redactor = Redactor::default();
        assert_eq!(
            redactor.redact_text("authorization: Bearer abc.DEF-123"),
            "authorization: Bearer <REDACTED>"
        );
    }

    #[test]
    fn sk_keys_are_scrubbed_without_configuration() {
        let redactor = Redactor::default();
        let text = "leaked sk-abcdefghijklmnopqrstuvwxyz0123 here";
        assert_eq!(redactor.redact_text(text), "leaked <REDACTED> here");
        assert_eq!(redactor.redact_text("sk-short"), "sk-short");
    }

    #[test]
    fn secret_named_keys_are_replaced_at_any_depth() {
        let redactor = Redactor::default();
        let value = json!({
            "outer": [{" API_KEY ": "raw", "Token": 5, "keep": 1}],
            "password": {"nested": true},
        });
        let redacted = redactor.redact_value(&value);
        assert_eq!(
            redacted,
            json!({
                "outer": [{" API_KEY ": REDACTED, "Token": REDACTED, "keep": 1}],
                "password": REDACTED,
            })
        );
    }

    #[test]
    fn scalars_pass_through() {
        let redactor = Redactor::new(["1"]);
        assert_eq!(redactor.redact_value(&json!(1)), json!(1));
        assert_eq!(redactor.redact_value(&json!(null)), json!(null));
        assert_eq!(redactor.redact_value(&json!("1")), json!(REDACTED));
    }

    #[test]
    fn to_json_is_pretty_and_redacted() {
        let redactor = Redactor::new(["s3cr3t"]);
        let out = redactor
            .to_json(&json!({"msg": "value s3cr3t"}))
            .expect("json");
        assert_eq!(out, "{\n  \"msg\": \"value <REDACTED>\"\n}\n");
    }

    #[test]
    fn debug_does_not_print_secrets() {
        let redactor = Redactor::new(["topsecretvalue"]);
        let debug = format!("{redactor:?}");
        assert!(!debug.contains("topsecretvalue"));
        assert!(debug.contains("1 hidden"));
    }
}
