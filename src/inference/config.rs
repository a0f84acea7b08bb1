//! Client configuration loading.
//!
//! Reads `remy.yaml` and resolves environment variables. Every field is
//! optional; anything missing falls back to the built-in defaults below, and
//! a missing file means "all defaults".

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use super::errors::InferenceError;

// ─── Defaults ────────────────────────────────────────────────────────────────

/// Messages API endpoint.
pub const DEFAULT_ENDPOINT: &str = "https://api.anthropic.com/v1/messages";

/// Model used for chat completions.
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-20250514";

/// Output token budget per reply.
pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Value of the `anthropic-version` header.
pub const DEFAULT_API_VERSION: &str = "2023-06-01";

/// Environment variable the default secret supplier reads.
pub const DEFAULT_API_KEY_ENV: &str = "ANTHROPIC_API_KEY";

const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Total request timeout, including the time spent streaming the body.
///
/// Long replies at 4096 output tokens can take a couple of minutes, so this
/// only exists to stop a hung connection from blocking a turn forever.
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 300;

const CONFIG_FILE_NAME: &str = "remy.yaml";

// ─── Public Types ────────────────────────────────────────────────────────────

/// Runtime configuration for the completion client (mirrors `remy.yaml`).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RemyConfig {
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
    pub api_version: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for RemyConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            api_version: DEFAULT_API_VERSION.to_string(),
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl RemyConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

// ─── Loading ─────────────────────────────────────────────────────────────────

/// Locate the config file.
///
/// Resolution order:
/// 1. `REMY_CONFIG` env var, if it names an existing file.
/// 2. `remy.yaml` in `start` or any of its ancestors.
/// 3. `<config_dir>/remy/config.yaml` (e.g. `~/.config/remy/config.yaml`).
///
/// Returns `None` when nothing is found; callers fall back to defaults.
pub fn find_config_path(start: &Path) -> Option<PathBuf> {
    if let Ok(path) = std::env::var("REMY_CONFIG") {
        let candidate = PathBuf::from(expand_tilde(&path));
        if candidate.is_file() {
            return Some(candidate);
        }
        tracing::warn!(path = %candidate.display(), "REMY_CONFIG does not point to a file");
    }

    let mut dir = start.to_path_buf();
    loop {
        let candidate = dir.join(CONFIG_FILE_NAME);
        if candidate.is_file() {
            return Some(candidate);
        }
        if !dir.pop() {
            break;
        }
    }

    dirs::config_dir()
        .map(|d| d.join("remy").join("config.yaml"))
        .filter(|p| p.is_file())
}

/// Load and parse a config file.
///
/// Performs environment-variable interpolation on `${VAR_NAME}` and
/// `${VAR_NAME:-default}` before parsing.
pub fn load_config(path: &Path) -> Result<RemyConfig, InferenceError> {
    let raw = std::fs::read_to_string(path).map_err(|e| InferenceError::ConfigError {
        reason: format!("failed to read {}: {e}", path.display()),
    })?;

    parse_config(&raw)
}

/// Parse config YAML text. An empty document yields the defaults.
pub fn parse_config(raw: &str) -> Result<RemyConfig, InferenceError> {
    let interpolated = interpolate_env_vars(raw);
    if interpolated.trim().is_empty() {
        return Ok(RemyConfig::default());
    }

    let config: RemyConfig =
        serde_yaml::from_str(&interpolated).map_err(|e| InferenceError::ConfigError {
            reason: format!("failed to parse config: {e}"),
        })?;

    validate(&config)?;
    Ok(config)
}

/// Find and load the config, or fall back to defaults when no file exists.
pub fn load_or_default(start: &Path) -> Result<RemyConfig, InferenceError> {
    match find_config_path(start) {
        Some(path) => {
            let config = load_config(&path)?;
            tracing::info!(path = %path.display(), model = %config.model, "loaded config");
            Ok(config)
        }
        None => {
            tracing::info!("no config file found, using defaults");
            Ok(RemyConfig::default())
        }
    }
}

fn validate(config: &RemyConfig) -> Result<(), InferenceError> {
    if config.model.trim().is_empty() {
        return Err(InferenceError::ConfigError {
            reason: "model must not be empty".into(),
        });
    }
    if config.max_tokens == 0 {
        return Err(InferenceError::ConfigError {
            reason: "max_tokens must be greater than zero".into(),
        });
    }
    if config.api_key_env.trim().is_empty() {
        return Err(InferenceError::ConfigError {
            reason: "api_key_env must not be empty".into(),
        });
    }
    Ok(())
}

// ─── Env-var interpolation ───────────────────────────────────────────────────

/// Substitute `${VAR}` and `${VAR:-default}` references.
///
/// As in POSIX shells, the default applies when `VAR` is unset or empty. An
/// unterminated `${` is copied through as written.
fn interpolate_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let body = &rest[open + 2..];
        let Some(close) = body.find('}') else {
            out.push_str(&rest[open..]);
            return out;
        };
        out.push_str(&lookup_var(&body[..close]));
        rest = &body[close + 1..];
    }

    out.push_str(rest);
    out
}

/// Value of one `VAR` or `VAR:-default` reference. Defaults get `~` expanded.
fn lookup_var(expr: &str) -> String {
    let (name, default) = match expr.split_once(":-") {
        Some((name, default)) => (name, Some(default)),
        None => (expr, None),
    };

    match std::env::var(name).ok().filter(|v| !v.is_empty()) {
        Some(value) => value,
        None => default.map(expand_tilde).unwrap_or_default(),
    }
}

/// Expand `~` or a leading `~/` to the home directory. `~user` forms are
/// left alone.
fn expand_tilde(path: &str) -> String {
    let rest = match path.strip_prefix('~') {
        Some(rest) if rest.is_empty() || rest.starts_with(['/', '\\']) => rest,
        _ => return path.to_string(),
    };
    match dirs::home_dir() {
        Some(home) => format!("{}{rest}", home.display()),
        None => path.to_string(),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
