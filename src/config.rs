#![forbid(unsafe_code)]

//! Runtime configuration for the CNVRTR backend.
//!
//! Values are resolved from three layers, highest priority first: explicit
//! overrides (CLI flags), process environment variables, then a local `.env`
//! file. Everything has a default so a bare `backend` invocation works on a
//! developer machine.

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_HOST: &str = "127.0.0.1";

const PORT_KEY: &str = "CNVRTR_PORT";
const HOST_KEY: &str = "CNVRTR_HOST";
const DOWNLOADS_ROOT_KEY: &str = "CNVRTR_DOWNLOADS_ROOT";
const YTDLP_BIN_KEY: &str = "CNVRTR_YTDLP_BIN";

/// Fully resolved settings the backend runs with.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Base directory under which per-playlist folders are created.
    pub downloads_root: PathBuf,
    pub port: u16,
    pub host: String,
    /// Explicit yt-dlp binary path; `None` means PATH lookup.
    pub ytdlp_bin: Option<PathBuf>,
}

/// CLI-level overrides; `None` falls through to env/.env/defaults.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOverrides {
    pub downloads_root: Option<PathBuf>,
    pub port: Option<u16>,
    pub host: Option<String>,
    pub ytdlp_bin: Option<PathBuf>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_runtime_config(overrides: RuntimeOverrides) -> Result<RuntimeConfig> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    build_runtime_config(&file_vars, env_var_string, overrides)
}

fn build_runtime_config(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: RuntimeOverrides,
) -> Result<RuntimeConfig> {
    let downloads_root = overrides
        .downloads_root
        .or_else(|| lookup_value(DOWNLOADS_ROOT_KEY, file_vars, &env_lookup).map(PathBuf::from))
        .or_else(default_downloads_root)
        .with_context(|| format!("{DOWNLOADS_ROOT_KEY} not set and no home directory found"))?;

    let port = overrides
        .port
        .or_else(|| {
            lookup_value(PORT_KEY, file_vars, &env_lookup)
                .and_then(|value| value.parse::<u16>().ok())
        })
        .unwrap_or(DEFAULT_PORT);

    let host = overrides
        .host
        .filter(|value| !value.trim().is_empty())
        .or_else(|| lookup_value(HOST_KEY, file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());

    let ytdlp_bin = overrides
        .ytdlp_bin
        .or_else(|| lookup_value(YTDLP_BIN_KEY, file_vars, &env_lookup).map(PathBuf::from));

    Ok(RuntimeConfig {
        downloads_root,
        port,
        host,
        ytdlp_bin,
    })
}

/// Mirrors the original behaviour of saving into the user's Downloads folder.
fn default_downloads_root() -> Option<PathBuf> {
    dirs::download_dir().or_else(|| dirs::home_dir().map(|home| home.join("Downloads")))
}

fn env_var_string(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn lookup_value(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    env_lookup(key).or_else(|| file_vars.get(key).cloned())
}

/// Parses a minimal `KEY=value` env file. Missing file means no overrides;
/// quotes around values are stripped, `#` lines are comments.
pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim().trim_matches('"').trim_matches('\'');
        if !key.is_empty() {
            vars.insert(key.to_string(), value.to_string());
        }
    }
    Ok(vars)
}
