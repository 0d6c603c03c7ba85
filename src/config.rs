#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use std::{
    collections::HashMap,
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

pub const DEFAULT_ENV_PATH: &str = ".env";
pub const DEFAULT_PORT: u16 = 8080;
pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_YTDLP: &str = "yt-dlp";
pub const DEFAULT_TIMEOUT_SECS: u64 = 30 * 60;
pub const DEFAULT_ARTIFACT_TTL_SECS: u64 = 10 * 60;

/// Everything the binaries need to know at runtime.
#[derive(Debug, Clone)]
pub struct Settings {
    pub host: String,
    pub port: u16,
    pub ytdlp_program: PathBuf,
    /// Parent directory for the per-request scratch directories.
    pub scratch_root: PathBuf,
    /// Where save-to-disk requests land when no destination is given.
    pub download_dir: PathBuf,
    pub network_timeout: Duration,
    pub artifact_ttl: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct SettingsOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub ytdlp_program: Option<PathBuf>,
    pub scratch_root: Option<PathBuf>,
    pub download_dir: Option<PathBuf>,
    pub network_timeout_secs: Option<u64>,
    pub env_path: Option<PathBuf>,
}

pub fn resolve_settings(overrides: SettingsOverrides) -> Result<Settings> {
    let env_path = overrides
        .env_path
        .as_deref()
        .unwrap_or_else(|| Path::new(DEFAULT_ENV_PATH));
    let file_vars = read_env_file(env_path)?;
    Ok(build_settings_with_overrides(
        &file_vars,
        env_var_string,
        overrides,
    ))
}

#[cfg(test)]
fn build_settings(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
) -> Settings {
    build_settings_with_overrides(file_vars, env_lookup, SettingsOverrides::default())
}

fn build_settings_with_overrides(
    file_vars: &HashMap<String, String>,
    env_lookup: impl Fn(&str) -> Option<String>,
    overrides: SettingsOverrides,
) -> Settings {
    let host = overrides
        .host
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .or_else(|| lookup_value("TUBEGRAB_HOST", file_vars, &env_lookup))
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_HOST.to_string());
    // PORT is what most hosting platforms inject; the prefixed key wins when
    // both are present.
    let port = overrides
        .port
        .or_else(|| parse_number("TUBEGRAB_PORT", file_vars, &env_lookup))
        .or_else(|| parse_number("PORT", file_vars, &env_lookup))
        .unwrap_or(DEFAULT_PORT);
    let ytdlp_program = overrides
        .ytdlp_program
        .or_else(|| lookup_value("TUBEGRAB_YTDLP", file_vars, &env_lookup).map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_YTDLP));
    let scratch_root = overrides
        .scratch_root
        .or_else(|| {
            lookup_value("TUBEGRAB_SCRATCH_DIR", file_vars, &env_lookup).map(PathBuf::from)
        })
        .unwrap_or_else(env::temp_dir);
    let download_dir = overrides
        .download_dir
        .or_else(|| {
            lookup_value("TUBEGRAB_DOWNLOAD_DIR", file_vars, &env_lookup).map(PathBuf::from)
        })
        .unwrap_or_else(default_download_dir);
    let timeout_secs = overrides
        .network_timeout_secs
        .or_else(|| parse_number("TUBEGRAB_TIMEOUT_SECS", file_vars, &env_lookup))
        .filter(|secs| *secs > 0)
        .unwrap_or(DEFAULT_TIMEOUT_SECS);
    let ttl_secs = parse_number("TUBEGRAB_ARTIFACT_TTL_SECS", file_vars, &env_lookup)
        .filter(|secs: &u64| *secs > 0)
        .unwrap_or(DEFAULT_ARTIFACT_TTL_SECS);

    Settings {
        host,
        port,
        ytdlp_program,
        scratch_root,
        download_dir,
        network_timeout: Duration::from_secs(timeout_secs),
        artifact_ttl: Duration::from_secs(ttl_secs),
    }
}

/// The user's standard downloads folder, falling back to the working
/// directory on systems without one.
pub fn default_download_dir() -> PathBuf {
    dirs::download_dir().unwrap_or_else(|| PathBuf::from("."))
}

fn parse_number<T: std::str::FromStr>(
    key: &str,
    file_vars: &HashMap<String, String>,
    env_lookup: &impl Fn(&str) -> Option<String>,
) -> Option<T> {
    lookup_value(key, file_vars, env_lookup).and_then(|value| value.parse::<T>().ok())
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
    env_lookup(key).or_else(|| {
        file_vars
            .get(key)
            .filter(|value| !value.trim().is_empty())
            .cloned()
    })
}

pub fn read_env_file(path: &Path) -> Result<HashMap<String, String>> {
    let mut vars = HashMap::new();
    if !path.exists() {
        return Ok(vars);
    }
    let content =
        fs::read_to_string(path).with_context(|| format!("Reading {}", path.display()))?;
    for line in content.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        let line = trimmed.strip_prefix("export ").unwrap_or(trimmed);
        let Some((key, value_raw)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        let value = value_raw.trim();
        let value = value
            .strip_prefix('"')
            .and_then(|value| value.strip_suffix('"'))
            .or_else(|| {
                value
                    .strip_prefix('\'')
                    .and_then(|value| value.strip_suffix('\''))
            })
            .unwrap_or(value);
        vars.insert(key.to_string(), value.to_string());
    }
    Ok(vars)
}
