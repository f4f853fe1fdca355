//! Settings file discovery and parsing.
//!
//! The file is `ccrelay.jsonc`, `ccrelay.json`, `ccrelay.yaml` or
//! `ccrelay.yml`, looked up in the working directory and then in
//! `~/.config/ccrelay/`. Profile URLs, credentials and models may reference
//! environment variables as `$VAR` or `${VAR}`.

use crate::schema::{CcrelayConfig, ProfileConfig, Strategy};
use anyhow::{anyhow, Context, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

const FILE_NAMES: &[&str] = &["ccrelay.jsonc", "ccrelay.json", "ccrelay.yaml", "ccrelay.yml"];

/// Load `config_path`, or the first settings file found.
pub fn load_config(config_path: Option<&Path>) -> Result<CcrelayConfig> {
    let path = match config_path {
        Some(path) => path.to_path_buf(),
        None => find_config_file().ok_or_else(|| anyhow!("No ccrelay configuration file found"))?,
    };
    load_config_from_file(&path)
}

pub fn load_config_from_file(path: &Path) -> Result<CcrelayConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: CcrelayConfig = match path.extension().and_then(|ext| ext.to_str()) {
        Some("jsonc") => json5::from_str(&content).context("Failed to parse JSONC")?,
        Some("json") => serde_json::from_str(&content).context("Failed to parse JSON")?,
        Some("yaml" | "yml") => serde_yaml_ng::from_str(&content).context("Failed to parse YAML")?,
        _ => return Err(anyhow!("Unsupported config file: {}", path.display())),
    };
    Ok(expand_env_vars(config))
}

pub fn find_config_file() -> Option<PathBuf> {
    let global_dir = dirs::home_dir().map(|home| home.join(".config").join("ccrelay"));
    let global = global_dir
        .into_iter()
        .flat_map(|dir| FILE_NAMES.iter().map(move |name| dir.join(name)));

    FILE_NAMES
        .iter()
        .map(PathBuf::from)
        .chain(global)
        .find(|path| path.is_file())
}

/// Directory holding the proxy lock and session records.
///
/// `CCRELAY_STATE_DIR` wins; otherwise `~/.config/ccrelay`, falling back to
/// the system temp directory when no home directory is known.
pub fn state_dir() -> PathBuf {
    if let Ok(dir) = env::var("CCRELAY_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }

    dirs::home_dir()
        .map(|home| home.join(".config").join("ccrelay"))
        .unwrap_or_else(|| env::temp_dir().join("ccrelay"))
}

/// Apply `CCRELAY_PORT` and `CCRELAY_STRATEGY` on top of the loaded file.
pub fn apply_env_overrides(config: &mut CcrelayConfig) -> Result<()> {
    if let Ok(port) = env::var("CCRELAY_PORT") {
        config.settings.proxy.port = port
            .trim()
            .parse()
            .with_context(|| format!("Invalid CCRELAY_PORT: {}", port))?;
    }

    if let Ok(strategy) = env::var("CCRELAY_STRATEGY") {
        config.settings.strategy = strategy.parse::<Strategy>()?;
    }

    Ok(())
}

fn expand_env_vars(config: CcrelayConfig) -> CcrelayConfig {
    CcrelayConfig {
        profiles: config
            .profiles
            .into_iter()
            .map(expand_profile)
            .collect(),
        settings: config.settings,
    }
}

fn expand_profile(mut profile: ProfileConfig) -> ProfileConfig {
    profile.base_url = expand_env_string(&profile.base_url);
    profile.api_key = expand_env_string(&profile.api_key);
    profile.model = profile.model.map(|m| expand_env_string(&m));
    profile
}

fn expand_env_string(s: &str) -> String {
    let mut result = String::new();
    let mut chars = s.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }

        if chars.peek() == Some(&'{') {
            chars.next();
            let var_name: String = chars.by_ref().take_while(|&c| c != '}').collect();
            match env::var(&var_name) {
                Ok(value) => result.push_str(&value),
                Err(_) => {
                    result.push_str("${");
                    result.push_str(&var_name);
                    result.push('}');
                }
            }
            continue;
        }

        let mut var_name = String::new();
        while let Some(&c) = chars.peek() {
            if c.is_alphanumeric() || c == '_' {
                var_name.push(c);
                chars.next();
            } else {
                break;
            }
        }

        if var_name.is_empty() {
            result.push('$');
        } else if let Ok(value) = env::var(&var_name) {
            result.push_str(&value);
        } else {
            result.push('$');
            result.push_str(&var_name);
        }
    }

    result
}
