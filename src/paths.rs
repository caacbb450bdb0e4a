//! Path resolution for stackform
//!
//! # Environment Variables
//!
//! - `STACKFORM_CONFIG_DIR` - Override config directory
//! - `STACKFORM_STATE_DIR` - Override state directory (state database and
//!   local provider resources)
//!
//! # Path Resolution Priority
//!
//! For config_dir():
//! 1. `STACKFORM_CONFIG_DIR` environment variable
//! 2. `XDG_CONFIG_HOME/stackform` (if set)
//! 3. Platform default:
//!    - Windows: `%APPDATA%\stackform`
//!    - macOS/Linux: `~/.config/stackform`
//!
//! For state_dir():
//! 1. `STACKFORM_STATE_DIR` environment variable
//! 2. `XDG_STATE_HOME/stackform` (if set)
//! 3. Platform default:
//!    - Windows: `%LOCALAPPDATA%\stackform`
//!    - macOS/Linux: `~/.local/state/stackform`

use anyhow::{Context, Result};
use std::path::PathBuf;

/// Environment variable for config directory override
pub const ENV_CONFIG_DIR: &str = "STACKFORM_CONFIG_DIR";

/// Environment variable for state directory override
pub const ENV_STATE_DIR: &str = "STACKFORM_STATE_DIR";

const APP_DIR: &str = "stackform";

/// Name of the project-local config file
pub const CONFIG_FILE: &str = "stackform.toml";

/// Get the stackform config directory path
pub fn config_dir() -> Result<PathBuf> {
    resolve_dir(
        ENV_CONFIG_DIR,
        "XDG_CONFIG_HOME",
        cfg!(windows).then(dirs::config_dir).flatten(),
        &[".config"],
    )
}

/// Get the stackform state directory path
pub fn state_dir() -> Result<PathBuf> {
    resolve_dir(
        ENV_STATE_DIR,
        "XDG_STATE_HOME",
        cfg!(windows).then(dirs::data_local_dir).flatten(),
        &[".local", "state"],
    )
}

/// Override variable, then the XDG base, then the platform dir, then `~/<home_rel>`
fn resolve_dir(
    override_var: &str,
    xdg_var: &str,
    platform: Option<PathBuf>,
    home_rel: &[&str],
) -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(override_var) {
        let path = expand(&dir);
        log::debug!("{override_var} -> {}", path.display());
        return Ok(path);
    }
    if let Some(base) = std::env::var_os(xdg_var).filter(|v| !v.is_empty()) {
        return Ok(PathBuf::from(base).join(APP_DIR));
    }
    if let Some(base) = platform {
        return Ok(base.join(APP_DIR));
    }
    let mut path = dirs::home_dir().context("Could not determine home directory")?;
    path.extend(home_rel);
    Ok(path.join(APP_DIR))
}

/// Config files to try when no `--config` is given, in order
pub fn config_candidates() -> Vec<PathBuf> {
    let mut candidates = vec![PathBuf::from(CONFIG_FILE)];
    match config_dir() {
        Ok(dir) => candidates.push(dir.join("config.toml")),
        Err(e) => log::debug!("No user config dir: {e}"),
    }
    candidates
}

/// Expand ~ and environment variables in a path string
///
/// Unknown variables are left as written.
pub fn expand(path: &str) -> PathBuf {
    let expanded = shellexpand::full(path).unwrap_or(std::borrow::Cow::Borrowed(path));
    PathBuf::from(expanded.as_ref())
}
