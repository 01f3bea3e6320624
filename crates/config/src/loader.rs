use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{
    env_subst::substitute_env,
    error::{Error, Result},
    schema::MoltisConfig,
};

/// Standard config file names, checked in order.
const CONFIG_FILENAMES: &[&str] = &["moltis.toml", "moltis.yaml", "moltis.yml", "moltis.json"];

/// Load config from the given path (any supported format).
pub fn load_config(path: &Path) -> Result<MoltisConfig> {
    let raw = std::fs::read_to_string(path).map_err(|source| Error::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&substitute_env(&raw), path)
}

/// Discover and load config from standard locations.
///
/// Search order:
/// 1. `./moltis.{toml,yaml,yml,json}` (project-local)
/// 2. `~/.config/moltis/moltis.{toml,yaml,yml,json}` (user-global)
///
/// Returns the default config and no path when nothing is found; a file
/// that exists but fails to parse is an error.
pub fn discover_and_load() -> Result<(MoltisConfig, Option<PathBuf>)> {
    match find_config_file() {
        Some(path) => {
            debug!(path = %path.display(), "loading config");
            let config = load_config(&path)?;
            Ok((config, Some(path)))
        },
        None => {
            debug!("no config file found, using defaults");
            Ok((MoltisConfig::default(), None))
        },
    }
}

/// Find the first config file in standard locations.
pub fn find_config_file() -> Option<PathBuf> {
    let local = CONFIG_FILENAMES.iter().map(PathBuf::from);
    let global = config_dir()
        .into_iter()
        .flat_map(|dir| CONFIG_FILENAMES.iter().map(move |name| dir.join(name)));
    local.chain(global).find(|p| p.exists())
}

/// Returns the user-global config directory (`~/.config/moltis/`).
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", "moltis").map(|d| d.config_dir().to_path_buf())
}

/// Parse config text, picking the format from the file extension.
pub fn parse_config(raw: &str, path: &Path) -> Result<MoltisConfig> {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("toml");

    match ext {
        "toml" => Ok(toml::from_str(raw)?),
        "yaml" | "yml" => Ok(serde_yaml::from_str(raw)?),
        "json" => Ok(serde_json::from_str(raw)?),
        other => Err(Error::UnsupportedFormat(other.to_string())),
    }
}
