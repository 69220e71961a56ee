use crate::error::{Result, SocktapError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const CONF_NAME: &str = "socktap.conf";

/// Tracer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Write decoded trace events to stdout as JSON lines
    pub log_events: bool,
    /// Capacity of the event channel between the proxies and the sink drain
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            log_events: true,
            event_buffer: 1024,
        }
    }
}

/// Candidate config locations, most specific first: an explicit path from
/// the command line, a file next to the binary, the user config directory,
/// then the system-wide one. Tiers that cannot be resolved (no parent
/// directory, no $HOME) simply drop out.
pub fn config_search_paths(executable_path: &Path, config_arg: Option<&str>) -> Vec<PathBuf> {
    let candidates = [
        config_arg.map(PathBuf::from),
        executable_path.parent().map(|dir| dir.join(CONF_NAME)),
        user_config_dir().map(|dir| dir.join("socktap").join(CONF_NAME)),
        Some(PathBuf::from("/etc/socktap").join(CONF_NAME)),
    ];
    candidates.into_iter().flatten().collect()
}

/// $XDG_CONFIG_HOME, or ~/.config when unset.
fn user_config_dir() -> Option<PathBuf> {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg));
    }
    let home = std::env::var("HOME").ok()?;
    Some(PathBuf::from(home).join(".config"))
}

/// The first candidate that exists wins; no file at all means defaults.
pub fn load_config(executable_path: &Path, config_arg: Option<&str>) -> Result<Config> {
    for path in config_search_paths(executable_path, config_arg) {
        if !path.exists() {
            continue;
        }
        let text = fs::read_to_string(&path)?;
        return toml::from_str(&text)
            .map_err(|e| SocktapError::ConfigError(format!("{}: {}", path.display(), e)));
    }
    Ok(Config::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert!(config.log_events);
        assert_eq!(config.event_buffer, 1024);
    }

    #[test]
    fn test_parse_partial() {
        let config: Config = toml::from_str("log_events = false\n").unwrap();
        assert!(!config.log_events);
        assert_eq!(config.event_buffer, 1024);
    }

    #[test]
    fn test_search_path_order() {
        let paths = config_search_paths(Path::new("/usr/local/bin/socktap"), Some("custom.conf"));
        assert_eq!(paths[0], PathBuf::from("custom.conf"));
        assert_eq!(paths[1], PathBuf::from("/usr/local/bin/socktap.conf"));
        assert_eq!(paths.last().unwrap(), &PathBuf::from("/etc/socktap/socktap.conf"));
    }

    #[test]
    fn test_search_path_without_arg() {
        let paths = config_search_paths(Path::new("/usr/local/bin/socktap"), None);
        assert_eq!(paths[0], PathBuf::from("/usr/local/bin/socktap.conf"));
    }
}
