//! Station and profile files – TOML on disk, `EOLFORCE_*` overrides on top.

use std::fs;
use std::path::{Path, PathBuf};

use eolforce_types::{Profile, StationConfig};
use serde::de::DeserializeOwned;

/// Read and parse one TOML file.
fn load_toml<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T, String> {
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read {what} at {}: {e}", path.display()))?;
    toml::from_str(&raw).map_err(|e| format!("Failed to parse {what} {}: {e}", path.display()))
}

/// Load the station configuration; defaults when `path` is `None`.
/// Environment overrides are applied in both cases.
pub fn load_station(path: Option<&Path>) -> Result<StationConfig, String> {
    let mut cfg = match path {
        Some(path) => load_toml(path, "station config")?,
        None => StationConfig::default(),
    };
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    Ok(cfg)
}

/// Load a test profile; the reference profile when `path` is `None`.
pub fn load_profile(path: Option<&Path>) -> Result<Profile, String> {
    match path {
        Some(path) => load_toml(path, "profile"),
        None => Ok(Profile::default()),
    }
}

/// Apply `EOLFORCE_*` overrides read through `var`.
///
/// | Variable | Config field |
/// |---|---|
/// | `EOLFORCE_STATION_ID` | `station_id` |
/// | `EOLFORCE_RECORD_DIR` | `record_dir` |
/// | `EOLFORCE_HISTORY_DB` | `history_db` |
pub fn apply_env_overrides(cfg: &mut StationConfig, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("EOLFORCE_STATION_ID") {
        cfg.station_id = v;
    }
    if let Some(v) = var("EOLFORCE_RECORD_DIR") {
        cfg.record_dir = PathBuf::from(v);
    }
    if let Some(v) = var("EOLFORCE_HISTORY_DB") {
        cfg.history_db = (!v.is_empty()).then(|| PathBuf::from(v));
    }
}
