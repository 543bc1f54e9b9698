//! Runtime configuration for the Anvil engine.
//!
//! Settings come from three layers, later layers winning:
//! 1. built-in defaults,
//! 2. an optional `anvil.toml` file,
//! 3. `ANVIL_*` environment variables.
//!
//! CLI flags are applied on top by `main`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_WORKERS: usize = 2;
pub const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 600;
pub const DEFAULT_OUTPUT_CAP_BYTES: usize = 10 * 1024 * 1024;

/// Resolved engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Bind on all interfaces and enable permissive CORS.
    pub dev_mode: bool,
    /// SQLite database holding the repo registry and build history.
    pub db_path: PathBuf,
    /// Root directory under which per-repo workspaces are created.
    pub workspaces_root: PathBuf,
    /// Upper bound on builds executing concurrently across all repos.
    pub max_concurrent_builds: usize,
    /// Wall-clock limit for a single install or build command.
    pub command_timeout_secs: u64,
    /// Cap on captured command output per build step.
    pub output_cap_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            dev_mode: false,
            db_path: PathBuf::from(".anvil/anvil.db"),
            workspaces_root: PathBuf::from(".anvil/workspaces"),
            max_concurrent_builds: DEFAULT_WORKERS,
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT_SECS,
            output_cap_bytes: DEFAULT_OUTPUT_CAP_BYTES,
        }
    }
}

/// On-disk shape of `anvil.toml`. Every field optional so partial files work.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    port: Option<u16>,
    dev_mode: Option<bool>,
    db_path: Option<PathBuf>,
    workspaces_root: Option<PathBuf>,
    max_concurrent_builds: Option<usize>,
    command_timeout_secs: Option<u64>,
    output_cap_bytes: Option<usize>,
}

impl EngineConfig {
    /// Load configuration: defaults, then `anvil.toml` (if present), then
    /// `ANVIL_*` environment variables.
    pub fn load(config_file: Option<&Path>) -> Result<Self> {
        let mut config = Self::default();

        let path = config_file
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("anvil.toml"));
        if path.exists() {
            let raw = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read config file {}", path.display()))?;
            let file: ConfigFile = toml::from_str(&raw)
                .with_context(|| format!("Failed to parse config file {}", path.display()))?;
            config.apply_file(file);
        } else if config_file.is_some() {
            anyhow::bail!("Config file {} does not exist", path.display());
        }

        config.apply_env(std::env::vars());
        Ok(config)
    }

    fn apply_file(&mut self, file: ConfigFile) {
        if let Some(port) = file.port {
            self.port = port;
        }
        if let Some(dev_mode) = file.dev_mode {
            self.dev_mode = dev_mode;
        }
        if let Some(db_path) = file.db_path {
            self.db_path = db_path;
        }
        if let Some(workspaces_root) = file.workspaces_root {
            self.workspaces_root = workspaces_root;
        }
        if let Some(workers) = file.max_concurrent_builds {
            self.max_concurrent_builds = workers.max(1);
        }
        if let Some(timeout) = file.command_timeout_secs {
            self.command_timeout_secs = timeout;
        }
        if let Some(cap) = file.output_cap_bytes {
            self.output_cap_bytes = cap;
        }
    }

    /// Apply `ANVIL_*` overrides from an environment snapshot. Unparsable
    /// values are ignored with a warning rather than aborting startup.
    pub fn apply_env(&mut self, vars: impl Iterator<Item = (String, String)>) {
        for (key, value) in vars {
            match key.as_str() {
                "ANVIL_PORT" => match value.parse() {
                    Ok(port) => self.port = port,
                    Err(_) => tracing::warn!("Ignoring unparsable ANVIL_PORT={}", value),
                },
                "ANVIL_DB_PATH" => self.db_path = PathBuf::from(value),
                "ANVIL_WORKSPACES_ROOT" => self.workspaces_root = PathBuf::from(value),
                "ANVIL_MAX_CONCURRENT_BUILDS" => match value.parse::<usize>() {
                    Ok(workers) => self.max_concurrent_builds = workers.max(1),
                    Err(_) => {
                        tracing::warn!("Ignoring unparsable ANVIL_MAX_CONCURRENT_BUILDS={}", value)
                    }
                },
                "ANVIL_COMMAND_TIMEOUT_SECS" => match value.parse() {
                    Ok(timeout) => self.command_timeout_secs = timeout,
                    Err(_) => {
                        tracing::warn!("Ignoring unparsable ANVIL_COMMAND_TIMEOUT_SECS={}", value)
                    }
                },
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(!config.dev_mode);
        assert_eq!(config.max_concurrent_builds, 2);
        assert_eq!(config.output_cap_bytes, 10 * 1024 * 1024);
    }

    #[test]
    fn toml_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anvil.toml");
        std::fs::write(
            &path,
            "port = 9000\nmax_concurrent_builds = 4\nworkspaces_root = \"/var/lib/anvil\"\n",
        )
        .unwrap();

        let config = EngineConfig::load(Some(&path)).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.max_concurrent_builds, 4);
        assert_eq!(config.workspaces_root, PathBuf::from("/var/lib/anvil"));
        // Untouched fields keep their defaults.
        assert_eq!(config.command_timeout_secs, DEFAULT_COMMAND_TIMEOUT_SECS);
    }

    #[test]
    fn missing_explicit_config_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        assert!(EngineConfig::load(Some(&path)).is_err());
    }

    #[test]
    fn env_overrides_apply_on_top() {
        let mut config = EngineConfig::default();
        let vars = vec![
            ("ANVIL_PORT".to_string(), "8123".to_string()),
            ("ANVIL_MAX_CONCURRENT_BUILDS".to_string(), "8".to_string()),
            ("UNRELATED".to_string(), "ignored".to_string()),
        ];
        config.apply_env(vars.into_iter());
        assert_eq!(config.port, 8123);
        assert_eq!(config.max_concurrent_builds, 8);
    }

    #[test]
    fn unparsable_env_values_are_ignored() {
        let mut config = EngineConfig::default();
        config.apply_env(vec![("ANVIL_PORT".to_string(), "not-a-port".to_string())].into_iter());
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn zero_workers_is_clamped_to_one() {
        let mut config = EngineConfig::default();
        config.apply_env(
            vec![("ANVIL_MAX_CONCURRENT_BUILDS".to_string(), "0".to_string())].into_iter(),
        );
        assert_eq!(config.max_concurrent_builds, 1);
    }
}
