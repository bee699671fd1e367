//! Relay configuration: TOML file + CLI overrides.
//!
//! The file is optional. CLI flags override it section by section: passing
//! any target flag replaces the whole `[target]` selection from the file,
//! and likewise for the allowlist flags and `[access]`.

use crate::gateway::forwarder::DEFAULT_CHUNK_SIZE;
use portfwd_core::{
    listener_specs, load_targets, AccessPolicy, FwdError, FwdResult, ListenerSpec, TargetSpec,
};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Largest relay chunk accepted. Each session allocates two of these.
pub const MAX_BUFFER_SIZE: usize = 16 * 1024 * 1024;

/// Top-level config file structure.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub listen: ListenSection,
    #[serde(default)]
    pub target: TargetSection,
    #[serde(default)]
    pub access: AccessSection,
    #[serde(default)]
    pub relay: RelaySection,
}

/// `[listen]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct ListenSection {
    #[serde(default = "default_listen_host")]
    pub host: String,
    #[serde(default)]
    pub ports: Option<String>,
}

impl Default for ListenSection {
    fn default() -> Self {
        Self {
            host: default_listen_host(),
            ports: None,
        }
    }
}

/// `[target]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct TargetSection {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub file: Option<String>,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl: u64,
}

impl Default for TargetSection {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            file: None,
            cache_ttl: default_cache_ttl(),
        }
    }
}

/// `[access]` section of the config TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AccessSection {
    #[serde(default)]
    pub allow_any: bool,
    #[serde(default)]
    pub allow: Vec<String>,
}

/// `[relay]` section of the config TOML.
#[derive(Debug, Clone, Deserialize)]
pub struct RelaySection {
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

fn default_listen_host() -> String {
    "0.0.0.0".to_string()
}
fn default_cache_ttl() -> u64 {
    600
}
fn default_buffer_size() -> usize {
    DEFAULT_CHUNK_SIZE
}
fn default_connect_timeout() -> u64 {
    10
}

/// Values taken from the command line. `None` / empty means "not given".
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub source_host: Option<String>,
    pub source_ports: Option<String>,
    pub target_host: Option<String>,
    pub target_port: Option<u16>,
    pub target_file: Option<String>,
    pub cache_ttl: Option<u64>,
    pub allow: Vec<String>,
    pub allow_any: bool,
    pub buffer_size: Option<usize>,
    pub connect_timeout: Option<u64>,
}

impl CliOverrides {
    fn has_target(&self) -> bool {
        self.target_host.is_some() || self.target_port.is_some() || self.target_file.is_some()
    }

    fn has_access(&self) -> bool {
        self.allow_any || !self.allow.is_empty()
    }
}

/// How the upstream for a session is chosen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetMode {
    /// Every session goes to the same target.
    Static(TargetSpec),
    /// Sessions draw from the candidates listed in a file.
    File(PathBuf),
}

/// Resolved relay configuration (validated, CLI overrides applied).
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub listeners: Vec<ListenerSpec>,
    pub target: TargetMode,
    pub cache_ttl: Duration,
    pub access: AccessPolicy,
    pub buffer_size: usize,
    pub connect_timeout: Duration,
}

impl RelayConfig {
    /// Load config from a TOML file (if present), then apply CLI overrides.
    pub fn load(config_path: Option<&Path>, cli: &CliOverrides) -> FwdResult<Self> {
        let file_config = match config_path {
            Some(path) => {
                let expanded = expand_tilde(path);
                if expanded.exists() {
                    info!(path = %expanded.display(), "loading config file");
                    let content = std::fs::read_to_string(&expanded).map_err(|e| {
                        FwdError::Config(format!(
                            "cannot read config file {}: {e}",
                            expanded.display()
                        ))
                    })?;
                    toml::from_str::<ConfigFile>(&content)
                        .map_err(|e| FwdError::Config(format!("config parse error: {e}")))?
                } else {
                    info!(path = %expanded.display(), "config file not found, using defaults");
                    ConfigFile::default()
                }
            }
            None => ConfigFile::default(),
        };

        Self::resolve(file_config, cli)
    }

    /// Merge and validate without touching the config file.
    pub fn resolve(file: ConfigFile, cli: &CliOverrides) -> FwdResult<Self> {
        // Listening side
        let host = cli.source_host.clone().unwrap_or(file.listen.host);
        let range = cli
            .source_ports
            .clone()
            .or(file.listen.ports)
            .ok_or_else(|| FwdError::Config("no source port range given".to_string()))?;
        let listeners = listener_specs(&host, &range);
        if listeners.is_empty() {
            return Err(FwdError::Config(format!(
                "port range {range:?} contains no valid ports"
            )));
        }

        // Target mode
        let (target_host, target_port, target_file) = if cli.has_target() {
            (cli.target_host.clone(), cli.target_port, cli.target_file.clone())
        } else {
            (file.target.host, file.target.port, file.target.file)
        };
        let target = match (target_host, target_port, target_file) {
            (Some(host), Some(port), None) => {
                let spec = TargetSpec::new(host, port);
                spec.validate()
                    .map_err(|e| FwdError::Config(format!("invalid static target: {e}")))?;
                TargetMode::Static(spec)
            }
            (None, None, Some(path)) => {
                let path = expand_tilde(Path::new(&path));
                check_target_file(&path)?;
                TargetMode::File(path)
            }
            (None, None, None) => {
                return Err(FwdError::Config(
                    "no target given: set a target host and port, or a target file".to_string(),
                ))
            }
            (_, _, Some(_)) => {
                return Err(FwdError::Config(
                    "target file cannot be combined with a static target".to_string(),
                ))
            }
            _ => {
                return Err(FwdError::Config(
                    "static target needs both a host and a port".to_string(),
                ))
            }
        };

        let cache_ttl = cli.cache_ttl.unwrap_or(file.target.cache_ttl);
        if cache_ttl == 0 {
            return Err(FwdError::Config("cache TTL must be positive".to_string()));
        }

        // Allowlist
        let (allow_any, allow) = if cli.has_access() {
            (cli.allow_any, cli.allow.clone())
        } else {
            (file.access.allow_any, file.access.allow)
        };
        let access = match (allow_any, allow.is_empty()) {
            (true, true) => AccessPolicy::AllowAny,
            (false, false) => AccessPolicy::from_addrs(&allow)?,
            (true, false) => {
                return Err(FwdError::Config(
                    "allow-any cannot be combined with an explicit allowlist".to_string(),
                ))
            }
            (false, true) => {
                return Err(FwdError::Config(
                    "no allowlist given: list permitted addresses or enable allow-any".to_string(),
                ))
            }
        };

        let buffer_size = cli.buffer_size.unwrap_or(file.relay.buffer_size);
        if buffer_size == 0 {
            return Err(FwdError::Config("buffer size must be positive".to_string()));
        }
        if buffer_size > MAX_BUFFER_SIZE {
            return Err(FwdError::Config(format!(
                "buffer size {buffer_size} exceeds the {MAX_BUFFER_SIZE} byte limit"
            )));
        }
        let connect_timeout = cli.connect_timeout.unwrap_or(file.relay.connect_timeout);

        Ok(Self {
            listeners,
            target,
            cache_ttl: Duration::from_secs(cache_ttl),
            access,
            buffer_size,
            connect_timeout: Duration::from_secs(connect_timeout),
        })
    }
}

/// The file must be readable at startup; an empty list only warns.
fn check_target_file(path: &Path) -> FwdResult<()> {
    match load_targets(path) {
        Ok(targets) if targets.is_empty() => {
            warn!(path = %path.display(), "target file has no valid entries");
            Ok(())
        }
        Ok(_) => Ok(()),
        Err(e) => Err(FwdError::Config(e.to_string())),
    }
}

/// Expand `~` to the user's home directory.
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    expand_tilde_str(&s)
}

fn expand_tilde_str(s: &str) -> PathBuf {
    if let Some(rest) = s.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(s)
}
