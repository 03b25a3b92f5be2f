//! Tool-server configuration loading and validation
//!
//! A configuration maps server names to definitions (command, args, env,
//! tool allow/deny lists). Values may reference environment variables with
//! `${VAR}` placeholders (`${VAR:-default}` supplies a fallback); the whole
//! configuration either resolves at load time or the load fails naming the
//! missing variable.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info};

/// Errors raised while loading or validating a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("Environment variable {name} is not set")]
    MissingEnvVar { name: String },

    #[error("Failed to read config from {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write default config to {path}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One tool-server definition after interpolation and validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerDefinition {
    /// Executable to spawn (non-empty)
    pub command: String,

    /// Arguments passed to the command
    pub args: Vec<String>,

    /// Environment for the child process; PATH is inherited from the parent
    /// unless overridden here
    pub env: BTreeMap<String, String>,

    /// Optional allow-list of tool names
    pub enabled_tools: Option<BTreeSet<String>>,

    /// Optional deny-list of tool names; wins over the allow-list
    pub disabled_tools: Option<BTreeSet<String>>,
}

impl ServerDefinition {
    /// Whether a discovered tool is excluded by this definition's lists
    ///
    /// The deny-list always wins; an allow-list, when present, additionally
    /// restricts to its members.
    pub fn is_tool_disabled(&self, tool_name: &str) -> bool {
        if let Some(denied) = &self.disabled_tools {
            if denied.contains(tool_name) {
                return true;
            }
        }
        if let Some(allowed) = &self.enabled_tools {
            return !allowed.contains(tool_name);
        }
        false
    }
}

/// A validated set of tool-server definitions keyed by server name
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    pub servers: BTreeMap<String, ServerDefinition>,
}

/// Raw file shape: `{ "mcpServers": { "<name>": { ... } } }`
///
/// Unknown fields are ignored; a missing `mcpServers` key is a shape error
/// here (only `load_or_default` supplies an empty server set).
#[derive(Debug, Deserialize)]
struct ConfigFile {
    #[serde(rename = "mcpServers")]
    mcp_servers: BTreeMap<String, RawServerDefinition>,
}

#[derive(Debug, Deserialize)]
struct RawServerDefinition {
    command: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(rename = "enabledTools")]
    enabled_tools: Option<BTreeSet<String>>,
    #[serde(rename = "disabledTools")]
    disabled_tools: Option<BTreeSet<String>>,
}

impl Configuration {
    /// Parse and validate a raw JSON configuration
    ///
    /// Interpolation is applied to `command`, every element of `args`, and
    /// every value in `env` before validation; either the whole object
    /// resolves or the call fails.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let file: ConfigFile = serde_json::from_str(raw).map_err(|e| ConfigError::Invalid(e.to_string()))?;

        let mut servers = BTreeMap::new();
        for (name, raw_def) in file.mcp_servers {
            if name.trim().is_empty() {
                return Err(ConfigError::Invalid("server name must not be empty".to_string()));
            }
            let def = resolve_definition(&name, raw_def)?;
            servers.insert(name, def);
        }

        debug!(server_count = servers.len(), "Configuration::parse: validated");
        Ok(Self { servers })
    }

    /// Load a configuration from a file
    ///
    /// Any read failure (including not-found) is wrapped and propagated; use
    /// [`Configuration::load_or_default`] for create-on-missing behavior.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config = Self::parse(&raw)?;
        info!(path = %path.display(), servers = config.servers.len(), "Configuration::load: loaded");
        Ok(config)
    }

    /// Load a configuration, writing an empty one if the file is absent
    ///
    /// Idempotent: a second call in the same session reads the file written
    /// by the first.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(raw) => Self::parse(&raw),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).map_err(|source| ConfigError::Write {
                        path: path.to_path_buf(),
                        source,
                    })?;
                }
                fs::write(path, "{\n  \"mcpServers\": {}\n}\n").map_err(|source| ConfigError::Write {
                    path: path.to_path_buf(),
                    source,
                })?;
                info!(path = %path.display(), "Configuration::load_or_default: wrote empty config");
                Ok(Self::default())
            }
            Err(source) => Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            }),
        }
    }

    /// Default config file location under the per-user config directory
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("toolbridge"))
            .unwrap_or_else(|| PathBuf::from(".toolbridge"))
            .join("mcp.json")
    }
}

fn resolve_definition(name: &str, raw: RawServerDefinition) -> Result<ServerDefinition, ConfigError> {
    let command = interpolate(&raw.command)?;
    if command.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("server {name}: command must not be empty")));
    }

    let args = raw.args.iter().map(|a| interpolate(a)).collect::<Result<Vec<_>, _>>()?;

    let mut env = BTreeMap::new();
    for (key, value) in &raw.env {
        if key.trim().is_empty() {
            return Err(ConfigError::Invalid(format!("server {name}: env keys must not be empty")));
        }
        let value = interpolate(value)?;
        if value.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "server {name}: env value for {key} is empty after interpolation"
            )));
        }
        env.insert(key.clone(), value);
    }

    Ok(ServerDefinition {
        command,
        args,
        env,
        enabled_tools: raw.enabled_tools,
        disabled_tools: raw.disabled_tools,
    })
}

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").unwrap())
}

/// Resolve `${VAR}` and `${VAR:-default}` placeholders against the process
/// environment
fn interpolate(input: &str) -> Result<String, ConfigError> {
    let re = placeholder_regex();
    let mut result = String::with_capacity(input.len());
    let mut last = 0;

    for caps in re.captures_iter(input) {
        let Some(whole) = caps.get(0) else { continue };
        let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();

        result.push_str(&input[last..whole.start()]);
        match std::env::var(name) {
            Ok(value) => result.push_str(&value),
            Err(_) => match caps.get(2) {
                Some(default) => result.push_str(default.as_str()),
                None => {
                    return Err(ConfigError::MissingEnvVar { name: name.to_string() });
                }
            },
        }
        last = whole.end();
    }

    result.push_str(&input[last..]);
    Ok(result)
}
