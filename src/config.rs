use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Global configuration for the gateway
///
/// The file may be TOML or JSON; `.json` files keep the layout
/// `{"mcp": {"servers": {...}}}` used by existing gateway deployments.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// HTTP server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Tool server definitions
    #[serde(default)]
    pub mcp: McpConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 8808, overridden by the PORT environment variable)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// How long a correlated backend call may wait for its response.
    ///
    /// Defaults to the fixed 5000 ms correlation window. The window is the same for
    /// every call and backend; this setting only exists to shorten it in tests or
    /// lengthen it for slow deployments.
    #[serde(default = "default_call_timeout")]
    pub call_timeout_ms: u64,
}

impl ServerConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            call_timeout_ms: default_call_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct McpConfig {
    /// Backends keyed by name
    #[serde(default)]
    pub servers: HashMap<String, BackendConfig>,
}

/// Configuration for a single backend tool server
///
/// # Security Warning
///
/// `command` and `args` allow arbitrary command execution. Configuration files
/// must be protected with appropriate file permissions.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct BackendConfig {
    /// Executable name or path, resolved through PATH when not absolute
    pub command: String,

    /// Argument strings; each one is split with shell word rules before spawning
    #[serde(default)]
    pub args: Vec<String>,

    /// Environment variables layered over the base environment
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl BackendConfig {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            args: Vec::new(),
            env: HashMap::new(),
        }
    }

    /// Set arguments for this backend config (builder pattern)
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Set environment variables (builder pattern)
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    /// Split the configured argument strings into process arguments.
    ///
    /// An argument that fails to parse (unbalanced quotes) is passed through as-is.
    pub fn split_args(&self) -> Vec<String> {
        self.args
            .iter()
            .flat_map(|arg| shell_words::split(arg).unwrap_or_else(|_| vec![arg.clone()]))
            .collect()
    }

    /// Validate the backend configuration
    pub fn validate(&self, name: &str) -> Result<(), String> {
        if self.command.trim().is_empty() {
            return Err(format!("Server '{}': 'command' must not be empty", name));
        }

        if let Some(key) = self.env.keys().find(|k| k.is_empty() || k.contains('=')) {
            return Err(format!(
                "Server '{}': invalid environment variable name '{}'",
                name, key
            ));
        }

        Ok(())
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    8808
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_call_timeout() -> u64 {
    5000
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let is_json = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let config = if is_json {
            Self::from_json(&content)?
        } else {
            Self::from_toml(&content)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_json(content: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(content)?)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        for (name, backend) in &self.mcp.servers {
            if let Err(e) = backend.validate(name) {
                errors.push(e);
            }
        }

        if self.server.call_timeout_ms == 0 {
            errors.push("'call_timeout_ms' must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            errors.sort();
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }

    /// Apply a PORT override (from the environment)
    pub fn apply_port_override(&mut self, port: Option<&str>) -> anyhow::Result<()> {
        if let Some(port) = port {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("Invalid PORT '{}': {}", port, e))?;
        }
        Ok(())
    }

    pub fn backend(&self, name: &str) -> Option<&BackendConfig> {
        self.mcp.servers.get(name)
    }

    /// Configured backend names, sorted for stable output
    pub fn backend_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.mcp.servers.keys().cloned().collect();
        names.sort();
        names
    }
}

/// Where request handlers get the backend configuration from
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// Re-read on every use so edits apply to new sessions without a restart
    File(PathBuf),
    Fixed(Arc<Config>),
}

impl ConfigSource {
    pub fn load(&self) -> anyhow::Result<Arc<Config>> {
        match self {
            ConfigSource::File(path) => Ok(Arc::new(Config::load(path)?)),
            ConfigSource::Fixed(config) => Ok(Arc::clone(config)),
        }
    }
}
