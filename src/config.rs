use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub sandbox: SandboxSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Root directory for static frontend files
    #[serde(default = "default_public_path")]
    pub base_path: PathBuf,
    /// File served for `/`
    #[serde(default = "default_file")]
    pub default_file: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            base_path: default_public_path(),
            default_file: default_file(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SandboxSettings {
    /// Confinement root for script file access; no script-visible path
    /// escapes it
    #[serde(default = "default_game_path")]
    pub base_path: PathBuf,
    /// Script run at boot, relative to `base_path`
    #[serde(default)]
    pub entry: Option<String>,
    /// Abort a script after this many engine operations; 0 disables the limit
    #[serde(default = "default_max_operations")]
    pub max_operations: u64,
    #[serde(default)]
    pub components: Vec<ComponentDescriptor>,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            base_path: default_game_path(),
            entry: None,
            max_operations: default_max_operations(),
            components: Vec::new(),
        }
    }
}

/// One component to instantiate into the sandbox namespace.
///
/// `name` is the dotted mount path (e.g. `System.FileSystem`), `loader` the
/// registry factory id, `config` an opaque settings blob handed to the
/// factory as-is.
#[derive(Debug, Deserialize, Clone)]
pub struct ComponentDescriptor {
    pub name: String,
    pub loader: String,
    #[serde(default)]
    pub config: serde_json::Value,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_public_path() -> PathBuf {
    PathBuf::from("./public")
}

fn default_file() -> String {
    "index.html".to_string()
}

fn default_game_path() -> PathBuf {
    PathBuf::from("./game")
}

fn default_max_operations() -> u64 {
    1_000_000
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        // Expand environment variables like ${GAME_ROOT}
        let expanded = shellexpand::env(&content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}
