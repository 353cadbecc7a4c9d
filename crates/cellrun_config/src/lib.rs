use std::path::{Path, PathBuf};
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

pub type Result<T> = std::result::Result<T, String>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CellrunConfig {
    /// Name of the evaluation engine (used in logs).
    pub name: String,
    /// Engine backend configuration.
    pub engine: EngineConfig,
    /// Notebook-level behavior (optional).
    #[serde(default)]
    pub notebook: NotebookConfig,

    /// Directory where the config file is located.
    /// This is used as a base directory when the engine module is specified as a relative path.
    #[serde(skip)]
    config_dir: PathBuf,
}

impl CellrunConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let mut config: CellrunConfig = serde_yaml::from_reader(
            std::fs::File::open(path).map_err(|e| format!("Failed to open file: {}", e))?,
        )
        .map_err(|e| format!("Failed to parse YAML: {}", e))?;

        let path = path
            .canonicalize()
            .map_err(|e| format!("Failed to canonicalize path: {}", e))?;
        config.config_dir = path
            .parent()
            .ok_or_else(|| format!("Failed to get parent directory of path: {}", path.display()))?
            .to_path_buf();
        config.validate()?;

        Ok(config)
    }

    pub fn get_engine_location(&self) -> EngineLocation {
        if let Some(path) = &self.engine.path {
            if path.is_relative() {
                return EngineLocation::Wasm(self.config_dir.join(path));
            } else {
                return EngineLocation::Wasm(path.clone());
            }
        }

        if let Some(command) = &self.engine.command {
            return EngineLocation::Command(command.clone());
        }

        unreachable!();
    }

    /// Preopened directory resolved against the config directory.
    pub fn get_preopened_dir(&self) -> Option<PathBuf> {
        self.engine.preopened_dir.as_ref().map(|dir| {
            if dir.is_relative() {
                self.config_dir.join(dir)
            } else {
                dir.clone()
            }
        })
    }

    fn validate(&self) -> Result<()> {
        if !self.config_dir.is_dir() {
            return Err(format!(
                "Broken config path: config_dir is not a directory: {}",
                self.config_dir.display()
            ));
        }

        if self.name.is_empty() {
            return Err("Name is required in the name field".to_string());
        }

        if self.engine.path.is_some() && self.engine.command.is_some() {
            return Err("Only one of engine.path or engine.command can be specified".to_string());
        }

        if self.engine.path.is_none() && self.engine.command.is_none() {
            return Err("One of engine.path or engine.command must be specified".to_string());
        }

        if let Some(command) = &self.engine.command {
            if command.program.is_empty() {
                return Err("engine.command.program must not be empty".to_string());
            }
        }

        if self.engine.handshake_timeout_ms == Some(0) {
            return Err("engine.handshake_timeout_ms must be greater than zero".to_string());
        }

        if self.notebook.languages.is_empty() {
            return Err("At least one language is required in notebook.languages".to_string());
        }

        if self.notebook.languages.iter().any(|l| l.is_empty()) {
            return Err("Language names must not be empty".to_string());
        }

        Ok(())
    }
}

pub enum EngineLocation {
    /// In-process WebAssembly engine module.
    Wasm(PathBuf),
    /// External program spawned once per cell.
    Command(CommandConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// Path to the engine's Wasm module.
    /// If relative path is specified, it is relative to the directory where the config file is located.
    /// condition: Only one of path or command must be specified
    path: Option<PathBuf>,
    /// External program used instead of an in-process module.
    /// condition: Only one of path or command must be specified
    pub command: Option<CommandConfig>,
    /// Arguments passed to the Wasm module (WASI argv after the program name).
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables visible to the Wasm module.
    #[serde(default)]
    pub env: IndexMap<String, String>,
    /// Preopened directory for the Wasm module, mounted at `/`.
    pub preopened_dir: Option<PathBuf>,
    /// Link WASI preview1 imports.
    ///
    /// Default: true.
    #[serde(default = "EngineConfig::default_wasip1")]
    pub wasip1: bool,
    /// How long to wait for the engine's readiness handshake.
    ///
    /// Default: wait indefinitely.
    #[serde(default)]
    pub handshake_timeout_ms: Option<u64>,
}

impl EngineConfig {
    fn default_wasip1() -> bool {
        true
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_ms.map(Duration::from_millis)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommandConfig {
    /// Program to spawn. Looked up on `PATH` when not absolute.
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NotebookConfig {
    /// Languages of code cells the engine evaluates. Other cells are skipped.
    ///
    /// Default: ["ivy"].
    #[serde(default = "NotebookConfig::default_languages")]
    pub languages: Vec<String>,
}

impl NotebookConfig {
    fn default_languages() -> Vec<String> {
        vec!["ivy".to_string()]
    }
}

impl Default for NotebookConfig {
    fn default() -> Self {
        Self {
            languages: Self::default_languages(),
        }
    }
}
