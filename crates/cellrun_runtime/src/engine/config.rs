use std::path::PathBuf;

use cellrun_config::CellrunConfig;

#[derive(Debug, Clone, Default)]
pub struct WasiConfig {
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub preopened_dir: Option<PathBuf>,
}

impl WasiConfig {
    pub fn create_from_cellrun_config(config: &CellrunConfig) -> Self {
        Self {
            args: config.engine.args.clone(),
            env: config
                .engine
                .env
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            preopened_dir: config.get_preopened_dir(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkerConfig {
    /// Link WASI preview1 imports. Output written to fd 1/2 is captured per call.
    pub wasip1: bool,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self { wasip1: true }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RuntimeConfig {
    pub wasi_config: WasiConfig,
    pub linker_config: LinkerConfig,
}

impl RuntimeConfig {
    pub fn create_from_cellrun_config(config: &CellrunConfig) -> Self {
        Self {
            wasi_config: WasiConfig::create_from_cellrun_config(config),
            linker_config: LinkerConfig {
                wasip1: config.engine.wasip1,
            },
        }
    }
}
