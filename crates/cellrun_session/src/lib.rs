//! Per-document engine sessions and notebook cell execution.

use std::sync::Arc;

use cellrun_config::{CellrunConfig, EngineLocation};
use cellrun_runtime::engine::{EngineLoader, InstanceFactory, RuntimeConfig};
use cellrun_runtime::RuntimeError;

mod coordinator;
mod error;
pub mod host;
pub mod notebook;
mod process;
mod registry;
pub mod testing;

pub use coordinator::{Backend, ExecutionCoordinator, ExecutionOutcome, ExecutionRecord};
pub use error::{SessionError, SessionResult};
pub use process::{ProcessOutput, ProcessRunner};
pub use registry::{InstanceFuture, SessionOptions, SessionRegistry};

/// Build the coordinator described by `config`.
///
/// A wasm engine is read and compiled here, so a broken module is reported before any
/// document is opened.
pub async fn build_coordinator(config: &CellrunConfig) -> SessionResult<ExecutionCoordinator> {
    let languages = config.notebook.languages.clone();
    let backend = match config.get_engine_location() {
        EngineLocation::Wasm(path) => {
            let wasm = tokio::fs::read(&path).await.map_err(|e| {
                RuntimeError::EngineLoad(format!("failed to read {}: {e}", path.display()))
            })?;
            let loader = Arc::new(EngineLoader::new()?);
            let module = loader.load(&wasm).await?;
            tracing::info!(
                "{}: loaded engine {} ({} bytes)",
                config.name,
                path.display(),
                wasm.len()
            );
            tracing::debug!("{}: engine exports {:?}", config.name, module.abi());

            let factory = InstanceFactory::new(RuntimeConfig::create_from_cellrun_config(config));
            let options = SessionOptions {
                handshake_timeout: config.engine.handshake_timeout(),
            };
            Backend::Sessions(Arc::new(SessionRegistry::new(
                loader, factory, wasm, options,
            )))
        }
        EngineLocation::Command(command) => {
            tracing::info!("{}: evaluating cells with `{}`", config.name, command.program);
            Backend::Process(ProcessRunner::create_from_command_config(&command))
        }
    };
    Ok(ExecutionCoordinator::new(backend, languages))
}
