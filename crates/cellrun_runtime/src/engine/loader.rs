use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use wasmtime::{Engine, Module};

use super::abi::{self, ModuleAbi};
use crate::{RuntimeError, RuntimeResult};

/// Compiled, immutable engine module shared by every instance started from it.
pub struct EngineModule {
    pub(crate) engine: Engine,
    pub(crate) module: Module,
    pub(crate) abi: ModuleAbi,
    sha256: [u8; 32],
}

impl EngineModule {
    /// SHA-256 digest of the module bytes this was compiled from.
    pub fn sha256(&self) -> &[u8; 32] {
        &self.sha256
    }

    pub fn abi(&self) -> &ModuleAbi {
        &self.abi
    }
}

/// Loads and compiles engine modules, caching the result for the lifetime of the loader.
///
/// A process normally owns a single loader. All modules it produces share one
/// wasmtime [`Engine`], which is configured for epoch interruption so running
/// instances can be stopped.
pub struct EngineLoader {
    engine: Engine,
    cache: Mutex<HashMap<[u8; 32], Arc<EngineModule>>>,
}

impl EngineLoader {
    pub fn new() -> RuntimeResult<Self> {
        let mut wasmtime_config = wasmtime::Config::new();
        wasmtime_config.epoch_interruption(true);
        wasmtime_config.wasm_backtrace(true);
        let engine = Engine::new(&wasmtime_config)
            .map_err(|e| RuntimeError::EngineLoad(format!("failed to create engine: {e:#}")))?;
        Ok(Self {
            engine,
            cache: Mutex::new(HashMap::new()),
        })
    }

    /// Compile `wasm`, or return the module compiled earlier from identical bytes.
    ///
    /// Concurrent calls for the same bytes compile once; the cache lock is held
    /// across compilation.
    pub async fn load(&self, wasm: &[u8]) -> RuntimeResult<Arc<EngineModule>> {
        let sha256: [u8; 32] = Sha256::digest(wasm).into();
        let mut cache = self.cache.lock().await;
        if let Some(module) = cache.get(&sha256) {
            return Ok(Arc::clone(module));
        }

        let abi = abi::inspect(wasm).map_err(|e| RuntimeError::EngineLoad(format!("{e:#}")))?;
        let engine = self.engine.clone();
        let bytes = wasm.to_vec();
        let module = tokio::task::spawn_blocking(move || Module::new(&engine, &bytes))
            .await
            .map_err(|e| RuntimeError::EngineLoad(format!("compilation task failed: {e}")))?
            .map_err(|e| RuntimeError::EngineLoad(format!("{e:#}")))?;

        tracing::debug!(
            "Compiled engine module ({} bytes, sha256 {})",
            wasm.len(),
            hex(&sha256[..8])
        );
        let module = Arc::new(EngineModule {
            engine: self.engine.clone(),
            module,
            abi,
            sha256,
        });
        cache.insert(sha256, Arc::clone(&module));
        Ok(module)
    }

    /// Read an engine module from disk and load it.
    pub async fn load_file(&self, path: &Path) -> RuntimeResult<Arc<EngineModule>> {
        let wasm = tokio::fs::read(path).await.map_err(|e| {
            RuntimeError::EngineLoad(format!("failed to read {}: {e}", path.display()))
        })?;
        self.load(&wasm).await
    }

    /// Number of distinct modules compiled so far.
    pub async fn cached_modules(&self) -> usize {
        self.cache.lock().await.len()
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
