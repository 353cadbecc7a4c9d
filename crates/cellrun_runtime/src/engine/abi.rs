use anyhow::{bail, Result};
use wasmparser::{ExternalKind, Parser, Payload};

/// Version the guest must report through `cellrun.ready`.
pub const ABI_VERSION: i32 = 1;

/// Host import module name.
pub(crate) const HOST_MODULE: &str = "cellrun";

pub(crate) const MEMORY_EXPORT: &str = "memory";
pub(crate) const ALLOC_EXPORT: &str = "cellrun_alloc";
pub(crate) const RUN_EXPORT: &str = "cellrun_run";

/// Exports an engine module provides, as found in its export section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleAbi {
    /// Export invoked once to initialize the guest (`_initialize`, falling back to `_start`).
    pub init_export: Option<&'static str>,
}

/// Precondition: data is a binary of the Wasm module.
pub(crate) fn inspect(data: &[u8]) -> Result<ModuleAbi> {
    let mut has_memory = false;
    let mut has_alloc = false;
    let mut has_run = false;
    let mut has_initialize = false;
    let mut has_start = false;

    for payload in Parser::new(0).parse_all(data) {
        match payload? {
            Payload::ExportSection(section) => {
                for export in section {
                    let export = export?;
                    match (export.name, export.kind) {
                        (MEMORY_EXPORT, ExternalKind::Memory) => has_memory = true,
                        (ALLOC_EXPORT, ExternalKind::Func) => has_alloc = true,
                        (RUN_EXPORT, ExternalKind::Func) => has_run = true,
                        ("_initialize", ExternalKind::Func) => has_initialize = true,
                        ("_start", ExternalKind::Func) => has_start = true,
                        _ => {}
                    }
                }
            }
            Payload::End(_) => break,
            _ => {}
        }
    }

    let missing: Vec<&str> = [
        (MEMORY_EXPORT, has_memory),
        (ALLOC_EXPORT, has_alloc),
        (RUN_EXPORT, has_run),
    ]
    .into_iter()
    .filter_map(|(name, found)| (!found).then_some(name))
    .collect();
    if !missing.is_empty() {
        bail!("module is missing required exports: {}", missing.join(", "));
    }

    let init_export = if has_initialize {
        Some("_initialize")
    } else if has_start {
        Some("_start")
    } else {
        None
    };
    tracing::debug!("engine module init export: {:?}", init_export);
    Ok(ModuleAbi { init_export })
}
