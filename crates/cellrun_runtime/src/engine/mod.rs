//! Wasmtime-based evaluation engine.
//!
//! Split into focused submodules: module loading and caching ([`EngineLoader`]),
//! instance startup ([`InstanceFactory`]), and the serialized call surface of a
//! running instance ([`Instance`]).

mod abi;
mod config;
mod factory;
mod instance;
mod linker;
mod loader;
mod store;
mod termination;

pub use abi::{ModuleAbi, ABI_VERSION};
pub use config::{LinkerConfig, RuntimeConfig, WasiConfig};
pub use factory::InstanceFactory;
pub use instance::{Instance, InstanceId, RunOutput};
pub use loader::{EngineLoader, EngineModule};
pub use termination::{Termination, TerminationSignal};
