use std::sync::{Arc, RwLock};

use wasi_common::WasiCtx;

/// Output captured while serving a single call.
pub(crate) type CaptureBuffer = Arc<RwLock<Vec<u8>>>;

/// Host-side data attached to an instance's wasmtime store.
pub(crate) struct InstanceState {
    /// WASI context; only reachable from the guest when WASI preview1 is linked.
    pub(crate) wasi: WasiCtx,
    /// Bytes written to stdout (host import or WASI fd 1) during the current call.
    pub(crate) stdout: CaptureBuffer,
    /// Bytes written to stderr (host import or WASI fd 2) during the current call.
    pub(crate) stderr: CaptureBuffer,
    /// ABI version reported by the guest's `ready` call, if it has made one.
    pub(crate) ready: Option<i32>,
}

impl InstanceState {
    /// Drain both capture buffers.
    pub(crate) fn take_output(&self) -> (Vec<u8>, Vec<u8>) {
        (take(&self.stdout), take(&self.stderr))
    }
}

fn take(buffer: &CaptureBuffer) -> Vec<u8> {
    match buffer.write() {
        Ok(mut guard) => std::mem::take(&mut *guard),
        Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
    }
}
