use anyhow::{anyhow, bail, Context as _, Result};
use wasi_common::pipe::WritePipe;
use wasi_common::sync;
use wasmtime::{Caller, Linker};

use super::abi::HOST_MODULE;
use super::config::{LinkerConfig, WasiConfig};
use super::store::{CaptureBuffer, InstanceState};

pub(crate) fn link_imports(config: &LinkerConfig, linker: &mut Linker<InstanceState>) -> Result<()> {
    if config.wasip1 {
        wasi_common::sync::add_to_linker(linker, |cx: &mut InstanceState| &mut cx.wasi)?;
    }
    link_host_imports(linker)?;
    Ok(())
}

pub(crate) fn wasi_ctx(
    wasi_config: &WasiConfig,
    stdout: CaptureBuffer,
    stderr: CaptureBuffer,
) -> Result<wasi_common::WasiCtx> {
    let mut builder = sync::WasiCtxBuilder::new();
    builder.arg("engine")?;
    for arg in wasi_config.args.iter() {
        builder.arg(arg)?;
    }
    for (key, value) in wasi_config.env.iter() {
        builder.env(key, value)?;
    }
    builder.stdout(Box::new(WritePipe::from_shared(stdout)));
    builder.stderr(Box::new(WritePipe::from_shared(stderr)));

    if let Some(preopen) = &wasi_config.preopened_dir {
        let file = std::fs::File::open(preopen)
            .with_context(|| format!("failed to open preopened dir {}", preopen.display()))?;
        let dir = cap_std::fs::Dir::from_std_file(file);
        builder.preopened_dir(dir, "/")?;
    }

    Ok(builder.build())
}

fn link_host_imports(linker: &mut Linker<InstanceState>) -> Result<()> {
    linker.func_wrap(
        HOST_MODULE,
        "ready",
        |mut caller: Caller<'_, InstanceState>, version: i32| -> Result<()> {
            let state = caller.data_mut();
            if let Some(previous) = state.ready {
                bail!("engine signalled readiness twice (versions {previous} and {version})");
            }
            state.ready = Some(version);
            Ok(())
        },
    )?;
    linker.func_wrap(
        HOST_MODULE,
        "write_stdout",
        |mut caller: Caller<'_, InstanceState>, ptr: i32, len: i32| -> Result<()> {
            let bytes = read_guest_bytes(&mut caller, ptr, len)?;
            append(&caller.data().stdout, &bytes)
        },
    )?;
    linker.func_wrap(
        HOST_MODULE,
        "write_stderr",
        |mut caller: Caller<'_, InstanceState>, ptr: i32, len: i32| -> Result<()> {
            let bytes = read_guest_bytes(&mut caller, ptr, len)?;
            append(&caller.data().stderr, &bytes)
        },
    )?;
    Ok(())
}

fn read_guest_bytes(caller: &mut Caller<'_, InstanceState>, ptr: i32, len: i32) -> Result<Vec<u8>> {
    let memory = caller
        .get_export("memory")
        .and_then(|export| export.into_memory())
        .context("guest does not export `memory`")?;
    let start = ptr as u32 as usize;
    let end = start
        .checked_add(len as u32 as usize)
        .context("guest buffer length overflows")?;
    memory
        .data(&*caller)
        .get(start..end)
        .map(<[u8]>::to_vec)
        .with_context(|| format!("guest buffer {start}..{end} is out of bounds"))
}

fn append(buffer: &CaptureBuffer, bytes: &[u8]) -> Result<()> {
    buffer
        .write()
        .map_err(|_| anyhow!("capture buffer poisoned"))?
        .extend_from_slice(bytes);
    Ok(())
}
