use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Context as _, Result};
use tokio::sync::{mpsc, oneshot, watch};
use wasmtime::{Engine, Linker, Memory, Store, TypedFunc, UpdateDeadline};

use super::abi::{ABI_VERSION, ALLOC_EXPORT, MEMORY_EXPORT, RUN_EXPORT};
use super::config::RuntimeConfig;
use super::instance::{Instance, InstanceId, RunOutput};
use super::linker::{link_imports, wasi_ctx};
use super::loader::EngineModule;
use super::store::{CaptureBuffer, InstanceState};
use super::termination::{Termination, TerminationSignal};
use crate::{RuntimeError, RuntimeResult};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Requests handled by an instance's runtime thread, in arrival order.
pub(crate) enum Command {
    Run {
        input: String,
        reply: oneshot::Sender<RunOutput>,
    },
    Exit,
}

/// Stops a runtime's guest code at its next epoch check.
#[derive(Clone)]
pub(crate) struct Interrupt {
    requested: Arc<AtomicBool>,
    engine: Engine,
}

impl Interrupt {
    fn new(engine: Engine) -> Self {
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            engine,
        }
    }

    pub(crate) fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        // The epoch is engine-wide; stores without a pending request just renew their deadline.
        self.engine.increment_epoch();
    }

    fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

/// Interrupts a half-started runtime when `start` is abandoned before readiness.
struct StartGuard {
    interrupt: Option<Interrupt>,
}

impl StartGuard {
    fn disarm(&mut self) {
        self.interrupt = None;
    }
}

impl Drop for StartGuard {
    fn drop(&mut self) {
        if let Some(interrupt) = self.interrupt.take() {
            tracing::debug!("instance start abandoned before readiness; interrupting runtime");
            interrupt.trigger();
        }
    }
}

/// Starts engine instances from loaded modules.
#[derive(Clone, Default)]
pub struct InstanceFactory {
    config: Arc<RuntimeConfig>,
}

impl InstanceFactory {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            config: Arc::new(config),
        }
    }

    /// Start a fresh runtime for `module` and wait for its readiness handshake.
    ///
    /// No timeout is applied here; wrap the returned future in one if the engine may
    /// hang during initialization. Dropping the future before it resolves interrupts
    /// the runtime.
    pub async fn start(
        &self,
        module: Arc<EngineModule>,
    ) -> RuntimeResult<(Instance, TerminationSignal)> {
        let id = InstanceId::new(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed));
        let interrupt = Interrupt::new(module.engine.clone());
        let (ready_tx, ready_rx) = oneshot::channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (termination_tx, termination) = TerminationSignal::channel();

        let config = Arc::clone(&self.config);
        let thread_interrupt = interrupt.clone();
        let mut guard = StartGuard {
            interrupt: Some(interrupt.clone()),
        };
        thread::Builder::new()
            .name(format!("cellrun-instance-{id}"))
            .spawn(move || {
                runtime_main(
                    id,
                    &module,
                    &config,
                    &thread_interrupt,
                    ready_tx,
                    command_rx,
                    termination_tx,
                )
            })
            .map_err(|e| RuntimeError::Startup(format!("failed to spawn runtime thread: {e}")))?;

        let handshake = ready_rx.await;
        guard.disarm();
        handshake.map_err(|_| {
            RuntimeError::Handshake("runtime thread exited before signalling readiness".to_string())
        })??;

        tracing::debug!("instance {id}: ready");
        let instance = Instance::new(id, command_tx, interrupt, termination.clone());
        Ok((instance, termination))
    }
}

fn runtime_main(
    id: InstanceId,
    module: &EngineModule,
    config: &RuntimeConfig,
    interrupt: &Interrupt,
    ready: oneshot::Sender<RuntimeResult<()>>,
    commands: mpsc::UnboundedReceiver<Command>,
    termination_tx: watch::Sender<Option<Termination>>,
) {
    let termination = match Runtime::boot(module, config, interrupt) {
        Ok(runtime) => {
            if ready.send(Ok(())).is_err() {
                // Nobody is waiting for this instance anymore.
                Termination::Exited
            } else {
                runtime.serve(id, commands, interrupt)
            }
        }
        Err(e) => {
            let reason = e.to_string();
            let _ = ready.send(Err(e));
            Termination::Crashed { reason }
        }
    };
    match &termination {
        Termination::Crashed { reason } => tracing::warn!("instance {id}: {reason}"),
        _ => tracing::debug!("instance {id}: {termination}"),
    }
    let _ = termination_tx.send(Some(termination));
}

struct Runtime {
    store: Store<InstanceState>,
    memory: Memory,
    alloc: TypedFunc<i32, i32>,
    run: TypedFunc<(i32, i32), ()>,
}

impl Runtime {
    fn boot(
        module: &EngineModule,
        config: &RuntimeConfig,
        interrupt: &Interrupt,
    ) -> RuntimeResult<Self> {
        let startup = |e: anyhow::Error| RuntimeError::Startup(format!("{e:#}"));

        let stdout = CaptureBuffer::default();
        let stderr = CaptureBuffer::default();
        let wasi = wasi_ctx(&config.wasi_config, stdout.clone(), stderr.clone()).map_err(startup)?;
        let mut store = Store::new(
            &module.engine,
            InstanceState {
                wasi,
                stdout,
                stderr,
                ready: None,
            },
        );
        let requested = Arc::clone(&interrupt.requested);
        store.epoch_deadline_callback(move |_| {
            if requested.load(Ordering::SeqCst) {
                Err(anyhow!("interrupted by exit request"))
            } else {
                Ok(UpdateDeadline::Continue(1))
            }
        });
        store.set_epoch_deadline(1);

        let mut linker: Linker<InstanceState> = Linker::new(&module.engine);
        link_imports(&config.linker_config, &mut linker).map_err(startup)?;
        let instance = linker
            .instantiate(&mut store, &module.module)
            .context("failed to instantiate engine module")
            .map_err(startup)?;

        if let Some(init) = module.abi.init_export {
            let init_func = instance
                .get_typed_func::<(), ()>(&mut store, init)
                .map_err(|e| RuntimeError::Handshake(format!("`{init}` has an unexpected type: {e:#}")))?;
            init_func
                .call(&mut store, ())
                .map_err(|e| RuntimeError::Handshake(format!("`{init}` failed: {e:#}")))?;
        }
        match store.data().ready {
            Some(ABI_VERSION) => {}
            Some(version) => {
                return Err(RuntimeError::Handshake(format!(
                    "unsupported ABI version {version} (expected {ABI_VERSION})"
                )))
            }
            None => {
                return Err(RuntimeError::Handshake(
                    "engine did not call `cellrun.ready` during initialization".to_string(),
                ))
            }
        }
        // Output produced while initializing does not belong to any call.
        store.data().take_output();

        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .ok_or_else(|| RuntimeError::Handshake(format!("`{MEMORY_EXPORT}` export not found")))?;
        let alloc = instance
            .get_typed_func::<i32, i32>(&mut store, ALLOC_EXPORT)
            .map_err(|e| RuntimeError::Handshake(format!("{e:#}")))?;
        let run = instance
            .get_typed_func::<(i32, i32), ()>(&mut store, RUN_EXPORT)
            .map_err(|e| RuntimeError::Handshake(format!("{e:#}")))?;

        Ok(Self {
            store,
            memory,
            alloc,
            run,
        })
    }

    fn call(&mut self, input: &str) -> Result<RunOutput> {
        self.store.set_epoch_deadline(1);
        let len = i32::try_from(input.len()).context("input is too large for the guest")?;
        let ptr = self
            .alloc
            .call(&mut self.store, len)
            .with_context(|| format!("`{ALLOC_EXPORT}` failed"))?;
        self.memory
            .write(&mut self.store, ptr as u32 as usize, input.as_bytes())
            .context("failed to copy input into guest memory")?;
        self.run
            .call(&mut self.store, (ptr, len))
            .with_context(|| format!("`{RUN_EXPORT}` failed"))?;

        let (stdout, stderr) = self.store.data().take_output();
        Ok(RunOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    fn serve(
        mut self,
        id: InstanceId,
        mut commands: mpsc::UnboundedReceiver<Command>,
        interrupt: &Interrupt,
    ) -> Termination {
        while let Some(command) = commands.blocking_recv() {
            match command {
                Command::Run { input, reply } => {
                    if interrupt.is_requested() {
                        return Termination::Exited;
                    }
                    match self.call(&input) {
                        Ok(output) => {
                            let _ = reply.send(output);
                        }
                        // The reply is dropped unanswered; the caller learns about the
                        // crash from the termination signal.
                        Err(_) if interrupt.is_requested() => return Termination::Exited,
                        Err(e) => {
                            return Termination::Crashed {
                                reason: format!("{e:#}"),
                            }
                        }
                    }
                }
                Command::Exit => return Termination::Exited,
            }
        }
        tracing::debug!("instance {id}: all handles dropped");
        Termination::Exited
    }
}
