use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{mpsc, oneshot, Mutex};

use super::factory::{Command, Interrupt};
use super::termination::{Termination, TerminationSignal};
use crate::{RuntimeError, RuntimeResult};

/// Process-unique identity of an engine instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(u64);

impl InstanceId {
    pub(crate) fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn get(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Output of one evaluation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
}

/// A running engine runtime.
///
/// Calls to [`Instance::run`] are dispatched one at a time in submission order and
/// each is raced against the instance's termination signal. Once the instance is
/// dead it stays dead.
pub struct Instance {
    id: InstanceId,
    alive: AtomicBool,
    disposed: AtomicBool,
    run_count: AtomicU64,
    /// Held while a call is dispatched; tokio's mutex grants the lock in FIFO order.
    dispatch: Mutex<()>,
    commands: mpsc::UnboundedSender<Command>,
    interrupt: Interrupt,
    termination: TerminationSignal,
}

impl Instance {
    pub(crate) fn new(
        id: InstanceId,
        commands: mpsc::UnboundedSender<Command>,
        interrupt: Interrupt,
        termination: TerminationSignal,
    ) -> Self {
        Self {
            id,
            alive: AtomicBool::new(true),
            disposed: AtomicBool::new(false),
            run_count: AtomicU64::new(0),
            dispatch: Mutex::new(()),
            commands,
            interrupt,
            termination,
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    /// Whether the instance can still accept calls.
    pub fn is_alive(&self) -> bool {
        if self.termination.is_terminated() {
            self.mark_dead();
        }
        self.alive.load(Ordering::SeqCst)
    }

    /// Number of calls accepted so far, including ones that later failed.
    pub fn run_count(&self) -> u64 {
        self.run_count.load(Ordering::SeqCst)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Signal that resolves when the runtime stops.
    pub fn termination(&self) -> TerminationSignal {
        self.termination.clone()
    }

    /// Evaluate `input`.
    ///
    /// Rejects with [`RuntimeError::NotRunning`] without contacting the runtime when
    /// the instance is already dead. Otherwise the call waits for every earlier call
    /// to settle, then either completes or rejects with [`RuntimeError::Crashed`] if
    /// the runtime stops first.
    pub async fn run(&self, input: &str) -> RuntimeResult<RunOutput> {
        if !self.is_alive() {
            return Err(self.not_running());
        }
        self.run_count.fetch_add(1, Ordering::SeqCst);

        let _turn = self.dispatch.lock().await;
        if !self.is_alive() {
            return Err(self.not_running());
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        let command = Command::Run {
            input: input.to_string(),
            reply: reply_tx,
        };
        let mut termination = self.termination.clone();
        if self.commands.send(command).is_err() {
            let termination = termination.wait().await;
            return Err(self.crashed(termination));
        }

        tokio::select! {
            biased;
            reply = reply_rx => match reply {
                Ok(output) => Ok(output),
                Err(_) => {
                    let termination = termination.wait().await;
                    Err(self.crashed(termination))
                }
            },
            termination = termination.wait() => Err(self.crashed(termination)),
        }
    }

    /// Ask the runtime to exit without waiting for it.
    ///
    /// An in-flight call is interrupted and rejects as crashed. Returns `false` if
    /// the instance was already disposed.
    pub fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let was_alive = self.mark_dead();
        if was_alive {
            tracing::debug!("instance {}: disposing", self.id);
            let _ = self.commands.send(Command::Exit);
            self.interrupt.trigger();
        }
        true
    }

    /// Returns whether this call flipped the instance from alive to dead.
    fn mark_dead(&self) -> bool {
        self.alive
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn crashed(&self, termination: Termination) -> RuntimeError {
        if self.mark_dead() {
            tracing::warn!("instance {}: call lost to termination ({termination})", self.id);
        }
        RuntimeError::Crashed {
            instance: self.id,
            termination,
        }
    }

    fn not_running(&self) -> RuntimeError {
        RuntimeError::NotRunning { instance: self.id }
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Instance")
            .field("id", &self.id)
            .field("alive", &self.alive.load(Ordering::SeqCst))
            .field("run_count", &self.run_count())
            .finish()
    }
}
