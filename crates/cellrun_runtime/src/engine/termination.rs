use std::fmt;

use tokio::sync::watch;

/// Why an instance's runtime stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The runtime exited on request (dispose, or every handle dropped).
    Exited,
    /// The guest trapped, exited on its own, or the host failed while serving it.
    Crashed { reason: String },
    /// The runtime thread went away without reporting (e.g. it panicked).
    Lost,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::Exited => write!(f, "runtime exited"),
            Termination::Crashed { reason } => write!(f, "runtime crashed: {reason}"),
            Termination::Lost => write!(f, "runtime thread was lost"),
        }
    }
}

/// One-shot notification that resolves when an instance's runtime stops.
///
/// Cloneable; every clone observes the same termination. Once resolved it stays
/// resolved.
#[derive(Debug, Clone)]
pub struct TerminationSignal {
    rx: watch::Receiver<Option<Termination>>,
}

impl TerminationSignal {
    pub(crate) fn channel() -> (watch::Sender<Option<Termination>>, Self) {
        let (tx, rx) = watch::channel(None);
        (tx, Self { rx })
    }

    /// Current termination, without waiting.
    pub fn peek(&self) -> Option<Termination> {
        if let Some(termination) = self.rx.borrow().clone() {
            return Some(termination);
        }
        // The sender is dropped without a value only when the runtime thread died abruptly.
        match self.rx.has_changed() {
            Ok(_) => None,
            Err(_) => Some(self.rx.borrow().clone().unwrap_or(Termination::Lost)),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.peek().is_some()
    }

    /// Wait until the runtime stops.
    pub async fn wait(&mut self) -> Termination {
        let observed = self
            .rx
            .wait_for(Option::is_some)
            .await
            .map(|termination| (*termination).clone());
        match observed {
            Ok(termination) => termination.unwrap_or(Termination::Lost),
            Err(_) => self.rx.borrow().clone().unwrap_or(Termination::Lost),
        }
    }
}
