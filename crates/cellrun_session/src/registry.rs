use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use cellrun_runtime::engine::{EngineLoader, Instance, InstanceFactory};
use futures::future::{BoxFuture, FutureExt as _, Shared};

use crate::error::{SessionError, SessionResult};
use crate::notebook::DocumentId;

/// Shared handle to the (possibly still starting) instance of a session.
///
/// Every caller that looks up a document while the same session is current receives
/// a clone of the same future, so at most one instance is created per session.
/// The future is lazy: nothing is loaded or started until someone polls it.
pub type InstanceFuture = Shared<BoxFuture<'static, SessionResult<Arc<Instance>>>>;

#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Upper bound on the engine's readiness handshake. `None` waits indefinitely.
    pub handshake_timeout: Option<Duration>,
}

/// Tracks whether a session was ended, and the instance it started if any.
///
/// Both fields change under one lock, so an instance that comes up while its
/// session is being retired is either disposed by `retire` or refused by `adopt`.
#[derive(Default)]
struct Retirement {
    state: Mutex<RetirementState>,
}

#[derive(Default)]
struct RetirementState {
    retired: bool,
    instance: Option<Weak<Instance>>,
}

impl Retirement {
    fn lock(&self) -> MutexGuard<'_, RetirementState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_retired(&self) -> bool {
        self.lock().retired
    }

    /// Record the session's instance. Returns `false` if the session already ended.
    fn adopt(&self, instance: &Arc<Instance>) -> bool {
        let mut state = self.lock();
        if state.retired {
            return false;
        }
        state.instance = Some(Arc::downgrade(instance));
        true
    }

    /// End the session, disposing its instance if one is up.
    fn retire(&self) {
        let instance = {
            let mut state = self.lock();
            state.retired = true;
            state.instance.take()
        };
        if let Some(instance) = instance.and_then(|instance| instance.upgrade()) {
            instance.dispose();
        }
    }
}

struct Session {
    future: InstanceFuture,
    retirement: Arc<Retirement>,
}

struct Provisioner {
    loader: Arc<EngineLoader>,
    factory: InstanceFactory,
    wasm: Arc<[u8]>,
    options: SessionOptions,
}

impl Provisioner {
    async fn provision(
        self: Arc<Self>,
        document: DocumentId,
        retirement: Arc<Retirement>,
    ) -> SessionResult<Arc<Instance>> {
        let stopped = || SessionError::Stopped(document.clone());
        if retirement.is_retired() {
            return Err(stopped());
        }

        let module = self.loader.load(&self.wasm).await?;
        if retirement.is_retired() {
            return Err(stopped());
        }

        let start = self.factory.start(module);
        let (instance, _termination) = match self.options.handshake_timeout {
            Some(timeout) => tokio::time::timeout(timeout, start)
                .await
                .map_err(|_| SessionError::HandshakeTimeout(timeout))??,
            None => start.await?,
        };
        let instance = Arc::new(instance);
        if !retirement.adopt(&instance) {
            tracing::debug!("{}: session ended while instance {} started", document, instance.id());
            instance.dispose();
            return Err(stopped());
        }
        tracing::debug!("{}: started instance {}", document, instance.id());
        Ok(instance)
    }
}

/// Maps each open document to its current engine instance.
///
/// Lookups, replacements and removals of a document's entry happen under one lock and
/// never await, so concurrent callers cannot both observe a missing or dead entry and
/// start two instances. None of the operations need a running async runtime.
pub struct SessionRegistry {
    provisioner: Arc<Provisioner>,
    sessions: Mutex<HashMap<DocumentId, Session>>,
}

impl SessionRegistry {
    pub fn new(
        loader: Arc<EngineLoader>,
        factory: InstanceFactory,
        wasm: impl Into<Arc<[u8]>>,
        options: SessionOptions,
    ) -> Self {
        Self {
            provisioner: Arc::new(Provisioner {
                loader,
                factory,
                wasm: wasm.into(),
                options,
            }),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Current instance of `document`, starting one if needed.
    ///
    /// A dead instance is transparently replaced by a fresh one.
    pub async fn get_instance(&self, document: &DocumentId) -> SessionResult<Arc<Instance>> {
        self.reserve(document).await
    }

    /// Claim the session slot for `document` and return its instance future.
    ///
    /// The future is stored before any of its work begins; callers racing on the same
    /// document receive the same future.
    pub fn reserve(&self, document: &DocumentId) -> InstanceFuture {
        let mut sessions = self.lock_sessions();
        if let Some(current) = sessions.get(document) {
            match current.future.peek() {
                None => return current.future.clone(),
                Some(Ok(instance)) if instance.is_alive() => return current.future.clone(),
                Some(Ok(instance)) => {
                    tracing::info!(
                        "{}: instance {} is no longer running; starting a replacement",
                        document,
                        instance.id()
                    );
                    instance.dispose();
                }
                Some(Err(error)) => {
                    tracing::debug!("{}: retrying after failed start: {}", document, error);
                }
            }
        }
        let session = self.new_session(document);
        let future = session.future.clone();
        sessions.insert(document.clone(), session);
        future
    }

    /// End the session of `document`, disposing its instance.
    ///
    /// Returns `false` if the document had no session.
    pub fn stop_session(&self, document: &DocumentId) -> bool {
        let removed = self.lock_sessions().remove(document);
        match removed {
            Some(session) => {
                tracing::info!("{}: session stopped", document);
                session.retirement.retire();
                true
            }
            None => false,
        }
    }

    /// Replace the session of `document` with a fresh one, disposing the old instance.
    ///
    /// The new instance starts on the next lookup.
    pub fn restart_session(&self, document: &DocumentId) {
        let previous = {
            let mut sessions = self.lock_sessions();
            let session = self.new_session(document);
            sessions.insert(document.clone(), session)
        };
        tracing::info!("{}: session restarted", document);
        if let Some(previous) = previous {
            previous.retirement.retire();
        }
    }

    /// Host notification that `document` was closed.
    pub fn on_document_closed(&self, document: &DocumentId) -> bool {
        self.stop_session(document)
    }

    /// Dispose every tracked instance. Returns the number of sessions ended.
    pub fn dispose_all(&self) -> usize {
        let drained: Vec<Session> = self
            .lock_sessions()
            .drain()
            .map(|(_, session)| session)
            .collect();
        let count = drained.len();
        for session in drained {
            session.retirement.retire();
        }
        if count > 0 {
            tracing::debug!("disposed {} session(s)", count);
        }
        count
    }

    pub fn contains(&self, document: &DocumentId) -> bool {
        self.lock_sessions().contains_key(document)
    }

    pub fn len(&self) -> usize {
        self.lock_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn new_session(&self, document: &DocumentId) -> Session {
        let retirement = Arc::new(Retirement::default());
        let future = Arc::clone(&self.provisioner)
            .provision(document.clone(), Arc::clone(&retirement))
            .boxed()
            .shared();
        Session { future, retirement }
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<DocumentId, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
