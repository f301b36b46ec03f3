//! Session objects and the session table.
//!
//! A [`Session`] carries the local extension implementations it serves, the
//! remote extension proxies instantiated for it at creation, and the state
//! of its prompt turn. Only one prompt turn may be active per session; a
//! second `begin_prompt` while one is running fails instead of queueing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use fastacp_core::logging::targets;
use fastacp_core::{AcpError, ErrorCode};
use fastacp_protocol::SessionId;
use fastacp_protocol::schema::methods::SESSION_UPDATE;
use fastacp_protocol::schema::{SessionUpdateNotification, StopReason};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::{HandlerError, RpcCallError};
use crate::extension::{
    ExtensibleSession, ExtensionLookup, ExtensionSet, RemoteExtension, RemoteExtensions,
    SessionExtensions, SessionResolver,
};
use crate::protocol::Protocol;

/// One item of a prompt turn's update stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    /// A `session/update` payload.
    Update(Value),
    /// The turn ended. Always the last event.
    Completed(StopReason),
}

/// Session-level failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    /// A prompt turn is already running on this session.
    PromptInProgress(SessionId),
    /// No prompt turn is running.
    NoActivePrompt(SessionId),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::PromptInProgress(id) => {
                write!(f, "Session {id} already has an active prompt")
            }
            SessionError::NoActivePrompt(id) => write!(f, "Session {id} has no active prompt"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<SessionError> for AcpError {
    fn from(err: SessionError) -> Self {
        AcpError::new(ErrorCode::InvalidRequest, err.to_string())
    }
}

impl From<SessionError> for HandlerError {
    fn from(err: SessionError) -> Self {
        HandlerError::Rpc(err.into())
    }
}

/// A conversation between client and agent.
pub struct Session {
    id: SessionId,
    local: ExtensionSet,
    remote: SessionExtensions,
    prompt_active: AtomicBool,
    updates: Mutex<Option<mpsc::UnboundedSender<TurnEvent>>>,
}

impl Session {
    #[must_use]
    pub fn new(id: SessionId, local: ExtensionSet, remote: SessionExtensions) -> Self {
        Self {
            id,
            local,
            remote,
            prompt_active: AtomicBool::new(false),
            updates: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Local extension implementations served for this session.
    #[must_use]
    pub fn local_extensions(&self) -> &ExtensionSet {
        &self.local
    }

    /// Remote extension proxies instantiated for this session.
    #[must_use]
    pub fn remote_extensions(&self) -> &SessionExtensions {
        &self.remote
    }

    /// Looks up a remote extension proxy.
    #[must_use]
    pub fn remote<E: RemoteExtension>(&self) -> ExtensionLookup<E::Proxy> {
        self.remote.get::<E>()
    }

    /// Returns true while a prompt turn is running.
    #[must_use]
    pub fn is_prompting(&self) -> bool {
        self.prompt_active.load(Ordering::Acquire)
    }

    /// Starts a prompt turn.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::PromptInProgress`] if a turn is already
    /// running.
    pub fn begin_prompt(self: &Arc<Self>) -> Result<PromptTurn, SessionError> {
        if self
            .prompt_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            log::debug!(target: targets::SESSION, "session {}: prompt rejected, turn in progress", self.id);
            return Err(SessionError::PromptInProgress(self.id.clone()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        *self.updates.lock().unwrap_or_else(PoisonError::into_inner) = Some(tx);
        log::debug!(target: targets::SESSION, "session {}: prompt turn started", self.id);
        Ok(PromptTurn {
            session: Arc::clone(self),
            events: rx,
            finished: false,
        })
    }

    /// Queues an update on the active turn.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoActivePrompt`] if no turn is running or the
    /// turn already completed.
    pub fn push_update(&self, update: Value) -> Result<(), SessionError> {
        let updates = self.updates.lock().unwrap_or_else(PoisonError::into_inner);
        updates
            .as_ref()
            .and_then(|tx| tx.send(TurnEvent::Update(update)).ok())
            .ok_or_else(|| SessionError::NoActivePrompt(self.id.clone()))
    }

    /// Ends the active turn. No more updates are accepted afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NoActivePrompt`] if no turn is running.
    pub fn complete_prompt(&self, reason: StopReason) -> Result<(), SessionError> {
        let tx = self
            .updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| SessionError::NoActivePrompt(self.id.clone()))?;
        log::debug!(target: targets::SESSION, "session {}: prompt turn completed ({:?})", self.id, reason);
        tx.send(TurnEvent::Completed(reason))
            .map_err(|_| SessionError::NoActivePrompt(self.id.clone()))
    }

    fn end_prompt(&self) {
        self.updates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        self.prompt_active.store(false, Ordering::Release);
    }
}

impl ExtensibleSession for Session {
    fn extensions(&self) -> &ExtensionSet {
        &self.local
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("prompting", &self.is_prompting())
            .finish()
    }
}

/// The single reader of one prompt turn's events.
///
/// Dropping it ends the turn and frees the session for the next prompt.
#[derive(Debug)]
pub struct PromptTurn {
    session: Arc<Session>,
    events: mpsc::UnboundedReceiver<TurnEvent>,
    finished: bool,
}

impl PromptTurn {
    #[must_use]
    pub fn session_id(&self) -> &SessionId {
        self.session.id()
    }

    /// Next event, or `None` after [`TurnEvent::Completed`] was returned or
    /// the turn was abandoned.
    pub async fn next(&mut self) -> Option<TurnEvent> {
        if self.finished {
            return None;
        }
        let event = self.events.recv().await;
        if matches!(event, None | Some(TurnEvent::Completed(_))) {
            self.finished = true;
        }
        event
    }

    /// Forwards every update to the peer as a `session/update` notification
    /// and returns the stop reason. A turn abandoned without completion
    /// ends as [`StopReason::Cancelled`].
    ///
    /// # Errors
    ///
    /// Fails if a notification cannot be sent.
    pub async fn forward(mut self, protocol: &Protocol) -> Result<StopReason, RpcCallError> {
        while let Some(event) = self.next().await {
            match event {
                TurnEvent::Update(update) => {
                    let params = SessionUpdateNotification {
                        session_id: self.session.id().clone(),
                        update,
                    };
                    protocol.notify(SESSION_UPDATE, &params)?;
                }
                TurnEvent::Completed(reason) => return Ok(reason),
            }
        }
        Ok(StopReason::Cancelled)
    }
}

impl Drop for PromptTurn {
    fn drop(&mut self) {
        self.session.end_prompt();
    }
}

/// Live sessions by id.
#[derive(Debug, Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
}

impl SessionTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a session, instantiating the remote extensions the peer
    /// supports, and stores it.
    pub fn create(
        &self,
        id: SessionId,
        local: ExtensionSet,
        protocol: &Protocol,
        remote: &RemoteExtensions,
        peer_capabilities: &Value,
    ) -> Arc<Session> {
        let extensions = remote.instantiate(protocol, &id, peer_capabilities);
        let session = Arc::new(Session::new(id, local, extensions));
        self.insert(Arc::clone(&session));
        session
    }

    /// Stores a session, returning the one it replaced.
    pub fn insert(&self, session: Arc<Session>) -> Option<Arc<Session>> {
        log::debug!(target: targets::SESSION, "session {} registered", session.id());
        let previous = self
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(session.id().clone(), session);
        if let Some(previous) = &previous {
            log::warn!(target: targets::SESSION, "session {} replaced", previous.id());
        }
        previous
    }

    #[must_use]
    pub fn get(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
    }

    pub fn remove(&self, id: &SessionId) -> Option<Arc<Session>> {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Session ids in sorted order.
    #[must_use]
    pub fn ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }
}

impl SessionResolver for SessionTable {
    fn resolve(&self, id: &SessionId) -> Option<Arc<dyn ExtensibleSession>> {
        self.get(id).map(|session| session as Arc<dyn ExtensibleSession>)
    }
}
