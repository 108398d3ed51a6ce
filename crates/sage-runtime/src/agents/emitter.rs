//! Fragment delivery: record in the session, then forward to the caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::mpsc;
use tracing::debug;

use sage_core::Message;

use crate::errors::RuntimeError;
use crate::session::SessionContext;

/// Route for produced fragments: merged into the session, then forwarded to
/// the caller. A caller that stopped listening cancels the run.
#[derive(Clone)]
pub struct Emitter {
    session: Arc<SessionContext>,
    tx: Option<mpsc::Sender<Message>>,
    forwarded: Arc<AtomicUsize>,
}

impl Emitter {
    /// Emitter that forwards to `tx`.
    pub fn new(session: Arc<SessionContext>, tx: mpsc::Sender<Message>) -> Self {
        Self {
            session,
            tx: Some(tx),
            forwarded: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Emitter that only merges into the session (sub-sessions).
    pub fn detached(session: Arc<SessionContext>) -> Self {
        Self {
            session,
            tx: None,
            forwarded: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Session this emitter writes to.
    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    /// Merge into the session and forward.
    pub async fn emit(&self, message: Message) -> Result<(), RuntimeError> {
        let message = self.stamp(message);
        let _ = self.session.add_messages([message.clone()]);
        self.forward(message).await
    }

    /// Forward without touching the history.
    pub async fn emit_transient(&self, message: Message) -> Result<(), RuntimeError> {
        let message = self.stamp(message);
        self.forward(message).await
    }

    /// Resolves once the caller stops listening. Never resolves for a
    /// detached emitter.
    pub async fn closed(&self) {
        match &self.tx {
            Some(tx) => tx.closed().await,
            None => std::future::pending().await,
        }
    }

    /// Fragments forwarded so far.
    pub fn forwarded(&self) -> usize {
        self.forwarded.load(Ordering::Relaxed)
    }

    fn stamp(&self, mut message: Message) -> Message {
        if message.session_id.is_none() {
            message.session_id = Some(self.session.id().clone());
        }
        message
    }

    async fn forward(&self, message: Message) -> Result<(), RuntimeError> {
        let Some(tx) = &self.tx else {
            return Ok(());
        };
        if tx.send(message).await.is_err() {
            debug!(session_id = %self.session.id(), "caller stopped listening, cancelling run");
            self.session.cancel_token().cancel();
            return Err(RuntimeError::Cancelled);
        }
        let _ = self.forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
