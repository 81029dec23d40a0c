//! Streaming relay and persistence sink.
//!
//! Wraps an adapter's output stream in a tee: every chunk is forwarded to the
//! caller unchanged while being accumulated into a draft. When the stream
//! closes, the draft becomes exactly one persisted assistant message:
//!
//! * natural completion — persist inline, then touch the chat timestamp;
//! * consumer abort — persist whatever accumulated so far, out of band, so
//!   partial responses are not lost;
//! * upstream error — skip persistence and forward the error.
//!
//! At-most-once is structural: the [`StreamSession`] is consumed by whichever
//! exit runs first, and the remaining paths see nothing left to persist.

use std::sync::Arc;

use async_stream::stream;
use bytes::Bytes;
use futures::StreamExt;

use crate::providers::TextStream;
use crate::storage::{ChatStore, NewMessage, Role};

/// Where a finished session ended up. Terminal; a session reaches exactly
/// one of these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Completed,
    Cancelled,
    Failed,
}

/// Ephemeral per-request state: which chat to write to, which model produced
/// the text, and the store to write through.
pub struct StreamSession {
    chat_id: String,
    model_id: String,
    store: Arc<dyn ChatStore>,
}

impl StreamSession {
    pub fn new(chat_id: impl Into<String>, model_id: impl Into<String>, store: Arc<dyn ChatStore>) -> Self {
        Self {
            chat_id: chat_id.into(),
            model_id: model_id.into(),
            store,
        }
    }

    /// Persist the accumulated draft as one assistant message and bump the
    /// chat's last-activity timestamp. Consumes the session; errors are
    /// logged, not propagated, because the response stream is already closed.
    async fn persist(self, draft: String, outcome: SessionOutcome) {
        if draft.is_empty() {
            tracing::debug!(chat_id = %self.chat_id, ?outcome, "empty draft, nothing to persist");
            return;
        }
        let bytes = draft.len();
        let result = self
            .store
            .create_message(NewMessage {
                chat_id: self.chat_id.clone(),
                role: Role::Assistant,
                content: draft,
                model: Some(self.model_id.clone()),
            })
            .await;
        match result {
            Ok(_) => {
                tracing::info!(chat_id = %self.chat_id, model = %self.model_id, bytes, ?outcome, "assistant message persisted");
                if let Err(err) = self.store.touch_chat_updated_at(&self.chat_id).await {
                    tracing::warn!(chat_id = %self.chat_id, error = %err, "failed to touch chat timestamp");
                }
            }
            Err(err) => {
                tracing::error!(chat_id = %self.chat_id, error = %err, "failed to persist assistant message");
            }
        }
    }
}

/// Accumulator that owns the session until exactly one exit claims it.
///
/// If the consumer drops the relayed stream mid-flight, `Drop` runs with the
/// session still present and spawns the persistence write out of band.
struct DraftGuard {
    session: Option<StreamSession>,
    draft: String,
}

impl DraftGuard {
    fn new(session: StreamSession) -> Self {
        Self {
            session: Some(session),
            draft: String::new(),
        }
    }

    fn push(&mut self, chunk: &Bytes) {
        self.draft.push_str(&String::from_utf8_lossy(chunk));
    }

    /// Upstream errored: nothing gets persisted, now or at drop.
    fn abandon(&mut self) {
        if let Some(session) = self.session.take() {
            tracing::warn!(chat_id = %session.chat_id, "stream failed, draft discarded");
        }
        self.draft.clear();
    }

    /// Natural end of stream: persist inline.
    async fn complete(&mut self) {
        if let Some(session) = self.session.take() {
            session
                .persist(std::mem::take(&mut self.draft), SessionOutcome::Completed)
                .await;
        }
    }
}

impl Drop for DraftGuard {
    fn drop(&mut self) {
        // Reached only when neither complete() nor abandon() ran: the
        // consumer cancelled. Persistence must not block the already-closed
        // response, so it runs on a detached task.
        if let Some(session) = self.session.take() {
            let draft = std::mem::take(&mut self.draft);
            tokio::spawn(async move {
                session.persist(draft, SessionOutcome::Cancelled).await;
            });
        }
    }
}

/// Tee `upstream` into a byte-identical caller-facing stream while
/// accumulating chunks for the persistence sink.
pub fn tee(upstream: TextStream, session: StreamSession) -> TextStream {
    let relayed = stream! {
        let mut guard = DraftGuard::new(session);
        let mut upstream = upstream;
        while let Some(item) = upstream.next().await {
            match item {
                Ok(chunk) => {
                    guard.push(&chunk);
                    yield Ok(chunk);
                }
                Err(err) => {
                    guard.abandon();
                    yield Err(err);
                    return;
                }
            }
        }
        guard.complete().await;
    };
    relayed.boxed()
}
