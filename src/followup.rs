//! Follow-up conversation controller
//!
//! After a correction is done the student can ask further questions. Each
//! question opens its own streaming request carrying the conversation so far;
//! the answer streams into an assistant placeholder appended beforehand.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::{within_stall_limit, ApiClient, FollowupRequest};
use crate::auth::SessionContext;
use crate::error::{ClientError, GENERIC_RETRY_MESSAGE};
use crate::metrics::{CycleKind, CycleOutcome, MetricsCollector, StreamStats};
use crate::state_machine::{CorrectionPhase, CorrectionState, FollowupMessage, Transcript};
use crate::streaming::{pump_events, StreamEnd, StreamEvent};

/// Routing information the follow-up endpoint needs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FollowupContext {
    pub routed_subject: String,
    pub level: String,
}

impl FollowupContext {
    pub fn new(routed_subject: impl Into<String>, level: impl Into<String>) -> Self {
        Self {
            routed_subject: routed_subject.into(),
            level: level.into(),
        }
    }

    /// Derive the context from a finished correction.
    ///
    /// `None` unless the session is done and both the subject (specialist
    /// first) and the level are known.
    pub fn from_session(state: &CorrectionState) -> Option<Self> {
        if state.phase != CorrectionPhase::Done {
            return None;
        }
        let subject = state.routed_subject().filter(|s| !s.is_empty())?;
        let level = state.level.as_deref().filter(|l| !l.is_empty())?;
        Some(Self::new(subject, level))
    }
}

/// Observable state of the conversation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FollowupView {
    pub transcript: Transcript,
    /// True exactly while a send is outstanding
    pub is_loading: bool,
}

#[derive(Default)]
struct PendingSend {
    id: Option<Uuid>,
    cancel: Option<CancellationToken>,
}

/// Per-send bookkeeping owned by the `send_message` future; closes the
/// send when dropped, including when the caller abandons the future.
struct SendGuard<'a> {
    controller: &'a FollowupController,
    id: Uuid,
    stats: StreamStats,
    streamed_chars: u64,
    end: Option<StreamEnd>,
}

impl<'a> SendGuard<'a> {
    fn new(controller: &'a FollowupController, id: Uuid) -> Self {
        Self {
            controller,
            id,
            stats: StreamStats::default(),
            streamed_chars: 0,
            end: None,
        }
    }
}

impl Drop for SendGuard<'_> {
    fn drop(&mut self) {
        self.controller
            .close_send(self.id, self.end.take(), &self.stats, self.streamed_chars);
    }
}

pub struct FollowupController {
    api: Arc<ApiClient>,
    auth: SessionContext,
    stall_timeout: Option<Duration>,
    context: Mutex<Option<FollowupContext>>,
    pending: Mutex<PendingSend>,
    view: watch::Sender<FollowupView>,
    metrics: Arc<Mutex<MetricsCollector>>,
}

impl FollowupController {
    pub fn new(api: Arc<ApiClient>, auth: SessionContext) -> Self {
        let (view, _) = watch::channel(FollowupView::default());
        Self {
            api,
            auth,
            stall_timeout: None,
            context: Mutex::new(None),
            pending: Mutex::new(PendingSend::default()),
            view,
            metrics: Arc::new(Mutex::new(MetricsCollector::new())),
        }
    }

    pub fn with_context(self, context: FollowupContext) -> Self {
        self.set_context(Some(context));
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Mutex<MetricsCollector>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Replace the routing context used by later sends. A send already in
    /// flight keeps the context it started with.
    pub fn set_context(&self, context: Option<FollowupContext>) {
        *self.context.lock().unwrap_or_else(PoisonError::into_inner) = context;
    }

    pub fn context(&self) -> Option<FollowupContext> {
        self.context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn view(&self) -> FollowupView {
        self.view.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<FollowupView> {
        self.view.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        self.view.borrow().is_loading
    }

    pub fn metrics(&self) -> Arc<Mutex<MetricsCollector>> {
        self.metrics.clone()
    }

    /// Cancel the pending send, clear the transcript and the loading flag.
    pub fn reset(&self) {
        let mut pending = self.lock_pending();
        if let Some(cancel) = pending.cancel.take() {
            log::info!("Follow-up: reset cancels pending answer");
            cancel.cancel();
        }
        pending.id = None;
        self.view.send_replace(FollowupView::default());
    }

    /// Ask a follow-up question and stream the answer into the transcript.
    ///
    /// Precondition failures are returned before anything is touched.
    /// Transport failures are not returned: they show up as the retry
    /// message in the assistant entry when nothing had been streamed yet.
    /// Dropping the future releases the send slot the same way.
    pub async fn send_message(&self, text: &str) -> Result<(), ClientError> {
        if text.trim().is_empty() {
            return Err(ClientError::EmptyMessage);
        }
        let context = self.context().ok_or(ClientError::MissingContext)?;
        let bearer = self.auth.bearer_token()?;

        let (id, cancel, history) = self.begin(text)?;
        self.lock_metrics().start_cycle(id, CycleKind::Followup);
        let mut send = SendGuard::new(self, id);

        let request = FollowupRequest {
            routed_subject: context.routed_subject,
            level: context.level,
            conversation_history: history,
            message: text.to_string(),
        };
        let end = self
            .run(id, &cancel, &bearer, &request, &mut send.stats, &mut send.streamed_chars)
            .await;
        send.end = Some(end);
        Ok(())
    }

    /// Record the finished send and release the slot.
    ///
    /// `None` means the caller dropped the send before it ended.
    fn close_send(
        &self,
        id: Uuid,
        end: Option<StreamEnd>,
        stats: &StreamStats,
        streamed_chars: u64,
    ) {
        let (outcome, error) = match end {
            Some(StreamEnd::Completed) => (CycleOutcome::Succeeded, None),
            Some(StreamEnd::Cancelled) => (CycleOutcome::Cancelled, None),
            Some(StreamEnd::Stalled(limit)) => (
                CycleOutcome::Failed,
                Some(ClientError::Stalled(limit).to_string()),
            ),
            Some(StreamEnd::Failed(reason)) => (CycleOutcome::Failed, Some(reason)),
            None => {
                log::info!("Follow-up {}: abandoned by its caller", id);
                self.update_if_current(id, |v| v.transcript.fail_placeholder(GENERIC_RETRY_MESSAGE));
                (CycleOutcome::Cancelled, None)
            }
        };

        if outcome == CycleOutcome::Failed {
            log::warn!(
                "Follow-up {} failed: {}",
                id,
                error.as_deref().unwrap_or_default()
            );
            self.update_if_current(id, |v| v.transcript.fail_placeholder(GENERIC_RETRY_MESSAGE));
        }
        self.lock_metrics()
            .finish_cycle(id, outcome, stats, streamed_chars, error);

        self.finish(id);
    }

    /// Claim the single send slot and append the exchange.
    fn begin(
        &self,
        text: &str,
    ) -> Result<(Uuid, CancellationToken, Vec<FollowupMessage>), ClientError> {
        let mut pending = self.lock_pending();
        if pending.id.is_some() {
            log::debug!("Follow-up: rejecting message while an answer is pending");
            return Err(ClientError::Busy);
        }

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        pending.id = Some(id);
        pending.cancel = Some(cancel.clone());

        let mut history = Vec::new();
        self.view.send_modify(|v| {
            history = v.transcript.begin_exchange(text);
            v.is_loading = true;
        });
        Ok((id, cancel, history))
    }

    async fn run(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
        bearer: &str,
        request: &FollowupRequest,
        stats: &mut StreamStats,
        streamed_chars: &mut u64,
    ) -> StreamEnd {
        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamEnd::Cancelled,
            opened = within_stall_limit(
                self.stall_timeout,
                self.api.open_followup_stream(bearer, request),
            ) => opened,
        };
        let response = match opened {
            Ok(response) => response,
            Err(ClientError::Stalled(limit)) => return StreamEnd::Stalled(limit),
            Err(e) => return StreamEnd::Failed(e.to_string()),
        };

        pump_events(
            response.bytes_stream(),
            cancel,
            self.stall_timeout,
            stats,
            |event| {
                // Only tokens matter on this channel
                let StreamEvent::Token { text } = event else {
                    return ControlFlow::Continue(());
                };
                *streamed_chars += text.chars().count() as u64;
                if self.update_if_current(id, |v| v.transcript.append_token(&text)) {
                    ControlFlow::Continue(())
                } else {
                    ControlFlow::Break(())
                }
            },
        )
        .await
    }

    /// Release the send slot and clear the loading flag if `id` still owns it.
    fn finish(&self, id: Uuid) {
        let mut pending = self.lock_pending();
        if pending.id != Some(id) {
            return;
        }
        pending.id = None;
        if let Some(cancel) = pending.cancel.take() {
            cancel.cancel();
        }
        self.view.send_modify(|v| v.is_loading = false);
    }

    fn update_if_current<F>(&self, id: Uuid, update: F) -> bool
    where
        F: FnOnce(&mut FollowupView) -> bool,
    {
        let pending = self.lock_pending();
        if pending.id != Some(id) {
            return false;
        }
        self.view.send_if_modified(update);
        true
    }

    fn lock_pending(&self) -> MutexGuard<'_, PendingSend> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_metrics(&self) -> MutexGuard<'_, MetricsCollector> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for FollowupController {
    fn drop(&mut self) {
        let pending = self.pending.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(cancel) = pending.cancel.take() {
            cancel.cancel();
        }
    }
}
