//! Correction session controller
//!
//! Owns at most one in-flight correction request. Every run gets a fresh
//! request id; state updates from a run are applied only while its id is
//! still the current one, so a superseded or reset run can never touch the
//! state again even if a late chunk slips through before cancellation lands.
//!
//! ```text
//! start() ──► begin(): cancel previous, new id, state = ocr
//!               │
//!               ▼
//!        POST /correct/stream ──► pump_events() ──► apply() if id current
//!               │                        │
//!           non-2xx: error          end without done/error: error
//! ```

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::{within_stall_limit, ApiClient, CorrectParams};
use crate::auth::SessionContext;
use crate::error::{ClientError, GENERIC_RETRY_MESSAGE, INTERRUPTED_MESSAGE};
use crate::metrics::{CycleKind, CycleOutcome, MetricsCollector, StreamStats};
use crate::state_machine::{CorrectionPhase, CorrectionState};
use crate::streaming::{pump_events, StreamEnd};

#[derive(Default)]
struct ActiveRequest {
    id: Option<Uuid>,
    cancel: Option<CancellationToken>,
}

/// How a run ended, from the controller's point of view
#[derive(Debug, Clone, PartialEq)]
enum RunEnd {
    Finished,
    Failed(String),
    /// Superseded, reset, or dropped
    Cancelled,
}

/// Per-run bookkeeping owned by the `start` future.
///
/// Closes the run when dropped. If the future was dropped before the run
/// produced an end (a caller timeout or a lost `select!`), the run is
/// cancelled and a still-current state is failed with the interrupted error.
struct RunGuard<'a> {
    controller: &'a CorrectionController,
    id: Uuid,
    stats: StreamStats,
    streamed_chars: u64,
    end: Option<RunEnd>,
}

impl<'a> RunGuard<'a> {
    fn new(controller: &'a CorrectionController, id: Uuid) -> Self {
        Self {
            controller,
            id,
            stats: StreamStats::default(),
            streamed_chars: 0,
            end: None,
        }
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let end = match self.end.take() {
            Some(end) => end,
            None => {
                log::info!("Correction {}: abandoned by its caller", self.id);
                self.controller.fail_message(self.id, INTERRUPTED_MESSAGE);
                RunEnd::Cancelled
            }
        };
        self.controller
            .close_run(self.id, end, &self.stats, self.streamed_chars);
    }
}

pub struct CorrectionController {
    api: Arc<ApiClient>,
    auth: SessionContext,
    stall_timeout: Option<Duration>,
    active: Mutex<ActiveRequest>,
    state: watch::Sender<CorrectionState>,
    metrics: Arc<Mutex<MetricsCollector>>,
}

impl CorrectionController {
    pub fn new(api: Arc<ApiClient>, auth: SessionContext) -> Self {
        let (state, _) = watch::channel(CorrectionState::default());
        Self {
            api,
            auth,
            stall_timeout: None,
            active: Mutex::new(ActiveRequest::default()),
            state,
            metrics: Arc::new(Mutex::new(MetricsCollector::new())),
        }
    }

    /// Fail a run when no chunk arrives for `timeout`. `None` waits forever.
    pub fn with_stall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Record cycles into a collector shared with other controllers.
    pub fn with_metrics(mut self, metrics: Arc<Mutex<MetricsCollector>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Snapshot of the current state
    pub fn state(&self) -> CorrectionState {
        self.state.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<CorrectionState> {
        self.state.subscribe()
    }

    pub fn metrics(&self) -> Arc<Mutex<MetricsCollector>> {
        self.metrics.clone()
    }

    /// Cancel any in-flight request and restore the initial state.
    pub fn reset(&self) {
        let mut active = self.lock_active();
        if let Some(cancel) = active.cancel.take() {
            log::info!("Correction: reset cancels in-flight request");
            cancel.cancel();
        }
        active.id = None;
        self.state.send_replace(CorrectionState::default());
    }

    /// Run one correction to completion.
    ///
    /// Resolves once the run reaches a terminal state or is superseded by
    /// another `start` or by `reset`. Failures end up in the state, never in
    /// the return value. Dropping the future before it resolves ends the run
    /// with the interrupted error.
    pub async fn start(&self, params: CorrectParams) {
        let (id, cancel) = self.begin();
        self.lock_metrics().start_cycle(id, CycleKind::Correction);

        let mut run = RunGuard::new(self, id);
        let end = self
            .run(id, &cancel, &params, &mut run.stats, &mut run.streamed_chars)
            .await;
        run.end = Some(end);
    }

    /// Record the finished run and release its cancellation token.
    fn close_run(&self, id: Uuid, end: RunEnd, stats: &StreamStats, streamed_chars: u64) {
        let (outcome, error) = match end {
            RunEnd::Finished => (CycleOutcome::Succeeded, None),
            RunEnd::Failed(message) => (CycleOutcome::Failed, Some(message)),
            RunEnd::Cancelled => (CycleOutcome::Cancelled, None),
        };
        log::info!(
            "Correction {} ended: {:?} ({} events, {} malformed lines)",
            id,
            outcome,
            stats.events,
            stats.malformed_lines
        );
        self.lock_metrics()
            .finish_cycle(id, outcome, stats, streamed_chars, error);

        let mut active = self.lock_active();
        if active.id == Some(id) {
            if let Some(cancel) = active.cancel.take() {
                cancel.cancel();
            }
        }
    }

    /// Supersede any previous run and publish the starting state.
    fn begin(&self) -> (Uuid, CancellationToken) {
        let mut active = self.lock_active();
        if let Some(previous) = active.cancel.take() {
            log::info!("Correction: superseding in-flight request");
            previous.cancel();
        }

        let id = Uuid::new_v4();
        let cancel = CancellationToken::new();
        active.id = Some(id);
        active.cancel = Some(cancel.clone());
        self.state.send_replace(CorrectionState::starting());
        (id, cancel)
    }

    async fn run(
        &self,
        id: Uuid,
        cancel: &CancellationToken,
        params: &CorrectParams,
        stats: &mut StreamStats,
        streamed_chars: &mut u64,
    ) -> RunEnd {
        if params.file.is_empty() {
            return self.fail_with(id, &ClientError::MissingFile);
        }
        let bearer = match self.auth.bearer_token() {
            Ok(token) => token,
            Err(e) => return self.fail_with(id, &e),
        };

        let opened = tokio::select! {
            biased;
            _ = cancel.cancelled() => return RunEnd::Cancelled,
            opened = within_stall_limit(
                self.stall_timeout,
                self.api.open_correction_stream(&bearer, params),
            ) => opened,
        };
        let response = match opened {
            Ok(response) => response,
            Err(e) => return self.fail_with(id, &e),
        };

        let end = pump_events(
            response.bytes_stream(),
            cancel,
            self.stall_timeout,
            stats,
            |event| {
                if let Some(text) = event.token_text() {
                    *streamed_chars += text.chars().count() as u64;
                }
                if self.update_if_current(id, |s| s.apply(event)) {
                    ControlFlow::Continue(())
                } else {
                    ControlFlow::Break(())
                }
            },
        )
        .await;

        match end {
            StreamEnd::Completed => self.settle(id),
            StreamEnd::Cancelled => RunEnd::Cancelled,
            StreamEnd::Stalled(limit) => {
                log::warn!("Correction {}: no data for {:?}", id, limit);
                self.fail_with(id, &ClientError::Stalled(limit))
            }
            StreamEnd::Failed(reason) => {
                log::warn!("Correction {}: stream failed: {}", id, reason);
                self.fail_message(id, GENERIC_RETRY_MESSAGE)
            }
        }
    }

    /// Body ended normally: report the terminal state, or synthesize an
    /// error when the server closed without `done` or `error`.
    fn settle(&self, id: Uuid) -> RunEnd {
        let mut end = RunEnd::Cancelled;
        self.update_if_current(id, |s| match s.phase {
            CorrectionPhase::Done => {
                end = RunEnd::Finished;
                false
            }
            CorrectionPhase::Error => {
                end = RunEnd::Failed(s.error.clone().unwrap_or_default());
                false
            }
            phase => {
                log::warn!(
                    "Correction {}: stream closed during {} without a final event",
                    id,
                    phase.as_str()
                );
                end = RunEnd::Failed(INTERRUPTED_MESSAGE.to_string());
                s.fail(INTERRUPTED_MESSAGE)
            }
        });
        end
    }

    fn fail_with(&self, id: Uuid, error: &ClientError) -> RunEnd {
        if error.is_precondition() {
            log::info!("Correction {}: not started: {}", id, error);
        } else {
            log::warn!("Correction {}: {}", id, error);
        }
        self.fail_message(id, &error.user_message())
    }

    fn fail_message(&self, id: Uuid, message: &str) -> RunEnd {
        if self.update_if_current(id, |s| s.fail(message)) {
            RunEnd::Failed(message.to_string())
        } else {
            RunEnd::Cancelled
        }
    }

    /// Apply `update` only if `id` is still the current request.
    ///
    /// Returns false when the request was superseded or reset.
    fn update_if_current<F>(&self, id: Uuid, update: F) -> bool
    where
        F: FnOnce(&mut CorrectionState) -> bool,
    {
        let active = self.lock_active();
        if active.id != Some(id) {
            log::debug!("Correction {}: dropping update from stale request", id);
            return false;
        }
        self.state.send_if_modified(update);
        true
    }

    fn lock_active(&self) -> MutexGuard<'_, ActiveRequest> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_metrics(&self) -> MutexGuard<'_, MetricsCollector> {
        self.metrics.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for CorrectionController {
    fn drop(&mut self) {
        let active = self.active.get_mut().unwrap_or_else(PoisonError::into_inner);
        if let Some(cancel) = active.cancel.take() {
            cancel.cancel();
        }
    }
}
