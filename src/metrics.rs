//! Metrics collection for the StudyBuddy client
//!
//! Tracks per-stream counters (including dropped malformed lines) and a
//! bounded history of correction and follow-up cycles for diagnostics.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Maximum number of completed cycles to retain in history
const MAX_CYCLE_HISTORY: usize = 50;

/// Maximum number of errors to retain in history
const MAX_ERROR_HISTORY: usize = 20;

/// Counters for one streamed response
#[derive(Debug, Clone, Default)]
pub struct StreamStats {
    pub chunks: u64,
    pub bytes: u64,
    /// Complete lines seen, including blank separators
    pub lines: u64,
    /// Lines that parsed into an event
    pub events: u64,
    pub tokens: u64,
    /// Non-data lines, empty payloads and the `[DONE]` marker
    pub ignored_lines: u64,
    /// Data lines that could not be parsed; dropped without stopping the stream
    pub malformed_lines: u64,
    pub first_token_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleKind {
    Correction,
    Followup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CycleOutcome {
    Succeeded,
    Failed,
    /// Superseded by a newer request or reset
    Cancelled,
}

/// Metrics for a finished request cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleMetrics {
    pub cycle_id: String,
    pub kind: CycleKind,
    /// Unix timestamp when the cycle started (seconds)
    pub started_at: u64,
    pub time_to_first_token_ms: Option<u64>,
    pub total_ms: u64,
    /// Characters of streamed text received
    pub streamed_chars: u64,
    pub malformed_lines: u64,
    pub outcome: CycleOutcome,
    pub error_message: Option<String>,
}

/// Summary statistics across all recorded cycles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSummary {
    pub total_cycles: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    /// Average over successful cycles that streamed at least one token
    pub avg_time_to_first_token_ms: u64,
    /// Average over successful cycles
    pub avg_total_ms: u64,
    pub malformed_lines: u64,
    pub last_error: Option<ErrorRecord>,
}

/// Record of an error that occurred during a cycle
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    /// Unix timestamp when the error occurred (seconds)
    pub timestamp: u64,
    pub kind: CycleKind,
    pub message: String,
    pub cycle_id: Option<String>,
}

struct CycleInProgress {
    kind: CycleKind,
    started_at: Instant,
    started_at_unix: u64,
}

/// Collects cycle metrics; shared between controllers behind a mutex
#[derive(Default)]
pub struct MetricsCollector {
    in_progress: HashMap<Uuid, CycleInProgress>,
    history: VecDeque<CycleMetrics>,
    errors: VecDeque<ErrorRecord>,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_cycle(&mut self, id: Uuid, kind: CycleKind) {
        self.in_progress.insert(
            id,
            CycleInProgress {
                kind,
                started_at: Instant::now(),
                started_at_unix: unix_now(),
            },
        );
    }

    /// Number of cycles started but not yet finished
    pub fn in_progress(&self) -> usize {
        self.in_progress.len()
    }

    /// Close a cycle. Unknown ids are ignored.
    pub fn finish_cycle(
        &mut self,
        id: Uuid,
        outcome: CycleOutcome,
        stats: &StreamStats,
        streamed_chars: u64,
        error_message: Option<String>,
    ) {
        let Some(cycle) = self.in_progress.remove(&id) else {
            log::debug!("Metrics: finish for unknown cycle {}", id);
            return;
        };

        if let Some(message) = &error_message {
            self.record_error(cycle.kind, message.clone(), Some(id));
        }

        let metrics = CycleMetrics {
            cycle_id: id.to_string(),
            kind: cycle.kind,
            started_at: cycle.started_at_unix,
            time_to_first_token_ms: stats
                .first_token_at
                .map(|t| millis(t.saturating_duration_since(cycle.started_at))),
            total_ms: millis(cycle.started_at.elapsed()),
            streamed_chars,
            malformed_lines: stats.malformed_lines,
            outcome,
            error_message,
        };

        log::debug!(
            "Metrics: {:?} cycle {} {:?} in {}ms ({} malformed lines)",
            metrics.kind,
            metrics.cycle_id,
            metrics.outcome,
            metrics.total_ms,
            metrics.malformed_lines
        );

        if self.history.len() == MAX_CYCLE_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(metrics);
    }

    pub fn record_error(&mut self, kind: CycleKind, message: String, cycle_id: Option<Uuid>) {
        if self.errors.len() == MAX_ERROR_HISTORY {
            self.errors.pop_front();
        }
        self.errors.push_back(ErrorRecord {
            timestamp: unix_now(),
            kind,
            message,
            cycle_id: cycle_id.map(|id| id.to_string()),
        });
    }

    /// Finished cycles, oldest first
    pub fn cycles(&self) -> impl Iterator<Item = &CycleMetrics> {
        self.history.iter()
    }

    pub fn errors(&self) -> impl Iterator<Item = &ErrorRecord> {
        self.errors.iter()
    }

    pub fn summary(&self) -> MetricsSummary {
        let count = |outcome| self.history.iter().filter(|c| c.outcome == outcome).count() as u64;
        let succeeded: Vec<&CycleMetrics> = self
            .history
            .iter()
            .filter(|c| c.outcome == CycleOutcome::Succeeded)
            .collect();

        let avg = |values: Vec<u64>| {
            if values.is_empty() {
                0
            } else {
                values.iter().sum::<u64>() / values.len() as u64
            }
        };

        MetricsSummary {
            total_cycles: self.history.len() as u64,
            succeeded: succeeded.len() as u64,
            failed: count(CycleOutcome::Failed),
            cancelled: count(CycleOutcome::Cancelled),
            avg_time_to_first_token_ms: avg(
                succeeded
                    .iter()
                    .filter_map(|c| c.time_to_first_token_ms)
                    .collect(),
            ),
            avg_total_ms: avg(succeeded.iter().map(|c| c.total_ms).collect()),
            malformed_lines: self.history.iter().map(|c| c.malformed_lines).sum(),
            last_error: self.errors.back().cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finished_cycle_lands_in_history() {
        let mut m = MetricsCollector::new();
        let id = Uuid::new_v4();
        m.start_cycle(id, CycleKind::Correction);

        let stats = StreamStats {
            malformed_lines: 2,
            first_token_at: Some(Instant::now()),
            ..Default::default()
        };
        m.finish_cycle(id, CycleOutcome::Succeeded, &stats, 11, None);

        let cycles: Vec<_> = m.cycles().collect();
        assert_eq!(cycles.len(), 1);
        assert_eq!(cycles[0].streamed_chars, 11);
        assert_eq!(cycles[0].malformed_lines, 2);
        assert!(cycles[0].time_to_first_token_ms.is_some());

        let summary = m.summary();
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.malformed_lines, 2);
        assert!(summary.last_error.is_none());
    }

    #[test]
    fn failed_cycle_records_error() {
        let mut m = MetricsCollector::new();
        let id = Uuid::new_v4();
        m.start_cycle(id, CycleKind::Followup);
        m.finish_cycle(
            id,
            CycleOutcome::Failed,
            &StreamStats::default(),
            0,
            Some("HTTP 500".to_string()),
        );

        let summary = m.summary();
        assert_eq!(summary.failed, 1);
        let last = summary.last_error.expect("error recorded");
        assert_eq!(last.kind, CycleKind::Followup);
        assert_eq!(last.cycle_id, Some(id.to_string()));
    }

    #[test]
    fn unknown_cycle_is_ignored() {
        let mut m = MetricsCollector::new();
        m.finish_cycle(
            Uuid::new_v4(),
            CycleOutcome::Succeeded,
            &StreamStats::default(),
            0,
            None,
        );
        assert_eq!(m.summary().total_cycles, 0);
    }

    #[test]
    fn history_is_bounded() {
        let mut m = MetricsCollector::new();
        for _ in 0..(MAX_CYCLE_HISTORY + 5) {
            let id = Uuid::new_v4();
            m.start_cycle(id, CycleKind::Correction);
            m.finish_cycle(id, CycleOutcome::Cancelled, &StreamStats::default(), 0, None);
        }
        assert_eq!(m.cycles().count(), MAX_CYCLE_HISTORY);
        assert_eq!(m.summary().cancelled, MAX_CYCLE_HISTORY as u64);
    }
}
