//! Event pump for streamed response bodies
//!
//! Frames the body into lines with a `FramedRead` over a `StreamReader` and
//! hands each parsed event to a callback in arrival order. Awaiting the next
//! line is the only suspension point; it races cancellation and the optional
//! stall timer.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::fmt::Display;
use std::io;
use std::ops::ControlFlow;
use std::time::{Duration, Instant};
use tokio_util::codec::{AnyDelimiterCodecError, FramedRead};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;

use super::decoder::SseLineCodec;
use super::protocol::{classify_line, Line, StreamEvent};
use crate::metrics::StreamStats;

/// Longest line excerpt written to the log for a dropped line
const LOG_EXCERPT_CHARS: usize = 120;

/// Why the pump stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEnd {
    /// The body ended normally
    Completed,
    /// Cancelled by the token, or the callback asked to stop
    Cancelled,
    /// No line arrived within the stall timeout
    Stalled(Duration),
    /// The transport failed mid-body
    Failed(String),
}

/// Drive `body` to completion, calling `on_event` for every parsed event.
///
/// Malformed lines are counted in `stats` and skipped; they never end the
/// stream. When `on_event` returns `Break` the pump stops immediately and
/// reports `Cancelled`. An unterminated last line is still processed.
pub async fn pump_events<S, B, E, F>(
    body: S,
    cancel: &CancellationToken,
    stall_timeout: Option<Duration>,
    stats: &mut StreamStats,
    mut on_event: F,
) -> StreamEnd
where
    S: Stream<Item = Result<B, E>>,
    B: Into<Bytes>,
    E: Display,
    F: FnMut(StreamEvent) -> ControlFlow<()>,
{
    let mut chunks = 0u64;
    let mut bytes = 0u64;

    let end = {
        let body = body
            .map(|item| -> Result<Bytes, io::Error> {
                match item {
                    Ok(chunk) => Ok(chunk.into()),
                    Err(e) => Err(io::Error::other(e.to_string())),
                }
            })
            .inspect(|item| {
                if let Ok(chunk) = item {
                    chunks += 1;
                    bytes += chunk.len() as u64;
                }
            });
        let framed = FramedRead::new(StreamReader::new(body), SseLineCodec::new());
        let mut lines = std::pin::pin!(framed);
        read_lines(&mut lines, cancel, stall_timeout, stats, &mut on_event).await
    };

    stats.chunks += chunks;
    stats.bytes += bytes;
    end
}

async fn read_lines<L, F>(
    lines: &mut L,
    cancel: &CancellationToken,
    stall_timeout: Option<Duration>,
    stats: &mut StreamStats,
    on_event: &mut F,
) -> StreamEnd
where
    L: Stream<Item = Result<String, AnyDelimiterCodecError>> + Unpin,
    F: FnMut(StreamEvent) -> ControlFlow<()>,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return StreamEnd::Cancelled,
            next = next_line(lines, stall_timeout) => next,
        };

        match next {
            Ok(Some(Ok(line))) => {
                if dispatch(&line, stats, on_event).is_break() {
                    return StreamEnd::Cancelled;
                }
            }
            Ok(Some(Err(e))) => return StreamEnd::Failed(e.to_string()),
            Ok(None) => return StreamEnd::Completed,
            Err(limit) => return StreamEnd::Stalled(limit),
        }
    }
}

async fn next_line<T>(
    lines: &mut T,
    stall_timeout: Option<Duration>,
) -> Result<Option<T::Item>, Duration>
where
    T: Stream + Unpin,
{
    match stall_timeout {
        Some(limit) => tokio::time::timeout(limit, lines.next())
            .await
            .map_err(|_| limit),
        None => Ok(lines.next().await),
    }
}

fn dispatch<F>(line: &str, stats: &mut StreamStats, on_event: &mut F) -> ControlFlow<()>
where
    F: FnMut(StreamEvent) -> ControlFlow<()>,
{
    stats.lines += 1;
    match classify_line(line) {
        Line::Event(event) => {
            stats.events += 1;
            if matches!(event, StreamEvent::Token { .. }) {
                stats.tokens += 1;
                stats.first_token_at.get_or_insert_with(Instant::now);
            }
            on_event(event)
        }
        Line::Ignored | Line::Sentinel => {
            stats.ignored_lines += 1;
            ControlFlow::Continue(())
        }
        Line::Malformed(e) => {
            stats.malformed_lines += 1;
            let excerpt: String = line.chars().take(LOG_EXCERPT_CHARS).collect();
            log::debug!("Dropping malformed stream line ({}): {}", e, excerpt);
            ControlFlow::Continue(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;
    use std::convert::Infallible;

    fn chunks(parts: &[&'static str]) -> impl Stream<Item = Result<&'static [u8], Infallible>> {
        let items: Vec<Result<&'static [u8], Infallible>> =
            parts.iter().copied().map(|p| Ok(p.as_bytes())).collect();
        stream::iter(items)
    }

    async fn collect(parts: &[&'static str]) -> (Vec<StreamEvent>, StreamStats, StreamEnd) {
        let cancel = CancellationToken::new();
        let mut stats = StreamStats::default();
        let mut events = Vec::new();
        let end = pump_events(chunks(parts), &cancel, None, &mut stats, |ev| {
            events.push(ev);
            ControlFlow::Continue(())
        })
        .await;
        (events, stats, end)
    }

    #[tokio::test]
    async fn events_arrive_in_order() {
        let (events, stats, end) = collect(&[
            "data: {\"type\":\"token\",\"text\":\"a\"}\n\ndata: {\"type\":\"tok",
            "en\",\"text\":\"b\"}\n\ndata: [DONE]\n\n",
        ])
        .await;

        assert_eq!(end, StreamEnd::Completed);
        let texts: Vec<_> = events.iter().filter_map(|e| e.token_text()).collect();
        assert_eq!(texts, vec!["a", "b"]);
        assert_eq!(stats.tokens, 2);
        assert_eq!(stats.chunks, 2);
        assert!(stats.first_token_at.is_some());
    }

    #[tokio::test]
    async fn malformed_line_does_not_stop_stream() {
        let (events, stats, end) = collect(&[
            "data: {\"type\":\"token\",\"text\":\"a\"}\ndata: {oops\ndata: {\"type\":\"token\",\"text\":\"b\"}\n",
        ])
        .await;

        assert_eq!(end, StreamEnd::Completed);
        assert_eq!(events.len(), 2);
        assert_eq!(stats.malformed_lines, 1);
    }

    #[tokio::test]
    async fn unterminated_last_line_is_processed() {
        let (events, _, _) = collect(&["data: {\"type\":\"token\",\"text\":\"fin\"}"]).await;
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn break_from_callback_stops_pump() {
        let cancel = CancellationToken::new();
        let mut stats = StreamStats::default();
        let mut seen = 0;
        let end = pump_events(
            chunks(&[
                "data: {\"type\":\"token\",\"text\":\"a\"}\ndata: {\"type\":\"token\",\"text\":\"b\"}\n",
            ]),
            &cancel,
            None,
            &mut stats,
            |_| {
                seen += 1;
                ControlFlow::Break(())
            },
        )
        .await;
        assert_eq!(end, StreamEnd::Cancelled);
        assert_eq!(seen, 1);
    }

    #[tokio::test]
    async fn transport_error_is_reported() {
        let body = stream::iter(vec![
            Ok(b"data: {\"type\":\"token\",\"text\":\"a\"}\n".to_vec()),
            Err("connection reset"),
        ]);
        let cancel = CancellationToken::new();
        let mut stats = StreamStats::default();
        let end = pump_events(body, &cancel, None, &mut stats, |_| ControlFlow::Continue(())).await;
        assert!(
            matches!(&end, StreamEnd::Failed(reason) if reason.contains("connection reset")),
            "{:?}",
            end
        );
        assert_eq!(stats.events, 1);
    }

    #[tokio::test]
    async fn cancellation_while_waiting_for_data() {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<Vec<u8>, Infallible>>(4);
        let body = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) });
        let cancel = CancellationToken::new();
        let mut stats = StreamStats::default();
        let mut events = Vec::new();

        tx.send(Ok(b"data: {\"type\":\"token\",\"text\":\"a\"}\n".to_vec()))
            .await
            .unwrap();

        let canceller = cancel.clone();
        let (end, _) = tokio::join!(
            pump_events(body, &cancel, None, &mut stats, |ev| {
                events.push(ev);
                ControlFlow::Continue(())
            }),
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                canceller.cancel();
                // Data sent after cancellation must never be observed
                let _ = tx
                    .send(Ok(b"data: {\"type\":\"token\",\"text\":\"late\"}\n".to_vec()))
                    .await;
            }
        );

        assert_eq!(end, StreamEnd::Cancelled);
        assert_eq!(events.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stall_timeout_ends_stream() {
        let body = stream::pending::<Result<Vec<u8>, Infallible>>();
        let cancel = CancellationToken::new();
        let mut stats = StreamStats::default();
        let end = pump_events(
            body,
            &cancel,
            Some(Duration::from_secs(30)),
            &mut stats,
            |_| ControlFlow::Continue(()),
        )
        .await;
        assert_eq!(end, StreamEnd::Stalled(Duration::from_secs(30)));
    }
}
