//! Streaming protocol support for the correction service
//!
//! Both streaming endpoints answer with a body of `data: <json>` lines. This
//! module turns that body into typed events.
//!
//! # Architecture
//!
//! ```text
//! Response body (bytes) ──▶ StreamReader ──▶ FramedRead<SseLineCodec>
//!                                                 │ (split on '\n', lossy utf-8)
//!                                                 ▼
//!                          classify_line ──▶ StreamEvent ──▶ pump_events callback
//!                                                            (controller state)
//! ```
//!
//! # Leniency
//!
//! - Lines without the `data: ` prefix, empty payloads and `[DONE]` are skipped
//! - Payloads that do not parse are counted and dropped; the stream continues

mod decoder;
mod protocol;
mod reader;

pub use decoder::{SseLineCodec, MAX_LINE_BYTES};
pub use protocol::{
    classify_line, CourseSource, Line, Phase, PhaseStatus, StreamEvent, DATA_PREFIX,
    DONE_SENTINEL,
};
pub use reader::{pump_events, StreamEnd};
