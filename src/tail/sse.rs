//! Server-Sent-Events transport for tail sessions.

use std::convert::Infallible;

use axum::response::sse::{Event, Sse};
use futures::{Stream, StreamExt};

use super::{LogSubscription, TailEvent};

/// Wire form of one tail event.
///
/// Lines are plain `data:` records, heartbeats are comment lines, and the
/// `status` / `complete` / `error` records carry an event name.
pub fn to_event(event: &TailEvent) -> Event {
    match event {
        TailEvent::Status(status) => Event::default().event("status").data(status.as_str()),
        TailEvent::Line { number, content } => {
            Event::default().id(number.to_string()).data(content)
        }
        TailEvent::Heartbeat => Event::default().comment("heartbeat"),
        TailEvent::Complete { status, lines } => Event::default()
            .event("complete")
            .data(format!("completed with status {status}, total lines: {lines}")),
        TailEvent::Error { message } => Event::default().event("error").data(message),
    }
}

pub fn stream(
    subscription: LogSubscription,
) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send + 'static> {
    Sse::new(
        subscription
            .into_stream()
            .map(|event| Ok::<_, Infallible>(to_event(&event))),
    )
}
