//! Full-duplex WebSocket transport for tail sessions.

use axum::extract::ws::{Message, WebSocket};
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use super::{LogSubscription, TailEvent};
use crate::model::{JobId, StepId};

/// Outbound frame.
#[derive(Debug, Clone, Serialize)]
pub struct LogFrame {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub content: String,
    pub line_num: u64,
    /// Unix seconds.
    pub timestamp: i64,
    pub job_id: JobId,
    pub step_id: StepId,
}

impl LogFrame {
    fn new(kind: &'static str, content: String, line_num: u64, job_id: JobId, step_id: StepId) -> Self {
        Self {
            kind,
            content,
            line_num,
            timestamp: Utc::now().timestamp(),
            job_id,
            step_id,
        }
    }

    /// Heartbeats travel as WebSocket pings and have no frame.
    pub fn from_event(event: TailEvent, job_id: JobId, step_id: StepId) -> Option<Self> {
        let frame = match event {
            TailEvent::Status(status) => Self::new("status", status.to_string(), 0, job_id, step_id),
            TailEvent::Line { number, content } => Self::new("log", content, number, job_id, step_id),
            TailEvent::Heartbeat => return None,
            TailEvent::Complete { status, lines } => Self::new(
                "complete",
                format!("completed with status {status}, total lines: {lines}"),
                lines,
                job_id,
                step_id,
            ),
            TailEvent::Error { message } => Self::new("error", message, 0, job_id, step_id),
        };
        Some(frame)
    }
}

/// Inbound control frame.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum ControlFrame {
    /// Terminal resize from an interactive viewer.
    Resize { cols: u16, rows: u16 },
    Ping,
}

/// Pump a tail session into `socket` until it completes or the peer leaves.
pub async fn serve(socket: WebSocket, mut subscription: LogSubscription, job_id: JobId, step_id: StepId) {
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = subscription.next() => {
                let Some(event) = event else { break };
                let terminal = event.is_terminal();
                let message = match event {
                    TailEvent::Heartbeat => Message::Ping(Default::default()),
                    other => match LogFrame::from_event(other, job_id, step_id)
                        .and_then(|frame| serde_json::to_string(&frame).ok())
                    {
                        Some(json) => Message::Text(json.into()),
                        None => continue,
                    },
                };
                if sender.send(message).await.is_err() {
                    break;
                }
                if terminal {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
            inbound = receiver.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match serde_json::from_str::<ControlFrame>(text.as_str()) {
                            Ok(ControlFrame::Resize { cols, rows }) => {
                                tracing::debug!(job_id, step_id, cols, rows, "viewer resized");
                                None
                            }
                            Ok(ControlFrame::Ping) => Some(LogFrame::new("pong", String::new(), 0, job_id, step_id)),
                            Err(e) => Some(LogFrame::new(
                                "error",
                                format!("invalid control frame: {e}"),
                                0,
                                job_id,
                                step_id,
                            )),
                        };
                        if let Some(json) = reply.and_then(|frame| serde_json::to_string(&frame).ok()) {
                            if sender.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(error = %e, "log socket error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    // Dropping the subscription lets the tailer notice on its next poll.
    drop(subscription);
    tracing::debug!(job_id, step_id, "log socket closed");
}
