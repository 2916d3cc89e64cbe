//! Live Log Tailer.
//!
//! One spawned task per subscription walks `Opening -> Streaming ->
//! Completed | Errored`, polling the step's log file for growth and the
//! repository for the step's status. Transports (SSE, WebSocket) only
//! translate [`TailEvent`]s into their wire shape.

pub mod sse;
pub mod ws;

use std::path::PathBuf;
use std::sync::Arc;

use futures::Stream;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::TailConfig;
use crate::model::{JobId, Status, StepId};
use crate::storage::JobRepository;

const CHANNEL_DEPTH: usize = 256;

/// What a subscriber sees, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailEvent {
    /// Step status when streaming begins.
    Status(Status),
    /// One newline-delimited record, numbered from 1.
    Line { number: u64, content: String },
    /// Idle keep-alive.
    Heartbeat,
    /// Terminal marker; nothing follows it.
    Complete { status: Status, lines: u64 },
    /// Terminal failure of the subscription itself.
    Error { message: String },
}

impl TailEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TailEvent::Complete { .. } | TailEvent::Error { .. })
    }
}

/// Receiving end of a tail session. Dropping it ends the session within one
/// poll interval.
pub struct LogSubscription {
    events: mpsc::Receiver<TailEvent>,
    task: JoinHandle<()>,
}

impl LogSubscription {
    pub async fn next(&mut self) -> Option<TailEvent> {
        self.events.recv().await
    }

    pub fn into_stream(self) -> impl Stream<Item = TailEvent> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            let event = sub.events.recv().await?;
            Some((event, sub))
        })
    }

    /// Split into the event receiver and the tailer task.
    pub fn into_parts(self) -> (mpsc::Receiver<TailEvent>, JoinHandle<()>) {
        (self.events, self.task)
    }
}

#[derive(Clone)]
pub struct LogTailer {
    repo: Arc<dyn JobRepository>,
    config: TailConfig,
}

impl LogTailer {
    pub fn new(repo: Arc<dyn JobRepository>, config: TailConfig) -> Self {
        Self { repo, config }
    }

    /// Start tailing the current log of one step.
    pub fn subscribe(&self, job_id: JobId, step_id: StepId) -> LogSubscription {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let session = Session {
            repo: self.repo.clone(),
            config: self.config.clone(),
            job_id,
            step_id,
            tx,
        };
        let task = tokio::spawn(session.run());
        LogSubscription { events: rx, task }
    }
}

/// Reason a session stops before completing normally.
enum Stop {
    /// The subscriber went away.
    Disconnected,
    Failed(String),
}

impl From<crate::error::Error> for Stop {
    fn from(err: crate::error::Error) -> Self {
        Stop::Failed(err.to_string())
    }
}

struct Session {
    repo: Arc<dyn JobRepository>,
    config: TailConfig,
    job_id: JobId,
    step_id: StepId,
    tx: mpsc::Sender<TailEvent>,
}

/// Incremental newline splitter over the raw file bytes.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
    emitted: u64,
}

impl LineBuffer {
    /// Complete lines in `chunk` (plus anything pending), numbered.
    fn push(&mut self, chunk: &[u8]) -> Vec<(u64, String)> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(self.number(&raw[..raw.len() - 1]));
        }
        lines
    }

    /// Whatever is left without a trailing newline.
    fn flush(&mut self) -> Option<(u64, String)> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(self.number(&raw))
    }

    fn number(&mut self, raw: &[u8]) -> (u64, String) {
        self.emitted += 1;
        let text = String::from_utf8_lossy(raw).replace('\r', "");
        (self.emitted, text)
    }
}

impl Session {
    async fn run(self) {
        tracing::debug!(job_id = self.job_id, step_id = self.step_id, "tail session opened");
        match self.stream().await {
            Ok(()) => {}
            Err(Stop::Disconnected) => {
                tracing::debug!(job_id = self.job_id, step_id = self.step_id, "tail subscriber disconnected");
            }
            Err(Stop::Failed(message)) => {
                tracing::warn!(job_id = self.job_id, step_id = self.step_id, error = %message, "tail session failed");
                let _ = self.tx.send(TailEvent::Error { message }).await;
            }
        }
        tracing::debug!(job_id = self.job_id, step_id = self.step_id, "tail session closed");
    }

    async fn emit(&self, event: TailEvent) -> Result<(), Stop> {
        self.tx.send(event).await.map_err(|_| Stop::Disconnected)
    }

    /// The step's current log path and status.
    async fn current_step(&self) -> Result<(Option<PathBuf>, Status), Stop> {
        let step = self
            .repo
            .get_step(self.job_id, self.step_id)
            .await?
            .ok_or_else(|| Stop::Failed(format!("step {} not found", self.step_id)))?;
        let path = step.log_path.filter(|p| !p.is_empty()).map(PathBuf::from);
        Ok((path, step.status))
    }

    /// Opening: wait for the step to be assigned a log path.
    async fn wait_for_log_path(&self) -> Result<(PathBuf, Status), Stop> {
        let attempts = self.config.log_path_retries.max(1);
        for attempt in 0..attempts {
            if self.tx.is_closed() {
                return Err(Stop::Disconnected);
            }
            let (path, status) = self.current_step().await?;
            if let Some(path) = path {
                return Ok((path, status));
            }
            if status.is_terminal() {
                return Err(Stop::Failed(format!(
                    "step finished with status {status} but recorded no log"
                )));
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(self.config.open_interval()).await;
            }
        }
        Err(Stop::Failed("log path not assigned yet, step has not started".into()))
    }

    /// Opening: the file is created lazily by the runner.
    async fn open_log(&self, path: &PathBuf, status: Status) -> Result<File, Stop> {
        let attempts = if status.is_terminal() {
            self.config.finished_file_wait_retries
        } else {
            self.config.file_wait_retries
        }
        .max(1);

        let mut last_error = None;
        for attempt in 0..attempts {
            if self.tx.is_closed() {
                return Err(Stop::Disconnected);
            }
            match File::open(path).await {
                Ok(file) => return Ok(file),
                Err(e) => last_error = Some(e),
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(self.config.open_interval()).await;
            }
        }
        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        Err(Stop::Failed(format!(
            "log file {} unavailable: {reason}",
            path.display()
        )))
    }

    async fn drain(&self, file: &mut File, lines: &mut LineBuffer) -> Result<(), Stop> {
        let mut chunk = Vec::new();
        file.read_to_end(&mut chunk)
            .await
            .map_err(|e| Stop::Failed(format!("failed to read log: {e}")))?;
        for (number, content) in lines.push(&chunk) {
            self.emit(TailEvent::Line { number, content }).await?;
        }
        Ok(())
    }

    /// Attach to the log of the step's current run and announce its status.
    async fn attach(&self) -> Result<(PathBuf, File), Stop> {
        let (path, status) = self.wait_for_log_path().await?;
        let file = self.open_log(&path, status).await?;
        tracing::debug!(job_id = self.job_id, step_id = self.step_id, path = %path.display(), "tailing log");
        self.emit(TailEvent::Status(status)).await?;
        Ok((path, file))
    }

    async fn stream(&self) -> Result<(), Stop> {
        let (mut path, mut file) = self.attach().await?;

        let mut lines = LineBuffer::default();
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let status_every = u64::from(self.config.status_check_every.max(1));
        let heartbeat_every = u64::from(self.config.heartbeat_every.max(1));
        let mut tick: u64 = 0;

        loop {
            ticker.tick().await;
            if self.tx.is_closed() {
                return Err(Stop::Disconnected);
            }

            self.drain(&mut file, &mut lines).await?;

            if tick % status_every == 0 {
                let (current, status) = self.current_step().await?;
                let mut moved = current.as_deref() != Some(path.as_path());
                if !moved && status.is_terminal() {
                    tokio::time::sleep(self.config.drain_grace()).await;
                    // A re-run may have reset the step during the grace period.
                    let (current, status) = self.current_step().await?;
                    moved = current.as_deref() != Some(path.as_path());
                    if !moved && status.is_terminal() {
                        self.drain(&mut file, &mut lines).await?;
                        if let Some((number, content)) = lines.flush() {
                            self.emit(TailEvent::Line { number, content }).await?;
                        }
                        tracing::debug!(
                            job_id = self.job_id,
                            step_id = self.step_id,
                            %status,
                            lines = lines.emitted,
                            "tail complete"
                        );
                        return self
                            .emit(TailEvent::Complete {
                                status,
                                lines: lines.emitted,
                            })
                            .await;
                    }
                }
                if moved {
                    // The step belongs to a new run now; the old file is final.
                    self.drain(&mut file, &mut lines).await?;
                    if let Some((number, content)) = lines.flush() {
                        self.emit(TailEvent::Line { number, content }).await?;
                    }
                    tracing::debug!(job_id = self.job_id, step_id = self.step_id, "step re-run, following new log");
                    (path, file) = self.attach().await?;
                    lines = LineBuffer::default();
                }
            }

            tick += 1;
            if tick % heartbeat_every == 0 {
                self.emit(TailEvent::Heartbeat).await?;
            }
        }
    }
}
