//! Step Runner: one external process, output captured into a synced log file.

pub mod command;
pub mod sink;

pub use self::command::StepCommand;
pub use self::sink::{LogHeader, LogSink};

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio::process::Command;
use tokio_util::codec::{BytesCodec, FramedRead};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// How long output pumps may keep reading after the child is gone.
/// Grandchildren can hold the pipes open past the parent's exit.
const PUMP_DRAIN: Duration = Duration::from_secs(2);

pub const CANCELLED: &str = "cancelled";

/// Result of one step execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    /// Process exit code, or -1 when it never started or died by signal.
    pub exit_code: i32,
    pub error: Option<String>,
}

impl StepOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && self.error.is_none()
    }

    fn failed(exit_code: i32, error: impl Into<String>) -> Self {
        Self {
            exit_code,
            error: Some(error.into()),
        }
    }
}

async fn pump<R>(reader: Option<R>, sink: LogSink)
where
    R: AsyncRead + Unpin,
{
    let Some(reader) = reader else { return };
    let mut frames = FramedRead::new(reader, BytesCodec::new());
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(chunk) => {
                if let Err(e) = sink.write(&chunk).await {
                    tracing::warn!(error = %e, "failed to write step output");
                    return;
                }
            }
            Err(e) => {
                tracing::debug!(error = %e, "step output stream closed");
                return;
            }
        }
    }
}

/// Run `command` to completion, writing everything it prints to `log_path`.
///
/// Only failing to create the log file is an `Err`; launch failures and
/// non-zero exits are reported through [`StepOutcome`] and the log footer.
pub async fn run_step(
    command: &StepCommand,
    log_path: &Path,
    header: &LogHeader,
    cancel: CancellationToken,
) -> Result<StepOutcome> {
    let sink = LogSink::create(log_path).await?;
    sink.write_header(header).await?;

    tracing::debug!(program = %command.program, args = ?command.args, "launching step process");

    let spawned = Command::new(&command.program)
        .args(&command.args)
        .current_dir(&command.workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn();

    let mut child = match spawned {
        Ok(child) => child,
        Err(e) => {
            let outcome = StepOutcome::failed(-1, format!("failed to launch {}: {e}", command.program));
            sink.write_footer(outcome.exit_code, outcome.error.as_deref()).await?;
            return Ok(outcome);
        }
    };

    let stdout = tokio::spawn(pump(child.stdout.take(), sink.clone()));
    let stderr = tokio::spawn(pump(child.stderr.take(), sink.clone()));

    let outcome = tokio::select! {
        status = child.wait() => match status {
            Ok(status) => match status.code() {
                Some(0) => StepOutcome { exit_code: 0, error: None },
                Some(code) => StepOutcome::failed(code, format!("exit status {code}")),
                None => StepOutcome::failed(-1, "terminated by signal"),
            },
            Err(e) => StepOutcome::failed(-1, format!("failed to wait for process: {e}")),
        },
        _ = cancel.cancelled() => {
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "failed to kill cancelled step");
            }
            StepOutcome::failed(-1, CANCELLED)
        }
    };

    for handle in [stdout, stderr] {
        let abort = handle.abort_handle();
        if tokio::time::timeout(PUMP_DRAIN, handle).await.is_err() {
            abort.abort();
        }
    }

    sink.write_footer(outcome.exit_code, outcome.error.as_deref()).await?;
    Ok(outcome)
}
