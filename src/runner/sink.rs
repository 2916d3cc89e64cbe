//! Log file writer that reaches stable storage after every write.

use std::path::Path;
use std::sync::Arc;

use chrono::Local;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const RULE: &str = "==========================================";

/// What the header of a step log describes.
#[derive(Debug, Clone, Default)]
pub struct LogHeader {
    pub command: String,
    pub workdir: String,
    pub inventory: Option<String>,
    pub extra_vars: String,
}

/// Shared handle to one step's log file.
///
/// stdout and stderr pumps write through clones of the same sink, so their
/// chunks interleave in arrival order.
#[derive(Clone)]
pub struct LogSink {
    file: Arc<Mutex<File>>,
}

fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

impl LogSink {
    /// Create (truncating) the log file and its parent directories.
    pub async fn create(path: &Path) -> std::io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub async fn write(&self, bytes: &[u8]) -> std::io::Result<()> {
        let mut file = self.file.lock().await;
        file.write_all(bytes).await?;
        file.sync_data().await
    }

    pub async fn write_header(&self, header: &LogHeader) -> std::io::Result<()> {
        let mut text = format!("[{}] starting step\n", timestamp());
        text.push_str(&format!("command: {}\n", header.command));
        text.push_str(&format!("workdir: {}\n", header.workdir));
        if let Some(inventory) = &header.inventory {
            text.push_str(&format!("inventory: {inventory}\n"));
        }
        if !header.extra_vars.trim().is_empty() {
            text.push_str(&format!("extra vars: {}\n", header.extra_vars.trim()));
        }
        text.push_str(RULE);
        text.push('\n');
        self.write(text.as_bytes()).await
    }

    /// `error` of `None` means the step succeeded.
    pub async fn write_footer(&self, exit_code: i32, error: Option<&str>) -> std::io::Result<()> {
        let mut text = format!("\n[{}] step finished (exit code {exit_code})\n", timestamp());
        match error {
            Some(err) => text.push_str(&format!("error: {err}\n")),
            None => text.push_str("succeeded\n"),
        }
        self.write(text.as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_header_body_footer_shape() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("1").join("2").join("run").join("site.yml.log");
        let sink = LogSink::create(&path).await.unwrap();
        sink.write_header(&LogHeader {
            command: "ansible-playbook -i hosts site.yml".into(),
            workdir: "/w/1".into(),
            inventory: Some("hosts".into()),
            extra_vars: String::new(),
        })
        .await
        .unwrap();
        sink.write(b"PLAY [all]\n").await.unwrap();
        sink.write_footer(2, Some("exit status 2")).await.unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert!(lines[0].ends_with("starting step"));
        assert_eq!(lines[1], "command: ansible-playbook -i hosts site.yml");
        assert_eq!(lines[3], "inventory: hosts");
        assert_eq!(lines[4], RULE);
        assert_eq!(lines[5], "PLAY [all]");
        assert!(text.ends_with("error: exit status 2\n"));
        assert!(!text.contains("extra vars"));
    }
}
