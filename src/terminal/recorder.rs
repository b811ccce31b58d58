//! Terminal session recorder (asciicast v2).
//!
//! One JSON header line with the terminal geometry, then one
//! `[elapsed_seconds, "o", data]` event line per flushed chunk. The artifact
//! lands at `<recording root>/<session id>/recording.cast` and plays back in
//! any asciinema-compatible player.

use std::path::{Path, PathBuf};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde_json::json;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

pub const RECORDING_FILE: &str = "recording.cast";

pub struct Recorder {
    // None once closed; writes after close are dropped.
    file: Mutex<Option<fs::File>>,
    path: PathBuf,
    start: Instant,
}

impl Recorder {
    /// Create `<root>/<session id>/recording.cast` and write the header.
    pub async fn create(
        root: &Path,
        session_id: &str,
        cols: u32,
        rows: u32,
    ) -> std::io::Result<Self> {
        let dir = root.join(session_id);
        fs::create_dir_all(&dir).await?;
        let path = dir.join(RECORDING_FILE);
        let mut file = fs::File::create(&path).await?;

        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        let header = json!({
            "version": 2,
            "width": cols,
            "height": rows,
            "timestamp": timestamp,
            "env": {"TERM": "xterm-256color"},
        });
        file.write_all(format!("{header}\n").as_bytes()).await?;

        Ok(Self {
            file: Mutex::new(Some(file)),
            path,
            start: Instant::now(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one output event. Recording failures never disturb the live
    /// session; they are logged and the chunk is dropped.
    pub async fn write(&self, data: &str) {
        let mut guard = self.file.lock().await;
        let Some(file) = guard.as_mut() else { return };
        let elapsed = self.start.elapsed().as_secs_f64();
        let event = json!([elapsed, "o", data]);
        if let Err(err) = file.write_all(format!("{event}\n").as_bytes()).await {
            tracing::warn!(path = %self.path.display(), error = %err, "recording write failed");
        }
    }

    /// Flush and drop the file. Safe to call more than once.
    pub async fn close(&self) {
        let mut guard = self.file.lock().await;
        if let Some(mut file) = guard.take() {
            if let Err(err) = file.flush().await {
                tracing::warn!(path = %self.path.display(), error = %err, "recording flush failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_header_and_events() {
        let dir = std::env::temp_dir().join(format!("qg-rec-{}", uuid::Uuid::new_v4()));
        let rec = Recorder::create(&dir, "ssh_1", 80, 24).await.unwrap();
        rec.write("hello ").await;
        rec.write("world\r\n").await;
        rec.close().await;

        let content = tokio::fs::read_to_string(rec.path()).await.unwrap();
        let mut lines = content.lines();
        let header: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(header["version"], 2);
        assert_eq!(header["width"], 80);
        assert_eq!(header["height"], 24);

        let event: serde_json::Value = serde_json::from_str(lines.next().unwrap()).unwrap();
        assert_eq!(event[1], "o");
        assert_eq!(event[2], "hello ");
        assert_eq!(lines.count(), 1);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_writes() {
        let dir = std::env::temp_dir().join(format!("qg-rec-{}", uuid::Uuid::new_v4()));
        let rec = Recorder::create(&dir, "ssh_2", 80, 24).await.unwrap();
        rec.close().await;
        rec.close().await;
        rec.write("after close").await;

        let content = tokio::fs::read_to_string(rec.path()).await.unwrap();
        assert_eq!(content.lines().count(), 1, "only the header survives");
        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
