//! Transcript logger - persists outbound events to a JSONL file
//!
//! When enabled, the connection writer hands every event it sends to the
//! logger, which appends it with a timestamp to
//! `<data_local_dir>/deskconnector/transcripts/<session-id>.jsonl`.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::debug;

use super::types::{OutboundEvent, TranscriptEntry};

/// Appends outbound events to a session transcript
pub struct TranscriptLogger {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl TranscriptLogger {
    /// Open (or create) `<dir>/<session_id>.jsonl`
    pub fn new(dir: impl AsRef<Path>, session_id: &str) -> eyre::Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.jsonl", session_id));
        debug!(?path, "TranscriptLogger::new: opening transcript");

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    /// Open a transcript under the default data directory
    pub fn with_default_path(session_id: &str) -> eyre::Result<Self> {
        let data_dir = dirs::data_local_dir().ok_or_else(|| eyre::eyre!("Could not determine data directory"))?;
        Self::new(data_dir.join("deskconnector").join("transcripts"), session_id)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one event as a JSON line
    pub fn write_event(&mut self, event: &OutboundEvent) -> eyre::Result<()> {
        debug!(event_type = event.event_type(), "TranscriptLogger::write_event");
        let entry = TranscriptEntry::new(event.clone());
        let json = serde_json::to_string(&entry)?;
        writeln!(self.writer, "{}", json)?;
        self.writer.flush()?;
        Ok(())
    }
}
