//! JSON lines flow writer.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::info;

use crate::error::WriteError;
use crate::flow::{FlowRecord, FlowSnapshot};
use crate::writer::FlowWriter;

/// One line of output.
#[derive(Serialize)]
struct SnapshotLine {
    timestamp: u64,
    #[serde(rename = "final")]
    is_final: bool,
    flows: Vec<FlowRecord>,
}

/// Appends one JSON object per snapshot to a file.
pub struct JsonLinesWriter {
    path: PathBuf,
    file: BufWriter<File>,
}

impl JsonLinesWriter {
    /// Open `path` for appending, creating it if needed.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WriteError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!("Writing flow snapshots to {}", path.display());
        Ok(Self {
            path,
            file: BufWriter::new(file),
        })
    }
}

impl FlowWriter for JsonLinesWriter {
    fn write(&mut self, snapshot: &FlowSnapshot) -> Result<(), WriteError> {
        let line = SnapshotLine {
            timestamp: snapshot.unix_timestamp(),
            is_final: snapshot.is_final(),
            flows: snapshot.records(),
        };
        serde_json::to_writer(&mut self.file, &line)?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        Ok(())
    }

    fn on_stop(&mut self) {
        if let Err(e) = self.file.flush() {
            tracing::warn!("Failed to flush {}: {}", self.path.display(), e);
        }
    }
}
