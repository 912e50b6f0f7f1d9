//! Console flow writer.

use std::io::{self, Write};

use crate::error::WriteError;
use crate::flow::FlowSnapshot;
use crate::writer::FlowWriter;

/// Writes rendered snapshots in a human-readable format.
pub struct ConsoleWriter {
    out: Box<dyn Write + Send>,
    /// Whether to print snapshots that hold no flows
    show_empty: bool,
}

impl ConsoleWriter {
    /// Create a writer on stdout.
    pub fn new() -> Self {
        Self {
            out: Box::new(io::stdout()),
            show_empty: true,
        }
    }

    /// Write to another destination.
    pub fn with_output(mut self, out: impl Write + Send + 'static) -> Self {
        self.out = Box::new(out);
        self
    }

    /// Enable or disable output for empty snapshots.
    pub fn with_show_empty(mut self, show_empty: bool) -> Self {
        self.show_empty = show_empty;
        self
    }

    fn format_snapshot(&self, snapshot: &FlowSnapshot) -> String {
        let kind = if snapshot.is_final() { "final" } else { "interval" };
        let mut output = format!(
            "[{} @ {}] {} interface(s), {} flow(s)\n",
            kind,
            snapshot.unix_timestamp(),
            snapshot.interface_count(),
            snapshot.flow_count()
        );
        output.push_str(&snapshot.render());
        output
    }
}

impl Default for ConsoleWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl FlowWriter for ConsoleWriter {
    fn write(&mut self, snapshot: &FlowSnapshot) -> Result<(), WriteError> {
        if snapshot.is_empty() && !self.show_empty {
            return Ok(());
        }
        let output = self.format_snapshot(snapshot);
        self.out.write_all(output.as_bytes())?;
        self.out.flush()?;
        Ok(())
    }
}
