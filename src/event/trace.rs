//! NDJSON Trace Sink
//!
//! A plugin that persists the event stream as newline-delimited JSON, one
//! record per line. This is the append-only record stream for task history
//! when a persistent trace is wanted.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use crate::error::Result;

use super::bus::{Event, Plugin};

/// Plugin id the engine and CLI use to attach the sink
pub const TRACE_PLUGIN_ID: &str = "trace";

/// NDJSON-writing event sink
pub struct TraceSink {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl TraceSink {
    /// Create a sink writing to `path`, creating parent directories.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;

        tracing::info!(path = %path.display(), "created trace file");

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Plugin for TraceSink {
    fn id(&self) -> &str {
        TRACE_PLUGIN_ID
    }

    fn on_event(&self, event: &Event) -> std::result::Result<(), String> {
        let json = serde_json::to_string(event).map_err(|e| e.to_string())?;
        let mut writer = self.writer.lock();
        writeln!(writer, "{json}").map_err(|e| e.to_string())?;
        writer.flush().map_err(|e| e.to_string())?;
        Ok(())
    }
}
