//! Output sink boundary
//!
//! Mixed frames leave the engine as an unframed little-endian PCM byte
//! stream. The production sink appends to a file; tests substitute fakes.

use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Sink is closed")]
    Closed,
}

/// Append-only destination for mixed frames
pub trait OutputSink: Send + Sync {
    /// Append one mixed frame
    fn write(&self, frame: &[u8]) -> Result<(), SinkError>;
    /// Flush and release the destination. The session controller calls
    /// this exactly once, after the mixer has stopped; calling it again
    /// is a no-op.
    fn close(&self) -> Result<(), SinkError>;
}

/// Raw PCM file sink
pub struct FileSink {
    writer: Mutex<Option<BufWriter<File>>>,
    bytes_written: AtomicU64,
    path: PathBuf,
}

impl FileSink {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self, SinkError> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            writer: Mutex::new(Some(BufWriter::new(file))),
            bytes_written: AtomicU64::new(0),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }
}

impl OutputSink for FileSink {
    fn write(&self, frame: &[u8]) -> Result<(), SinkError> {
        let mut writer = self.writer.lock();
        let writer = writer.as_mut().ok_or(SinkError::Closed)?;
        writer.write_all(frame)?;
        self.bytes_written
            .fetch_add(frame.len() as u64, Ordering::Relaxed);
        Ok(())
    }

    fn close(&self) -> Result<(), SinkError> {
        let Some(mut writer) = self.writer.lock().take() else {
            return Ok(());
        };
        writer.flush()?;
        writer.get_ref().sync_all()?;
        info!(
            "Closed recording file {:?} ({} bytes)",
            self.path,
            self.bytes_written()
        );
        Ok(())
    }
}
