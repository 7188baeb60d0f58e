//! Lot summary persistence.
//!
//! The summary file name is fixed when the writer is created, so every flush
//! rewrites the same file with the full log. Writes are serialized, and a
//! snapshot shorter than the one already on disk is skipped: the log is
//! append-only, so a shorter snapshot is an older one.

use crate::storage::SummaryEntry;
use chrono::{DateTime, TimeZone};
use std::fmt::Display;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

const HEADER: &str = "SiteNo,Barcode,Bin";

/// Writes summary snapshots as CSV
#[derive(Debug)]
pub struct SummaryWriter {
    path: PathBuf,
    /// Entry count of the last snapshot written
    written: Mutex<Option<usize>>,
}

impl SummaryWriter {
    /// Target `<dir>/<lot>_<YYYYmmdd_HHMMSS>_summary.csv`
    pub fn new<Tz>(dir: &Path, lot_id: &str, started: DateTime<Tz>) -> Self
    where
        Tz: TimeZone,
        Tz::Offset: Display,
    {
        let stamp = started.format("%Y%m%d_%H%M%S");
        SummaryWriter {
            path: dir.join(format!("{lot_id}_{stamp}_summary.csv")),
            written: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace the summary file with `entries`.
    ///
    /// Returns `false` when a longer snapshot is already on disk.
    pub fn write(&self, entries: &[SummaryEntry]) -> io::Result<bool> {
        let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        if (*written).is_some_and(|count| entries.len() < count) {
            debug!(entries = entries.len(), "Skipping stale summary snapshot");
            return Ok(false);
        }

        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }

        let mut out = io::BufWriter::new(fs::File::create(&self.path)?);
        writeln!(out, "{HEADER}")?;
        for entry in entries {
            writeln!(out, "{},{},{}", entry.site, entry.barcode, entry.bin)?;
        }
        out.flush()?;

        *written = Some(entries.len());
        info!(path = %self.path.display(), entries = entries.len(), "Summary written");
        Ok(true)
    }
}
