//! Append-only trade journal (CSV, read by the offline weight optimizer) and
//! a JSON-lines log of admitted signals.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Signal;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub timestamp: DateTime<Utc>,
    pub symbol: String,
    pub side: String,
    pub size: f64,
    pub entry: f64,
    pub exit: f64,
    pub pnl: f64,
    pub exit_reason: String,
    pub strategy: String,
    pub confidence: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct JournalSummary {
    pub trades: u32,
    pub wins: u32,
    pub pnl: f64,
}

#[derive(Clone)]
pub struct TradeJournal {
    path: PathBuf,
}

impl TradeJournal {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TradeJournal { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Header is written only when the file is new or empty.
    pub fn append(&self, record: &TradeRecord) -> Result<(), csv::Error> {
        ensure_parent(&self.path)?;
        let fresh = std::fs::metadata(&self.path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(fresh).from_writer(file);
        writer.serialize(record)?;
        writer.flush()?;
        Ok(())
    }

    /// [`append`](Self::append) on the blocking pool, for async tasks.
    pub async fn record(&self, record: TradeRecord) -> Result<(), csv::Error> {
        let journal = self.clone();
        match tokio::task::spawn_blocking(move || journal.append(&record)).await {
            Ok(result) => result,
            Err(e) => Err(std::io::Error::new(std::io::ErrorKind::Other, e).into()),
        }
    }

    pub fn read_all(&self) -> Result<Vec<TradeRecord>, csv::Error> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let mut reader = csv::Reader::from_path(&self.path)?;
        reader.deserialize().collect()
    }

    /// Closed trades at or after `since`.
    pub fn summary_since(&self, since: DateTime<Utc>) -> Result<JournalSummary, csv::Error> {
        let mut summary = JournalSummary::default();
        for r in self.read_all()?.into_iter().filter(|r| r.timestamp >= since) {
            summary.trades += 1;
            summary.pnl += r.pnl;
            if r.pnl > 0.0 {
                summary.wins += 1;
            }
        }
        Ok(summary)
    }
}

#[derive(Clone)]
pub struct SignalLog {
    path: PathBuf,
}

impl SignalLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        SignalLog { path: path.into() }
    }

    pub fn append(&self, signal: &Signal) -> std::io::Result<()> {
        ensure_parent(&self.path)?;
        let line = serde_json::to_string(signal)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        writeln!(file, "{line}")
    }

    pub async fn record(&self, signal: Signal) -> std::io::Result<()> {
        let log = self.clone();
        tokio::task::spawn_blocking(move || log.append(&signal))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
    }
}

fn ensure_parent(path: &Path) -> std::io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => std::fs::create_dir_all(dir),
        _ => Ok(()),
    }
}
