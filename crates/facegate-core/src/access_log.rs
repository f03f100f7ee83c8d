//! Append-only access log: `Name, Timestamp, Status` rows.

use crate::types::{format_timestamp, parse_timestamp, AccessAttempt, AccessStatus};
use csv::{ReaderBuilder, StringRecord, Trim, WriterBuilder};
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

const HEADER: [&str; 3] = ["Name", "Timestamp", "Status"];

#[derive(Error, Debug)]
pub enum AccessLogError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
}

#[derive(Debug, Clone)]
pub struct AccessLog {
    path: PathBuf,
}

impl AccessLog {
    /// Handle to an existing log; nothing is created.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Open the log at `path`, writing the header row if the file is new.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, AccessLogError> {
        let log = Self { path: path.into() };
        if let Some(parent) = log.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let is_empty = match fs::metadata(&log.path) {
            Ok(meta) => meta.len() == 0,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => return Err(e.into()),
        };
        if is_empty {
            log.append_row(HEADER)?;
        }
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one attempt; the row is on disk when this returns.
    pub fn record(&self, attempt: &AccessAttempt) -> Result<(), AccessLogError> {
        let timestamp = format_timestamp(&attempt.timestamp);
        let status = attempt.status.to_string();
        self.append_row([attempt.observed_name.as_str(), timestamp.as_str(), status.as_str()])?;
        tracing::info!(
            name = %attempt.observed_name,
            timestamp = %timestamp,
            status = %status,
            "access attempt"
        );
        Ok(())
    }

    /// Every readable attempt in file order. Malformed rows are skipped.
    pub fn read_all(&self) -> Result<Vec<AccessAttempt>, AccessLogError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut reader = ReaderBuilder::new()
            .flexible(true)
            .trim(Trim::All)
            .from_reader(file);

        let mut attempts = Vec::new();
        for result in reader.records() {
            let row = match result {
                Ok(row) => row,
                Err(e) => {
                    tracing::warn!(error = %e, "skipping unreadable access log row");
                    continue;
                }
            };
            match parse_row(&row) {
                Some(attempt) => attempts.push(attempt),
                None => tracing::warn!(row = ?row, "skipping malformed access log row"),
            }
        }
        Ok(attempts)
    }

    /// The last `n` attempts.
    pub fn tail(&self, n: usize) -> Result<Vec<AccessAttempt>, AccessLogError> {
        let mut all = self.read_all()?;
        let start = all.len().saturating_sub(n);
        Ok(all.split_off(start))
    }

    fn append_row(&self, fields: [&str; 3]) -> Result<(), AccessLogError> {
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        let mut writer = WriterBuilder::new().has_headers(false).from_writer(file);
        writer.write_record(fields)?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| AccessLogError::Io(e.into_error()))?;
        file.sync_data()?;
        Ok(())
    }
}

fn parse_row(row: &StringRecord) -> Option<AccessAttempt> {
    let name = row.get(0)?;
    let timestamp = parse_timestamp(row.get(1)?)?;
    let status: AccessStatus = row.get(2)?.parse().ok()?;
    Some(AccessAttempt {
        observed_name: name.to_string(),
        timestamp,
        status,
    })
}
