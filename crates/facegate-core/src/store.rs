//! Enrollment store: a flat CSV table of `Name, Encoding, Timestamp` rows.
//!
//! Loading never fails. A missing or empty file yields no users, and each
//! row that does not parse is skipped with a warning while the rest load.
//! Every mutation rewrites the whole table into a sibling temporary file
//! and renames it over the original, so readers only ever see a complete
//! table.

use crate::types::{format_timestamp, parse_timestamp, Descriptor, UserRecord};
use chrono::NaiveDateTime;
use csv::{ByteRecord, ReaderBuilder, StringRecord, Trim, WriterBuilder};
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const NAME_COLUMN: &str = "Name";
pub const ENCODING_COLUMN: &str = "Encoding";
pub const TIMESTAMP_COLUMN: &str = "Timestamp";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] io::Error),
    #[error("csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("store header is missing one of Name, Encoding, Timestamp: {0}")]
    BadHeader(String),
    #[error("record name is empty")]
    EmptyName,
    #[error("descriptor has {found} dimensions, store holds {expected}")]
    DimensionMismatch { expected: usize, found: usize },
}

/// A row that was dropped during load.
#[derive(Debug, Clone, PartialEq)]
pub struct SkippedRow {
    /// 1-based line number in the file.
    pub line: u64,
    pub name: Option<String>,
    pub reason: String,
}

/// Full result of a load: records in file order plus what was dropped.
#[derive(Debug, Clone, Default)]
pub struct Loaded {
    pub records: Vec<UserRecord>,
    pub skipped: Vec<SkippedRow>,
}

/// Per-name summary for listings.
#[derive(Debug, Clone, PartialEq)]
pub struct EnrolledName {
    pub name: String,
    pub records: usize,
    pub latest: NaiveDateTime,
}

/// Column positions located from the header row.
#[derive(Debug, Clone, Copy)]
struct Columns {
    name: usize,
    encoding: usize,
    timestamp: usize,
}

impl Columns {
    fn locate(headers: &StringRecord) -> Option<Self> {
        let find = |label: &str| headers.iter().position(|h| h == label);
        Some(Self {
            name: find(NAME_COLUMN)?,
            encoding: find(ENCODING_COLUMN)?,
            timestamp: find(TIMESTAMP_COLUMN)?,
        })
    }

    fn canonical() -> (StringRecord, Self) {
        let headers = StringRecord::from(vec![NAME_COLUMN, ENCODING_COLUMN, TIMESTAMP_COLUMN]);
        (
            headers,
            Self {
                name: 0,
                encoding: 1,
                timestamp: 2,
            },
        )
    }

    fn width(&self) -> usize {
        self.name.max(self.encoding).max(self.timestamp) + 1
    }

    fn name_of<'r>(&self, row: &'r ByteRecord) -> Option<&'r [u8]> {
        row.get(self.name)
    }

    /// Build a row for `record` laid out in this header's column order.
    fn encode(&self, record: &UserRecord, header_len: usize) -> ByteRecord {
        let mut fields = vec![String::new(); header_len.max(self.width())];
        fields[self.name] = record.name.clone();
        fields[self.encoding] = record.descriptor.to_json();
        fields[self.timestamp] = format_timestamp(&record.enrolled_at);
        let mut row = ByteRecord::new();
        for field in &fields {
            row.push_field(field.as_bytes());
        }
        row
    }

    fn decode(&self, row: &StringRecord) -> Result<UserRecord, String> {
        let name = row.get(self.name).unwrap_or_default();
        if name.trim().is_empty() {
            return Err("missing name".into());
        }
        let encoding = row.get(self.encoding).unwrap_or_default();
        if encoding.trim().is_empty() {
            return Err("missing face encoding".into());
        }
        let descriptor = Descriptor::from_json(encoding).map_err(|e| e.to_string())?;
        let enrolled_at = row
            .get(self.timestamp)
            .and_then(parse_timestamp)
            .ok_or_else(|| "malformed timestamp".to_string())?;
        Ok(UserRecord::new(name, descriptor, enrolled_at))
    }
}

/// Raw table contents used by mutations. Rows are kept byte-for-byte so a
/// rewrite never alters rows it did not target, malformed ones included.
struct Table {
    headers: StringRecord,
    columns: Columns,
    rows: Vec<ByteRecord>,
}

impl Table {
    /// Dimensionality of the first row that loads as a record, ignoring
    /// `exclude`. Rows skipped on load never fix the dimension.
    fn stored_dim(&self, exclude: Option<&str>) -> Option<usize> {
        self.rows
            .iter()
            .filter(|row| exclude.map_or(true, |n| self.columns.name_of(row) != Some(n.as_bytes())))
            .filter_map(|row| StringRecord::from_byte_record(row.clone()).ok())
            .find_map(|row| self.columns.decode(&row).ok())
            .map(|record| record.descriptor.dim())
    }

    fn check_dim(&self, record: &UserRecord, exclude: Option<&str>) -> Result<(), StoreError> {
        match self.stored_dim(exclude) {
            Some(expected) if expected != record.descriptor.dim() => {
                Err(StoreError::DimensionMismatch {
                    expected,
                    found: record.descriptor.dim(),
                })
            }
            _ => Ok(()),
        }
    }

    fn remove_name(&mut self, name: &str) -> usize {
        let before = self.rows.len();
        let columns = self.columns;
        self.rows
            .retain(|row| columns.name_of(row) != Some(name.as_bytes()));
        before - self.rows.len()
    }

    fn push(&mut self, record: &UserRecord) {
        let row = self.columns.encode(record, self.headers.len());
        self.rows.push(row);
    }
}

/// Handle to the enrollment table on disk. Cheap to clone; holds no
/// in-memory copy of the records.
#[derive(Debug, Clone)]
pub struct EnrollmentStore {
    path: PathBuf,
}

impl EnrollmentStore {
    /// Handle for `path` without touching the filesystem.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Handle for `path`, creating parent directories and a header-only
    /// table if the file does not exist yet.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let store = Self::new(path);
        if let Some(parent) = store.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        if !store.path.exists() {
            let (headers, columns) = Columns::canonical();
            store.write_table(&Table {
                headers,
                columns,
                rows: Vec::new(),
            })?;
            tracing::info!(path = %store.path.display(), "created enrollment store");
        }
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records in file order. See [`load_report`](Self::load_report).
    pub fn load(&self) -> Vec<UserRecord> {
        self.load_report().records
    }

    /// Load every well-formed record, reporting the rows that were dropped.
    ///
    /// The first well-formed row fixes the dimensionality D; later rows of a
    /// different length are dropped.
    pub fn load_report(&self) -> Loaded {
        let mut loaded = Loaded::default();

        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                tracing::warn!(
                    path = %self.path.display(),
                    "enrollment store not found; no users to recognize, register one first"
                );
                return loaded;
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "cannot open enrollment store");
                return loaded;
            }
        };

        let mut reader = ReaderBuilder::new()
            .flexible(true)
            .trim(Trim::Headers)
            .from_reader(file);

        let headers = match reader.headers() {
            Ok(headers) => headers.clone(),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "unreadable enrollment store header");
                return loaded;
            }
        };
        if headers.is_empty() {
            tracing::warn!(path = %self.path.display(), "enrollment store is empty; no users to recognize");
            return loaded;
        }
        let Some(columns) = Columns::locate(&headers) else {
            tracing::warn!(
                path = %self.path.display(),
                header = ?headers,
                "enrollment store header lacks Name, Encoding or Timestamp; no users loaded"
            );
            return loaded;
        };

        let mut dim: Option<usize> = None;
        let mut raw = StringRecord::new();
        let mut line = 1u64;

        loop {
            match reader.read_record(&mut raw) {
                Ok(true) => {}
                Ok(false) => break,
                Err(e) => {
                    line = e.position().map_or(line + 1, |p| p.line());
                    let fatal = matches!(e.kind(), csv::ErrorKind::Io(_));
                    tracing::warn!(line, error = %e, "skipping unreadable enrollment row");
                    loaded.skipped.push(SkippedRow {
                        line,
                        name: None,
                        reason: e.to_string(),
                    });
                    if fatal {
                        break;
                    }
                    continue;
                }
            }
            line = raw.position().map_or(line + 1, |p| p.line());

            let decoded = columns.decode(&raw).and_then(|record| match dim {
                Some(expected) if expected != record.descriptor.dim() => Err(format!(
                    "descriptor has {} dimensions, expected {expected}",
                    record.descriptor.dim()
                )),
                _ => Ok(record),
            });

            match decoded {
                Ok(record) => {
                    dim.get_or_insert(record.descriptor.dim());
                    loaded.records.push(record);
                }
                Err(reason) => {
                    let name = raw.get(columns.name).map(str::to_string);
                    tracing::warn!(
                        line,
                        name = name.as_deref().unwrap_or(""),
                        reason = %reason,
                        "skipping enrollment row with invalid face encoding"
                    );
                    loaded.skipped.push(SkippedRow { line, name, reason });
                }
            }
        }

        if loaded.records.is_empty() && loaded.skipped.is_empty() {
            tracing::warn!(path = %self.path.display(), "enrollment store is empty; no users to recognize");
        }
        tracing::debug!(
            path = %self.path.display(),
            count = loaded.records.len(),
            skipped = loaded.skipped.len(),
            "enrollment store loaded"
        );
        loaded
    }

    /// True if at least one well-formed record has exactly this name.
    pub fn exists(&self, name: &str) -> bool {
        self.load().iter().any(|r| r.name == name)
    }

    /// Distinct names in first-seen order with record counts.
    pub fn names(&self) -> Vec<EnrolledName> {
        let mut names: Vec<EnrolledName> = Vec::new();
        for record in self.load() {
            match names.iter_mut().find(|n| n.name == record.name) {
                Some(entry) => {
                    entry.records += 1;
                    entry.latest = entry.latest.max(record.enrolled_at);
                }
                None => names.push(EnrolledName {
                    name: record.name,
                    records: 1,
                    latest: record.enrolled_at,
                }),
            }
        }
        names
    }

    /// Add one record after the existing rows.
    pub fn append(&self, record: &UserRecord) -> Result<(), StoreError> {
        validate(record)?;
        let mut table = self.read_table()?;
        table.check_dim(record, None)?;
        table.push(record);
        self.write_table(&table)?;
        tracing::info!(name = %record.name, rows = table.rows.len(), "enrollment record appended");
        Ok(())
    }

    /// Delete every row whose name matches exactly (case-sensitive).
    pub fn remove_by_name(&self, name: &str) -> Result<usize, StoreError> {
        let mut table = self.read_table()?;
        let removed = table.remove_name(name);
        if removed > 0 {
            self.write_table(&table)?;
        }
        tracing::info!(name, removed, "enrollment records removed");
        Ok(removed)
    }

    /// Remove all rows for `record.name` and append `record`, in a single
    /// rewrite. Returns how many rows were removed.
    pub fn replace_by_name(&self, record: &UserRecord) -> Result<usize, StoreError> {
        validate(record)?;
        let mut table = self.read_table()?;
        table.check_dim(record, Some(&record.name))?;
        let removed = table.remove_name(&record.name);
        table.push(record);
        self.write_table(&table)?;
        tracing::info!(name = %record.name, removed, "enrollment record replaced");
        Ok(removed)
    }

    fn read_table(&self) -> Result<Table, StoreError> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(empty_table()),
            Err(e) => return Err(e.into()),
        };

        let mut reader = ReaderBuilder::new()
            .flexible(true)
            .trim(Trim::Headers)
            .from_reader(file);
        let headers = reader.headers()?.clone();
        if headers.is_empty() {
            return Ok(empty_table());
        }
        let columns = Columns::locate(&headers)
            .ok_or_else(|| StoreError::BadHeader(headers.iter().collect::<Vec<_>>().join(",")))?;

        let rows = reader
            .byte_records()
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Table {
            headers,
            columns,
            rows,
        })
    }

    fn write_table(&self, table: &Table) -> Result<(), StoreError> {
        let tmp = temp_path(&self.path);
        let result = write_rows(&tmp, table).and_then(|()| fs::rename(&tmp, &self.path).map_err(StoreError::from));
        if result.is_err() {
            let _ = fs::remove_file(&tmp);
        }
        result
    }
}

fn validate(record: &UserRecord) -> Result<(), StoreError> {
    if record.name.trim().is_empty() {
        return Err(StoreError::EmptyName);
    }
    Ok(())
}

fn empty_table() -> Table {
    let (headers, columns) = Columns::canonical();
    Table {
        headers,
        columns,
        rows: Vec::new(),
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_rows(path: &Path, table: &Table) -> Result<(), StoreError> {
    let file = File::create(path)?;
    let mut writer = WriterBuilder::new().flexible(true).from_writer(file);
    writer.write_record(&table.headers)?;
    for row in &table.rows {
        writer.write_byte_record(row)?;
    }
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| StoreError::Io(e.into_error()))?;
    file.sync_all()?;
    Ok(())
}
