//! Ledger reader and writer
//!
//! The ledger is a UTF-8, delimiter-separated file with a fixed header. Reads
//! validate the header and every row's field count; writes go to a temporary
//! sibling file which is renamed over the ledger only once fully persisted.

use crate::error::{Error, Result};
use crate::row::Row;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Header used by the broker's Italian-locale transaction export
pub const DEFAULT_HEADER: [&str; 8] = [
    "Data",
    "Tipo",
    "Valore",
    "Note",
    "ISIN",
    "Azioni",
    "Commissioni",
    "Tasse",
];

/// Default field delimiter
pub const DEFAULT_DELIMITER: u8 = b';';

/// Record terminator used when writing the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    /// `\n`
    Lf,
    /// `\r\n`, what the original exporter tooling writes
    #[default]
    Crlf,
}

impl LineEnding {
    /// Detect the terminator of the first line, if there is one
    pub fn detect(bytes: &[u8]) -> Option<Self> {
        let newline = bytes.iter().position(|&b| b == b'\n')?;
        if newline > 0 && bytes[newline - 1] == b'\r' {
            Some(LineEnding::Crlf)
        } else {
            Some(LineEnding::Lf)
        }
    }

    fn terminator(self) -> csv::Terminator {
        match self {
            LineEnding::Lf => csv::Terminator::Any(b'\n'),
            LineEnding::Crlf => csv::Terminator::CRLF,
        }
    }
}

/// On-disk format shared by the ledger and the raw export
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerFormat {
    /// Expected header row
    pub header: Row,
    /// Field delimiter
    pub delimiter: u8,
    /// Terminator for newly created ledgers
    pub line_ending: LineEnding,
}

impl LedgerFormat {
    /// Create a format with the default delimiter and line ending
    pub fn new(header: Row) -> Self {
        Self {
            header,
            delimiter: DEFAULT_DELIMITER,
            line_ending: LineEnding::default(),
        }
    }

    /// Set the field delimiter
    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Set the line ending used for new ledgers
    pub fn with_line_ending(mut self, line_ending: LineEnding) -> Self {
        self.line_ending = line_ending;
        self
    }

    /// Number of fields every row must have
    pub fn field_count(&self) -> usize {
        self.header.len()
    }

    /// Header rendered with the delimiter, for messages
    pub fn header_line(&self) -> String {
        self.header.joined(self.delimiter as char)
    }

    pub(crate) fn reader_builder(&self) -> csv::ReaderBuilder {
        let mut builder = csv::ReaderBuilder::new();
        builder
            .has_headers(false)
            .delimiter(self.delimiter)
            // Field counts are checked per record so the error can name the line
            .flexible(true);
        builder
    }
}

impl Default for LedgerFormat {
    fn default() -> Self {
        Self::new(Row::new(DEFAULT_HEADER))
    }
}

/// The persistent, append-only transaction ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ledger {
    header: Row,
    rows: Vec<Row>,
    line_ending: LineEnding,
}

impl Ledger {
    /// Create an empty (header-only) ledger
    pub fn new(header: Row, line_ending: LineEnding) -> Self {
        Self {
            header,
            rows: Vec::new(),
            line_ending,
        }
    }

    /// Create a ledger with existing rows
    pub fn with_rows(header: Row, rows: Vec<Row>, line_ending: LineEnding) -> Self {
        Self {
            header,
            rows,
            line_ending,
        }
    }

    /// Header row
    pub fn header(&self) -> &Row {
        &self.header
    }

    /// Rows in insertion order
    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    /// Get the number of rows (header excluded)
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Check if the ledger has no rows
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Line ending used when this ledger is written
    pub fn line_ending(&self) -> LineEnding {
        self.line_ending
    }

    /// Append rows after the existing ones. Existing rows are never touched.
    pub fn append(&mut self, rows: impl IntoIterator<Item = Row>) {
        self.rows.extend(rows);
    }
}

/// Read the raw ledger bytes, distinguishing a missing file
pub fn read_ledger_bytes<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let path = path.as_ref();
    fs::read(path).map_err(|e| {
        if e.kind() == io::ErrorKind::NotFound {
            Error::LedgerNotFound(path.to_path_buf())
        } else {
            Error::FileRead {
                path: path.to_path_buf(),
                source: e,
            }
        }
    })
}

/// Load a ledger from disk
pub fn read_ledger<P: AsRef<Path>>(path: P, format: &LedgerFormat) -> Result<Ledger> {
    let path = path.as_ref();
    let bytes = read_ledger_bytes(path)?;
    parse_ledger(&bytes, path, format)
}

/// Parse ledger bytes. `source` is only used in error messages.
pub fn parse_ledger(bytes: &[u8], source: &Path, format: &LedgerFormat) -> Result<Ledger> {
    let line_ending = LineEnding::detect(bytes).unwrap_or(format.line_ending);
    let mut csv_reader = format.reader_builder().from_reader(bytes);
    let mut records = csv_reader.byte_records();

    let header = match records.next() {
        Some(result) => result.map_err(|e| Error::Csv {
            path: source.to_path_buf(),
            source: e,
        })?,
        None => {
            log::warn!(
                "ledger '{}' is empty, treating it as a header-only ledger",
                source.display()
            );
            return Ok(Ledger::new(format.header.clone(), format.line_ending));
        }
    };

    let header = decode_record(header, source)?;
    if header != format.header {
        return Err(Error::HeaderMismatch {
            path: source.to_path_buf(),
            expected: format.header_line(),
            found: header.joined(format.delimiter as char),
        });
    }

    let mut rows = Vec::new();
    for result in records {
        let record = result.map_err(|e| Error::Csv {
            path: source.to_path_buf(),
            source: e,
        })?;

        if record.len() != format.field_count() {
            return Err(Error::MalformedLedgerRow {
                path: source.to_path_buf(),
                line: record_line(&record),
                expected: format.field_count(),
                found: record.len(),
            });
        }

        rows.push(decode_record(record, source)?);
    }

    log::debug!("loaded {} rows from '{}'", rows.len(), source.display());

    Ok(Ledger::with_rows(header, rows, line_ending))
}

fn record_line(record: &csv::ByteRecord) -> u64 {
    record.position().map(|p| p.line()).unwrap_or_default()
}

fn decode_record(record: csv::ByteRecord, source: &Path) -> Result<Row> {
    let line = record_line(&record);
    csv::StringRecord::from_byte_record(record)
        .map(Row::from)
        .map_err(|_| Error::InvalidUtf8 {
            path: source.to_path_buf(),
            line,
        })
}

/// Serialize a ledger to bytes: header first, then rows in order.
///
/// `path` is the file the bytes are destined for and is only used in errors.
pub fn serialize_ledger(ledger: &Ledger, delimiter: u8, path: &Path) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(delimiter)
        .terminator(ledger.line_ending().terminator())
        .from_writer(Vec::new());

    writer
        .write_record(ledger.header().fields())
        .map_err(|e| write_error(path, e))?;
    for row in ledger.rows() {
        writer
            .write_record(row.fields())
            .map_err(|e| write_error(path, e))?;
    }

    writer.into_inner().map_err(|e| Error::FileWrite {
        path: path.to_path_buf(),
        source: e.into_error(),
    })
}

fn write_error(path: &Path, e: csv::Error) -> Error {
    Error::FileWrite {
        path: path.to_path_buf(),
        source: io::Error::from(e),
    }
}

/// Persist a ledger atomically
pub fn write_ledger<P: AsRef<Path>>(path: P, ledger: &Ledger, format: &LedgerFormat) -> Result<()> {
    let path = path.as_ref();
    let bytes = serialize_ledger(ledger, format.delimiter, path)?;
    write_atomic(path, &bytes)?;
    log::info!(
        "wrote {} rows to '{}'",
        ledger.len(),
        path.display()
    );
    Ok(())
}

/// Write `contents` to a temporary sibling of `path` and rename it into place.
///
/// On failure the previous file at `path` is left untouched and the temporary
/// file is removed.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let file_write_err = |source| Error::FileWrite {
        path: path.to_path_buf(),
        source,
    };

    let tmp = temp_path_for(path).map_err(file_write_err)?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(file_write_err)?;
    }

    if let Err(e) = write_then_rename(&tmp, path, contents) {
        let _ = fs::remove_file(&tmp);
        return Err(file_write_err(e));
    }

    Ok(())
}

fn write_then_rename(tmp: &Path, path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = File::create(tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);
    fs::rename(tmp, path)
}

fn temp_path_for(path: &Path) -> io::Result<PathBuf> {
    let file_name = path.file_name().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "path has no file name")
    })?;
    Ok(path.with_file_name(format!(".{}.tmp", file_name.to_string_lossy())))
}
