//! Error-tolerant parsing of the raw transaction export
//!
//! A malformed record (wrong field count, invalid UTF-8, blank line) is
//! logged with its line number and excluded; the rest of the batch is kept.

use crate::error::{Error, Result};
use crate::ledger::LedgerFormat;
use crate::row::Row;
use std::fmt;

/// Maximum number of skipped records kept verbatim for diagnostics
pub const MAX_SKIPPED_SAMPLES: usize = 20;

/// Why an export record was excluded
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The record does not have one field per header column
    FieldCount { expected: usize, found: usize },
    /// The record is not valid UTF-8
    InvalidUtf8,
    /// Every field is empty
    Blank,
    /// The CSV reader could not read the record
    Unreadable(String),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::FieldCount { expected, found } => {
                write!(f, "expected {} fields, found {}", expected, found)
            }
            SkipReason::InvalidUtf8 => write!(f, "invalid UTF-8"),
            SkipReason::Blank => write!(f, "blank record"),
            SkipReason::Unreadable(msg) => write!(f, "unreadable record: {}", msg),
        }
    }
}

/// A record excluded from the batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedRecord {
    /// 1-based line number in the export
    pub line: u64,
    /// Raw text of the record (lossily decoded)
    pub raw: String,
    /// Why it was skipped
    pub reason: SkipReason,
}

/// One run's parsed export, prior to merge
#[derive(Debug, Clone, Default)]
pub struct ExportBatch {
    /// Usable rows in export order
    pub rows: Vec<Row>,
    /// Number of data records seen (header excluded)
    pub total_records: usize,
    /// Number of records excluded
    pub skipped_count: usize,
    /// The first excluded records, up to [`MAX_SKIPPED_SAMPLES`]
    pub skipped_samples: Vec<SkippedRecord>,
}

impl ExportBatch {
    /// Number of usable rows
    pub fn usable_count(&self) -> usize {
        self.rows.len()
    }

    fn skip(&mut self, record: SkippedRecord) {
        log::warn!(
            "skipping malformed export record at line {} ({}): {}",
            record.line,
            record.reason,
            record.raw
        );
        self.skipped_count += 1;
        if self.skipped_samples.len() < MAX_SKIPPED_SAMPLES {
            self.skipped_samples.push(record);
        }
    }
}

/// Parse a raw export into an [`ExportBatch`].
///
/// The export must start with the expected header. A header-only export is a
/// valid empty batch; an export with records but none usable is an error.
pub fn ingest_export(raw: &[u8], format: &LedgerFormat) -> Result<ExportBatch> {
    let mut csv_reader = format.reader_builder().from_reader(raw);
    let mut record = csv::ByteRecord::new();

    let has_header = csv_reader
        .read_byte_record(&mut record)
        .map_err(|e| Error::ExportHeaderMismatch {
            expected: format.header_line(),
            found: format!("<unreadable: {}>", e),
        })?;
    if !has_header {
        return Err(Error::EmptyExport);
    }

    let header = Row::new(record.iter().map(|f| String::from_utf8_lossy(f).into_owned()));
    if header != format.header {
        return Err(Error::ExportHeaderMismatch {
            expected: format.header_line(),
            found: header.joined(format.delimiter as char),
        });
    }

    let mut batch = ExportBatch::default();

    loop {
        let start = csv_reader.position().byte() as usize;
        let read = csv_reader.read_byte_record(&mut record);
        let end = csv_reader.position().byte() as usize;

        match read {
            Ok(false) => break,
            Ok(true) => {}
            Err(e) => {
                batch.total_records += 1;
                batch.skip(SkippedRecord {
                    line: e.position().map(|p| p.line()).unwrap_or_default(),
                    raw: raw_text(raw, start, end),
                    reason: SkipReason::Unreadable(e.to_string()),
                });
                if end <= start {
                    // The reader made no progress, nothing more can be read
                    break;
                }
                continue;
            }
        }

        batch.total_records += 1;
        let line = record.position().map(|p| p.line()).unwrap_or_default();

        let reason = if record.iter().all(|f| f.is_empty()) {
            Some(SkipReason::Blank)
        } else if record.len() != format.field_count() {
            Some(SkipReason::FieldCount {
                expected: format.field_count(),
                found: record.len(),
            })
        } else {
            None
        };

        if let Some(reason) = reason {
            batch.skip(SkippedRecord {
                line,
                raw: raw_text(raw, start, end),
                reason,
            });
            continue;
        }

        match csv::StringRecord::from_byte_record(record.clone()) {
            Ok(decoded) => batch.rows.push(Row::from(decoded)),
            Err(_) => batch.skip(SkippedRecord {
                line,
                raw: raw_text(raw, start, end),
                reason: SkipReason::InvalidUtf8,
            }),
        }
    }

    if batch.total_records > 0 && batch.rows.is_empty() {
        return Err(Error::NoUsableRows {
            skipped: batch.skipped_count,
        });
    }

    log::info!(
        "ingested {} of {} export records ({} skipped)",
        batch.usable_count(),
        batch.total_records,
        batch.skipped_count
    );

    Ok(batch)
}

fn raw_text(raw: &[u8], start: usize, end: usize) -> String {
    let end = end.min(raw.len());
    let start = start.min(end);
    String::from_utf8_lossy(&raw[start..end])
        .trim_matches(|c| c == '\r' || c == '\n')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn format() -> LedgerFormat {
        LedgerFormat::new(Row::new(["Data", "Tipo", "Valore"]))
    }

    #[test]
    fn test_one_malformed_among_five_valid() {
        let csv = "Data;Tipo;Valore\n\
                   2024-01-01;Buy;-1\n\
                   2024-01-02;Buy;-2\n\
                   2024-01-03;Sell\n\
                   2024-01-04;Buy;-4\n\
                   2024-01-05;Buy;-5\n\
                   2024-01-06;Buy;-6\n";

        let batch = ingest_export(csv.as_bytes(), &format()).unwrap();

        assert_eq!(batch.total_records, 6);
        assert_eq!(batch.usable_count(), 5);
        assert_eq!(batch.skipped_count, 1);

        let skipped = &batch.skipped_samples[0];
        assert_eq!(skipped.line, 4);
        assert_eq!(skipped.raw, "2024-01-03;Sell");
        assert_eq!(
            skipped.reason,
            SkipReason::FieldCount {
                expected: 3,
                found: 2
            }
        );

        // Usable rows keep export order
        assert_eq!(batch.rows[2], Row::new(["2024-01-04", "Buy", "-4"]));
    }

    #[test]
    fn test_invalid_utf8_is_skipped() {
        let mut raw = b"Data;Tipo;Valore\n2024-01-01;Buy;-1\n2024-01-02;".to_vec();
        raw.extend_from_slice(&[0xff, 0xfe]);
        raw.extend_from_slice(b";-2\n");

        let batch = ingest_export(&raw, &format()).unwrap();

        assert_eq!(batch.usable_count(), 1);
        assert_eq!(batch.skipped_count, 1);
        assert_eq!(batch.skipped_samples[0].reason, SkipReason::InvalidUtf8);
        assert_eq!(batch.skipped_samples[0].line, 3);
    }

    #[test]
    fn test_blank_record_is_skipped() {
        let csv = "Data;Tipo;Valore\n;;\n2024-01-01;Buy;-1\n";
        let batch = ingest_export(csv.as_bytes(), &format()).unwrap();

        assert_eq!(batch.usable_count(), 1);
        assert_eq!(batch.skipped_samples[0].reason, SkipReason::Blank);
    }

    #[test]
    fn test_quoted_field_with_newline() {
        let csv = "Data;Tipo;Valore\r\n2024-01-01;\"Buy\r\nmore\";-1\r\n";
        let batch = ingest_export(csv.as_bytes(), &format()).unwrap();

        assert_eq!(batch.usable_count(), 1);
        assert_eq!(batch.rows[0].get(1), Some("Buy\r\nmore"));
    }

    #[test]
    fn test_header_only_is_empty_batch() {
        let batch = ingest_export(b"Data;Tipo;Valore\n", &format()).unwrap();
        assert_eq!(batch.total_records, 0);
        assert!(batch.rows.is_empty());
    }

    #[test]
    fn test_empty_export_is_error() {
        let err = ingest_export(b"", &format()).unwrap_err();
        assert!(matches!(err, Error::EmptyExport));
    }

    #[test]
    fn test_header_mismatch_is_error() {
        let err = ingest_export(b"Date;Type;Value\n1;2;3\n", &format()).unwrap_err();
        assert!(matches!(err, Error::ExportHeaderMismatch { .. }));
    }

    #[test]
    fn test_all_malformed_is_error() {
        let csv = "Data;Tipo;Valore\n1;2\n3\n";
        let err = ingest_export(csv.as_bytes(), &format()).unwrap_err();
        assert!(matches!(err, Error::NoUsableRows { skipped: 2 }));
    }

    #[test]
    fn test_samples_are_capped() {
        let mut csv = String::from("Data;Tipo;Valore\n2024-01-01;Buy;-1\n");
        for i in 0..(MAX_SKIPPED_SAMPLES + 5) {
            csv.push_str(&format!("bad{}\n", i));
        }

        let batch = ingest_export(csv.as_bytes(), &format()).unwrap();

        assert_eq!(batch.skipped_count, MAX_SKIPPED_SAMPLES + 5);
        assert_eq!(batch.skipped_samples.len(), MAX_SKIPPED_SAMPLES);
        assert_eq!(batch.skipped_samples[0].raw, "bad0");
    }
}
