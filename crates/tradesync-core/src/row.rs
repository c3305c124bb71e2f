//! Row model for ledger and export records

use serde::{Deserialize, Serialize};
use std::fmt;

/// One ledger line as an ordered list of raw field values.
///
/// Identity is the exact tuple of all fields: two rows are the same
/// transaction iff every field matches byte for byte. No trimming or
/// normalization is applied, so `"1,00"` and `" 1,00"` are distinct rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Row {
    fields: Vec<String>,
}

impl Row {
    /// Create a row from its ordered field values
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Field values in order
    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    /// Get a field by index
    pub fn get(&self, index: usize) -> Option<&str> {
        self.fields.get(index).map(String::as_str)
    }

    /// Number of fields
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Check if the row has no fields at all
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Check if every field is empty (a blank line such as `;;;;`)
    pub fn is_blank(&self) -> bool {
        self.fields.iter().all(|f| f.is_empty())
    }

    /// Iterate over field values
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(String::as_str)
    }

    /// Join the fields with a delimiter, without quoting. Used for messages.
    pub fn joined(&self, delimiter: char) -> String {
        let mut out = String::new();
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                out.push(delimiter);
            }
            out.push_str(field);
        }
        out
    }
}

impl From<csv::StringRecord> for Row {
    fn from(record: csv::StringRecord) -> Self {
        Row::new(record.iter())
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.joined(';'))
    }
}
