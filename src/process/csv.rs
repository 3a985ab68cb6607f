// src/process/csv.rs
use anyhow::Result;
use tracing::{trace, warn};

use super::RecordReader;
use crate::{messages::MessageLog, source::LineSource};

/// Comma-separated reader where a double quote toggles quoting.
///
/// A quoted span may run over several physical lines; the line breaks are kept
/// as `\n` inside the field. Doubled quotes are not an escape, they simply
/// toggle twice.
#[derive(Debug, Default)]
pub struct DelimitedRecordReader {
    expected_header: Option<Vec<String>>,
    records_read: usize,
}

impl DelimitedRecordReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check the first record against these column headings.
    pub fn with_expected_header(mut self, columns: Option<Vec<String>>) -> Self {
        self.expected_header = columns;
        self
    }

    /// Compare `values` positionally against the expected headings, one warning per mismatch.
    pub fn check_column_headings(&self, values: &[String], messages: &mut MessageLog) -> usize {
        let Some(columns) = &self.expected_header else {
            return 0;
        };
        let mut mismatches = 0;
        for (i, expected) in columns.iter().enumerate() {
            let actual = values.get(i);
            if actual != Some(expected) {
                mismatches += 1;
                messages.warn(format!(
                    "Unexpected column heading at position {}: {}; was expecting: {}",
                    i,
                    actual.map(String::as_str).unwrap_or("<missing>"),
                    expected
                ));
            }
        }
        mismatches
    }
}

/// Split one logical record, pulling more physical lines while inside quotes.
///
/// Returns `None` at EOF, including EOF reached inside an open quote.
pub fn read_delimited<S: LineSource + ?Sized>(source: &mut S) -> Result<Option<Vec<String>>> {
    let mut values = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut physical = 0usize;

    loop {
        let Some(line) = source.read_line()? else {
            if in_quotes {
                warn!(
                    physical_lines = physical,
                    "EOF inside quoted field, dropping partial record"
                );
            }
            return Ok(None);
        };
        if in_quotes {
            current.push('\n');
        }
        physical += 1;
        for chr in line.chars() {
            match chr {
                '"' => in_quotes = !in_quotes,
                ',' if !in_quotes => values.push(std::mem::take(&mut current)),
                _ => current.push(chr),
            }
        }
        if !in_quotes {
            break;
        }
    }
    values.push(current);
    if physical > 1 {
        trace!(physical_lines = physical, "record spans several lines");
    }
    Ok(Some(values))
}

impl RecordReader for DelimitedRecordReader {
    type Record = Vec<String>;

    fn read_record<S: LineSource + ?Sized>(
        &mut self,
        source: &mut S,
        messages: &mut MessageLog,
    ) -> Result<Option<Vec<String>>> {
        let record = read_delimited(source)?;
        if let Some(values) = &record {
            self.records_read += 1;
            if self.records_read == 1 {
                self.check_column_headings(values, messages);
            }
        }
        Ok(record)
    }
}
