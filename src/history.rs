// src/history.rs
//! Ledger of replayed files, one tiny parquet file per completed replay.
//!
//! Files are named `<file>---replayed---<ts_micros>.parquet` so the set of
//! replayed files can be recovered from a directory listing alone.

use anyhow::{anyhow, Context, Result};
use arrow::{
    array::{Array, ArrayRef, StringArray, TimestampMicrosecondArray, UInt64Array},
    datatypes::{DataType as ArrowDataType, Field, Schema as ArrowSchema, TimeUnit},
    record_batch::RecordBatch,
};
use chrono::{DateTime, Utc};
use glob::glob;
use parquet::{
    arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter},
    basic::Compression,
    file::properties::WriterProperties,
};
use std::{
    collections::HashSet,
    fs::{self, File},
    io::BufWriter,
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, warn};

use crate::ulf::ReplayReport;

const EVENT: &str = "replayed";
const SEP: &str = "---";

/// One replay of one file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReplayedRow {
    pub file_name: String,
    pub lines: u64,
    pub succeeded: u64,
    pub validation_failed: u64,
    pub dispatch_failed: u64,
    pub commits: u64,
    pub event_time: DateTime<Utc>,
}

impl ReplayedRow {
    pub fn from_report(file_name: &str, report: &ReplayReport) -> Self {
        Self {
            file_name: file_name.to_string(),
            lines: report.lines as u64,
            succeeded: report.counters.succeeded as u64,
            validation_failed: report.counters.validation_failed as u64,
            dispatch_failed: report.counters.dispatch_failed as u64,
            commits: report.commits as u64,
            event_time: report.finished_at,
        }
    }

    fn schema() -> ArrowSchema {
        ArrowSchema::new(vec![
            Field::new("file_name", ArrowDataType::Utf8, false),
            Field::new("lines", ArrowDataType::UInt64, false),
            Field::new("succeeded", ArrowDataType::UInt64, false),
            Field::new("validation_failed", ArrowDataType::UInt64, false),
            Field::new("dispatch_failed", ArrowDataType::UInt64, false),
            Field::new("commits", ArrowDataType::UInt64, false),
            Field::new(
                "event_time",
                ArrowDataType::Timestamp(TimeUnit::Microsecond, None),
                false,
            ),
        ])
    }

    fn to_arrays(&self) -> Vec<ArrayRef> {
        vec![
            Arc::new(StringArray::from(vec![self.file_name.clone()])),
            Arc::new(UInt64Array::from(vec![self.lines])),
            Arc::new(UInt64Array::from(vec![self.succeeded])),
            Arc::new(UInt64Array::from(vec![self.validation_failed])),
            Arc::new(UInt64Array::from(vec![self.dispatch_failed])),
            Arc::new(UInt64Array::from(vec![self.commits])),
            Arc::new(TimestampMicrosecondArray::from(vec![self
                .event_time
                .timestamp_micros()])),
        ]
    }
}

/// Names may not contain the separator or a path component.
fn safe_name(file_name: &str) -> String {
    file_name.replace(SEP, "-").replace(['/', '\\'], "_")
}

fn column<'a, T: Array + 'static>(batch: &'a RecordBatch, name: &str) -> Result<&'a T> {
    batch
        .column_by_name(name)
        .and_then(|c| c.as_any().downcast_ref::<T>())
        .ok_or_else(|| anyhow!("history column `{}` missing or of the wrong type", name))
}

pub struct History {
    history_dir: PathBuf,
}

impl History {
    /// Open the ledger at `history_dir`, creating the directory if needed.
    pub fn new(history_dir: impl Into<PathBuf>) -> Result<Self> {
        let history_dir = history_dir.into();
        fs::create_dir_all(&history_dir)
            .with_context(|| format!("creating history directory {:?}", &history_dir))?;
        Ok(Self { history_dir })
    }

    pub fn dir(&self) -> &Path {
        &self.history_dir
    }

    /// Write `row` to its own parquet file, via a `.tmp` file and a rename.
    pub fn record(&self, row: &ReplayedRow) -> Result<PathBuf> {
        let ts_micros = row.event_time.timestamp_micros();
        let stem = format!("{}{SEP}{}{SEP}{}", safe_name(&row.file_name), EVENT, ts_micros);
        let final_path = self.history_dir.join(format!("{}.parquet", stem));
        let tmp_path = self.history_dir.join(format!("{}.parquet.tmp", stem));

        let schema = Arc::new(ReplayedRow::schema());
        let batch = RecordBatch::try_new(schema.clone(), row.to_arrays())
            .context("building history record batch")?;

        let tmp_file = File::create(&tmp_path)
            .with_context(|| format!("could not create temporary file `{}`", tmp_path.display()))?;
        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut writer = ArrowWriter::try_new(BufWriter::new(tmp_file), schema, Some(props))
            .context("creating Arrow writer for history")?;
        writer.write(&batch).context("writing history batch")?;
        writer.close().context("closing history writer")?;

        fs::rename(&tmp_path, &final_path).with_context(|| {
            format!(
                "failed to rename `{}` to `{}`",
                tmp_path.display(),
                final_path.display()
            )
        })?;
        debug!(path = %final_path.display(), "recorded replay");
        Ok(final_path)
    }

    fn ledger_files(&self) -> Result<Vec<(String, PathBuf)>> {
        let pattern = format!("{}/*{SEP}{}{SEP}*.parquet", self.history_dir.display(), EVENT);
        let mut files = Vec::new();
        for entry in glob(&pattern).context("invalid glob pattern for history")? {
            let path = match entry {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = ?e, "cannot read history entry");
                    continue;
                }
            };
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            // "<file>---replayed---<ts>"
            let parts: Vec<&str> = stem.split(SEP).collect();
            if parts.len() != 3 || parts[1] != EVENT || parts[2].parse::<i64>().is_err() {
                continue;
            }
            files.push((parts[0].to_string(), path));
        }
        Ok(files)
    }

    /// Distinct names of every file with at least one recorded replay.
    pub fn replayed_files(&self) -> Result<HashSet<String>> {
        Ok(self
            .ledger_files()?
            .into_iter()
            .map(|(name, _)| name)
            .collect())
    }

    pub fn is_replayed(&self, file_name: &str) -> Result<bool> {
        Ok(self.replayed_files()?.contains(&safe_name(file_name)))
    }

    /// Read every recorded row back, oldest first.
    pub fn load_rows(&self) -> Result<Vec<ReplayedRow>> {
        let mut rows = Vec::new();
        for (_, path) in self.ledger_files()? {
            let file =
                File::open(&path).with_context(|| format!("failed to open `{}`", path.display()))?;
            let reader = ParquetRecordBatchReaderBuilder::try_new(file)
                .with_context(|| format!("reading parquet metadata of `{}`", path.display()))?
                .build()
                .with_context(|| format!("building reader for `{}`", path.display()))?;
            for batch in reader {
                let batch =
                    batch.with_context(|| format!("reading batch from `{}`", path.display()))?;
                let names = column::<StringArray>(&batch, "file_name")?;
                let lines = column::<UInt64Array>(&batch, "lines")?;
                let succeeded = column::<UInt64Array>(&batch, "succeeded")?;
                let validation_failed = column::<UInt64Array>(&batch, "validation_failed")?;
                let dispatch_failed = column::<UInt64Array>(&batch, "dispatch_failed")?;
                let commits = column::<UInt64Array>(&batch, "commits")?;
                let times = column::<TimestampMicrosecondArray>(&batch, "event_time")?;
                for i in 0..batch.num_rows() {
                    let event_time = DateTime::from_timestamp_micros(times.value(i))
                        .ok_or_else(|| anyhow!("invalid event_time in `{}`", path.display()))?;
                    rows.push(ReplayedRow {
                        file_name: names.value(i).to_string(),
                        lines: lines.value(i),
                        succeeded: succeeded.value(i),
                        validation_failed: validation_failed.value(i),
                        dispatch_failed: dispatch_failed.value(i),
                        commits: commits.value(i),
                        event_time,
                    });
                }
            }
        }
        rows.sort_by_key(|r| r.event_time);
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::tempdir;

    fn row(name: &str, at: DateTime<Utc>) -> ReplayedRow {
        ReplayedRow {
            file_name: name.to_string(),
            lines: 12,
            succeeded: 9,
            validation_failed: 1,
            dispatch_failed: 1,
            commits: 2,
            event_time: at,
        }
    }

    #[test]
    fn recorded_rows_are_found_by_name() -> Result<()> {
        let dir = tempdir()?;
        let history = History::new(dir.path().join("history"))?;
        assert!(history.replayed_files()?.is_empty());

        let now = Utc::now();
        let path = history.record(&row("orders.ulf", now))?;
        assert!(path.exists());
        assert!(!path.with_extension("parquet.tmp").exists());
        history.record(&row("orders.ulf", now + Duration::seconds(1)))?;
        history.record(&row("customers.ulf", now))?;

        let names = history.replayed_files()?;
        assert_eq!(names.len(), 2);
        assert!(history.is_replayed("orders.ulf")?);
        assert!(!history.is_replayed("other.ulf")?);
        Ok(())
    }

    #[test]
    fn rows_read_back_in_time_order() -> Result<()> {
        let dir = tempdir()?;
        let history = History::new(dir.path())?;
        let now = Utc::now();
        history.record(&row("b.ulf", now + Duration::seconds(5)))?;
        history.record(&row("a.ulf", now))?;
        let rows = history.load_rows()?;
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].file_name, "a.ulf");
        assert_eq!(rows[1].file_name, "b.ulf");
        assert_eq!(rows[0].succeeded, 9);
        assert_eq!(rows[0].commits, 2);
        assert_eq!(
            rows[0].event_time.timestamp_micros(),
            now.timestamp_micros()
        );
        Ok(())
    }

    #[test]
    fn unrelated_files_are_ignored() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("notes---replayed---soon.parquet"), b"x")?;
        fs::write(dir.path().join("readme.txt"), b"x")?;
        let history = History::new(dir.path())?;
        assert!(history.replayed_files()?.is_empty());
        Ok(())
    }

    #[test]
    fn separators_in_names_are_made_safe() -> Result<()> {
        let dir = tempdir()?;
        let history = History::new(dir.path())?;
        history.record(&row("odd---name.ulf", Utc::now()))?;
        assert!(history.is_replayed("odd---name.ulf")?);
        Ok(())
    }
}
