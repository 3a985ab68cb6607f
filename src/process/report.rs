// src/process/report.rs
use tracing::{debug, info};

use super::{Flow, RecordHandler, RunContext};
use crate::error::ReplayError;

/// Inspection handler: tracks the widest value seen in every column.
///
/// Column names come from the expected header when given, otherwise from the
/// first record read.
#[derive(Debug, Default)]
pub struct ColumnReport {
    columns: Vec<String>,
    widths: Vec<usize>,
    records: usize,
}

impl ColumnReport {
    pub fn new(columns: Option<Vec<String>>) -> Self {
        Self {
            columns: columns.unwrap_or_default(),
            ..Default::default()
        }
    }

    /// `(column name, widest value in chars)` in column order.
    pub fn field_sizes(&self) -> Vec<(String, usize)> {
        self.widths
            .iter()
            .enumerate()
            .map(|(i, w)| {
                let name = self
                    .columns
                    .get(i)
                    .cloned()
                    .unwrap_or_else(|| format!("column_{}", i));
                (name, *w)
            })
            .collect()
    }

    pub fn records(&self) -> usize {
        self.records
    }
}

impl RecordHandler<Vec<String>> for ColumnReport {
    fn process(&mut self, values: Vec<String>, ctx: &mut RunContext) -> Result<Flow, ReplayError> {
        if self.columns.is_empty() && ctx.line_nbr == 1 {
            self.columns = values;
            return Ok(Flow::Continue);
        }
        self.records += 1;
        if values.len() > self.widths.len() {
            self.widths.resize(values.len(), 0);
        }
        for (i, v) in values.iter().enumerate() {
            let len = v.chars().count();
            if len > self.widths[i] {
                self.widths[i] = len;
            }
        }
        debug!(line = ctx.line_nbr, fields = values.len(), "measured record");
        Ok(Flow::Continue)
    }

    fn end(&mut self, ctx: &mut RunContext) {
        for (name, width) in self.field_sizes() {
            info!("{} ... {}", name, width);
        }
        info!(
            records = self.records,
            lines = ctx.line_nbr,
            "column report complete"
        );
    }
}
