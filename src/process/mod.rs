// src/process/mod.rs
use anyhow::Result;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::{config::ProcessorConfig, error::ReplayError, messages::MessageLog, source::LineSource};

pub mod csv;
pub mod report;

pub use csv::DelimitedRecordReader;
pub use report::ColumnReport;

/// What a record handler wants the loop to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// Why the processing loop ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum StopReason {
    EndOfInput,
    HandlerStop,
    LineLimit,
    StopAtError,
    Fatal,
    SourceFailure,
}

/// State shared between the loop and its handler for the duration of one run.
#[derive(Debug)]
pub struct RunContext {
    /// Number of logical records read so far; the current record's line number while processing.
    pub line_nbr: usize,
    /// Run-level messages; errors here drive the stop-at-error check.
    pub messages: MessageLog,
    pub stop_reason: StopReason,
    pub source_name: String,
}

impl RunContext {
    pub fn new(source_name: impl Into<String>) -> Self {
        Self {
            line_nbr: 0,
            messages: MessageLog::new(),
            stop_reason: StopReason::EndOfInput,
            source_name: source_name.into(),
        }
    }
}

/// Turns physical lines from a source into logical records.
pub trait RecordReader {
    type Record;

    /// Next logical record, or `None` at end of input.
    fn read_record<S: LineSource + ?Sized>(
        &mut self,
        source: &mut S,
        messages: &mut MessageLog,
    ) -> Result<Option<Self::Record>>;
}

/// Each physical line is one record.
#[derive(Debug, Default)]
pub struct PlainLineReader;

impl RecordReader for PlainLineReader {
    type Record = String;

    fn read_record<S: LineSource + ?Sized>(
        &mut self,
        source: &mut S,
        _messages: &mut MessageLog,
    ) -> Result<Option<String>> {
        source.read_line()
    }
}

/// Receives the records of one run.
pub trait RecordHandler<R> {
    fn start(&mut self, _ctx: &mut RunContext) -> Result<()> {
        Ok(())
    }

    fn process(&mut self, record: R, ctx: &mut RunContext) -> Result<Flow, ReplayError>;

    /// Always called once, whatever ended the run.
    fn end(&mut self, ctx: &mut RunContext);
}

/// Drives a source through a record reader into a handler, one record at a time.
#[derive(Debug, Clone)]
pub struct LineProcessor {
    stop_at_error: bool,
    line_limit: Option<usize>,
}

impl LineProcessor {
    pub fn new(config: &ProcessorConfig) -> Self {
        Self {
            stop_at_error: config.stop_at_error,
            line_limit: config.line_limit,
        }
    }

    /// Process the whole source, returning the number of logical records read.
    #[tracing::instrument(level = "info", skip_all, fields(source = %source.name()))]
    pub fn run<S, T, H>(&self, source: &mut S, reader: &mut T, handler: &mut H) -> usize
    where
        S: LineSource + ?Sized,
        T: RecordReader,
        H: RecordHandler<T::Record>,
    {
        let mut ctx = RunContext::new(source.name());
        debug!("start");

        match handler.start(&mut ctx).and_then(|_| source.open()) {
            Ok(()) => {
                ctx.stop_reason = self.process_loop(source, reader, handler, &mut ctx);
            }
            Err(e) => {
                error!(error = ?e, "could not start processing");
                ctx.messages.report(&e);
                ctx.stop_reason = StopReason::SourceFailure;
            }
        }

        if let Err(e) = source.close() {
            trace!(error = ?e, "ignoring error on close");
        }

        handler.end(&mut ctx);
        info!(
            lines = ctx.line_nbr,
            reason = ?ctx.stop_reason,
            "end"
        );
        ctx.line_nbr
    }

    fn process_loop<S, T, H>(
        &self,
        source: &mut S,
        reader: &mut T,
        handler: &mut H,
        ctx: &mut RunContext,
    ) -> StopReason
    where
        S: LineSource + ?Sized,
        T: RecordReader,
        H: RecordHandler<T::Record>,
    {
        loop {
            let record = match reader.read_record(source, &mut ctx.messages) {
                Ok(Some(record)) => record,
                Ok(None) => return StopReason::EndOfInput,
                Err(e) => {
                    error!(line = ctx.line_nbr, error = ?e, "read failed");
                    ctx.messages.report(&e);
                    return StopReason::SourceFailure;
                }
            };
            ctx.line_nbr += 1;
            trace!(line = ctx.line_nbr, "read record");

            match handler.process(record, ctx) {
                Ok(Flow::Continue) => {}
                Ok(Flow::Stop) => {
                    warn!(line = ctx.line_nbr, "exiting due to handler returning stop");
                    return StopReason::HandlerStop;
                }
                Err(e) => {
                    ctx.messages.error(e.to_string());
                    if e.is_fatal() {
                        error!(line = ctx.line_nbr, error = %e, "aborting run");
                        return StopReason::Fatal;
                    }
                    warn!(line = ctx.line_nbr, error = %e, "record failed");
                }
            }

            if let Some(limit) = self.line_limit {
                if ctx.line_nbr > limit {
                    warn!(limit, "exiting due to line_limit reached");
                    return StopReason::LineLimit;
                }
            }
            if self.stop_at_error && ctx.messages.take_error_flag() {
                warn!(line = ctx.line_nbr, "stopping due to error");
                ctx.messages.error(format!("stopping due to error at line {}", ctx.line_nbr));
                return StopReason::StopAtError;
            }
        }
    }
}
