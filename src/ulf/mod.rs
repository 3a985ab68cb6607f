// src/ulf/mod.rs
//! Universal Load Format replay.
//!
//! A ULF file is a CSV stream of `P` (parameter header) and `V` (values)
//! records. Each `V` record is zipped against the latest `P` record into a
//! parameter map and replayed as one interaction of the actor named by its
//! `user_id`.

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use tracing::{debug, error, info, trace, warn};

use crate::{
    app::{params, InteractionContext, ParameterMap, Session, SessionFactory, UnitOfWork},
    batch::BatchCommitController,
    config::ProcessorConfig,
    error::ReplayError,
    messages::Message,
    process::{DelimitedRecordReader, Flow, LineProcessor, RecordHandler, RunContext, StopReason},
    source::LineSource,
};

pub mod grid;
pub mod keys;

pub use grid::expand_grid_row;
pub use keys::{resolve_forward_keys, substitute_current_key, KeyRegistry, CURRENT_KEY_TOKEN};

pub const HEADER_RECORD: &str = "P";
pub const VALUE_RECORD: &str = "V";

/// Per-run tallies of dispatched interactions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct Counters {
    pub succeeded: usize,
    pub validation_failed: usize,
    pub dispatch_failed: usize,
}

/// How one dispatched interaction ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    Saved,
    ValidationFailed,
    /// Applied without a save request; the interaction stays open.
    InProgress,
}

#[derive(Clone, Debug, Serialize)]
pub struct ReplayReport {
    pub source: String,
    pub lines: usize,
    pub stop_reason: StopReason,
    pub counters: Counters,
    pub commits: usize,
    pub failed_commits: usize,
    pub sessions_closed: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub messages: Vec<Message>,
}

/// Zip header names with record values, both without their kind tag.
///
/// Blank names drop their column and the shorter side limits the zip.
pub fn map_record(header: &[String], values: &[String]) -> ParameterMap {
    header
        .iter()
        .zip(values.iter())
        .filter(|(name, _)| !name.is_empty())
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Long-lived replay entry point: holds the session factory and the caller's
/// primary session. All state of a single replay lives in a [`UlfRun`].
pub struct UlfInterpreter<F: SessionFactory> {
    factory: F,
    primary: F::Session,
    config: ProcessorConfig,
}

impl<F: SessionFactory> UlfInterpreter<F> {
    pub fn new(factory: F, primary: F::Session, config: ProcessorConfig) -> Self {
        Self {
            factory,
            primary,
            config,
        }
    }

    pub fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    pub fn primary(&self) -> &F::Session {
        &self.primary
    }

    pub fn primary_mut(&mut self) -> &mut F::Session {
        &mut self.primary
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Replay the whole source and report what happened.
    #[tracing::instrument(level = "info", skip_all, fields(source = %source.name()))]
    pub fn replay<S: LineSource + ?Sized>(&mut self, source: &mut S) -> ReplayReport {
        let mut reader =
            DelimitedRecordReader::new().with_expected_header(self.config.expected_header.clone());
        let processor = LineProcessor::new(&self.config);
        let mut run = UlfRun::new(&mut self.factory, &mut self.primary, &self.config);
        processor.run(source, &mut reader, &mut run);
        run.into_report()
    }
}

/// State of one replay: header, key registry, counters, actor sessions and the
/// open batch. Dropped when the replay ends.
pub struct UlfRun<'a, F: SessionFactory> {
    factory: &'a mut F,
    primary: &'a mut F::Session,
    header: Option<Vec<String>>,
    registry: KeyRegistry,
    counters: Counters,
    sessions: IndexMap<String, F::Session>,
    batch: BatchCommitController<<F::Session as Session>::Work>,
    started_at: DateTime<Utc>,
    report: Option<ReplayReport>,
}

impl<'a, F: SessionFactory> UlfRun<'a, F> {
    pub fn new(factory: &'a mut F, primary: &'a mut F::Session, config: &ProcessorConfig) -> Self {
        Self {
            factory,
            primary,
            header: None,
            registry: KeyRegistry::new(),
            counters: Counters::default(),
            sessions: IndexMap::new(),
            batch: BatchCommitController::new(config),
            started_at: Utc::now(),
            report: None,
        }
    }

    pub fn counters(&self) -> Counters {
        self.counters
    }

    pub fn registry(&self) -> &KeyRegistry {
        &self.registry
    }

    pub fn header(&self) -> Option<&[String]> {
        self.header.as_deref()
    }

    pub fn into_report(mut self) -> ReplayReport {
        let started_at = self.started_at;
        self.report.take().unwrap_or_else(|| ReplayReport {
            source: String::new(),
            lines: 0,
            stop_reason: StopReason::EndOfInput,
            counters: self.counters,
            commits: self.batch.commits(),
            failed_commits: self.batch.failed_commits(),
            sessions_closed: 0,
            started_at,
            finished_at: Utc::now(),
            messages: Vec::new(),
        })
    }

    fn process_values(
        &mut self,
        values: Vec<String>,
        ctx: &mut RunContext,
    ) -> Result<Flow, ReplayError> {
        let line = ctx.line_nbr;
        let header = self
            .header
            .as_deref()
            .ok_or(ReplayError::NoHeader { line })?;
        // values[0] is the `V` tag, checked by the caller
        let mut incoming = map_record(header, &values[1..]);
        resolve_forward_keys(&mut incoming, &self.registry, line)?;

        let (Some(user_id), Some(page_id)) = (
            incoming.get(params::USER_ID).filter(|v| !v.is_empty()).cloned(),
            incoming.get(params::PAGE_ID).filter(|v| !v.is_empty()).cloned(),
        ) else {
            trace!(line, "no user_id/page_id, nothing to dispatch");
            return Ok(Flow::Continue);
        };

        let UlfRun {
            factory,
            primary,
            sessions,
            batch,
            counters,
            registry,
            ..
        } = self;

        let session = match session_for(&mut **factory, &mut **primary, sessions, &user_id) {
            Ok(session) => session,
            Err(e) => {
                counters.dispatch_failed += 1;
                error!(line, user = %user_id, error = ?e, "no session");
                return Err(ReplayError::Dispatch { line, source: e });
            }
        };

        let started = Utc::now();
        let result = batch
            .advance(session, false, line, Some(&page_id), &mut ctx.messages)
            .and_then(|_| {
                let work = batch
                    .work_mut()
                    .ok_or_else(|| anyhow!("no open batch at line {}", line))?;
                let page_key = incoming.get(params::PAGE_KEY).cloned();
                let mut page = session.get_context(&page_id, page_key.as_deref())?;
                let outcome = dispatch(&mut page, work, incoming);
                if let Some(key) = page.primary_key() {
                    registry.insert(line, key);
                }
                outcome
            });

        session.update_visit(started);
        let flow = match result {
            Ok(Outcome::Saved) => {
                counters.succeeded += 1;
                Ok(Flow::Continue)
            }
            Ok(Outcome::ValidationFailed) => {
                counters.validation_failed += 1;
                debug!(line, page = %page_id, "interaction not saved");
                Ok(Flow::Continue)
            }
            Ok(Outcome::InProgress) => Ok(Flow::Continue),
            Err(e) => {
                counters.dispatch_failed += 1;
                error!(line, page = %page_id, error = ?e, "dispatch failed");
                session.messages().report(&e);
                Err(ReplayError::Dispatch { line, source: e })
            }
        };
        session.messages().clear();
        flow
    }
}

/// The primary session when the ids match, otherwise the run's session for
/// `user_id`, created on first use.
fn session_for<'s, F: SessionFactory>(
    factory: &mut F,
    primary: &'s mut F::Session,
    sessions: &'s mut IndexMap<String, F::Session>,
    user_id: &str,
) -> Result<&'s mut F::Session> {
    if primary.user_id() == user_id {
        return Ok(primary);
    }
    if !sessions.contains_key(user_id) {
        let session = factory.create(user_id)?;
        info!(user = %user_id, "created session");
        sessions.insert(user_id.to_string(), session);
    }
    sessions
        .get_mut(user_id)
        .ok_or_else(|| anyhow!("session for {} was not created", user_id))
}

/// Apply one parameter map to a loaded interaction and classify the result.
fn dispatch<C: InteractionContext>(
    page: &mut C,
    work: &mut dyn UnitOfWork,
    mut incoming: ParameterMap,
) -> Result<Outcome> {
    if let Some(key) = page.primary_key() {
        substitute_current_key(&mut incoming, &key);
    }
    expand_grid_row(&mut incoming, page)?;
    let save_requested =
        incoming.get(params::PAGE_BUTTON).map(String::as_str) == Some(params::SAVE);

    page.update(&incoming, work)?;

    Ok(if page.is_active() {
        if save_requested {
            page.cancel();
            Outcome::ValidationFailed
        } else {
            Outcome::InProgress
        }
    } else if page.is_saved() {
        Outcome::Saved
    } else {
        Outcome::ValidationFailed
    })
}

impl<'a, F: SessionFactory> RecordHandler<Vec<String>> for UlfRun<'a, F> {
    fn start(&mut self, ctx: &mut RunContext) -> Result<()> {
        info!(source = %ctx.source_name, "replay starting");
        self.started_at = Utc::now();
        Ok(())
    }

    fn process(&mut self, values: Vec<String>, ctx: &mut RunContext) -> Result<Flow, ReplayError> {
        match values.first().map(String::as_str) {
            Some(HEADER_RECORD) => {
                trace!(line = ctx.line_nbr, columns = values.len() - 1, "new parameter header");
                self.header = Some(values.into_iter().skip(1).collect());
                Ok(Flow::Continue)
            }
            Some(VALUE_RECORD) => self.process_values(values, ctx),
            other => {
                trace!(line = ctx.line_nbr, kind = ?other, "ignoring record");
                Ok(Flow::Continue)
            }
        }
    }

    fn end(&mut self, ctx: &mut RunContext) {
        let line = ctx.line_nbr;
        if let Err(e) = self
            .batch
            .advance(&mut *self.primary, true, line, None, &mut ctx.messages)
        {
            error!(error = ?e, "final batch flush failed");
            ctx.messages.report(&e);
        }

        let sessions_closed = self.sessions.len();
        for (user_id, mut session) in self.sessions.drain(..) {
            debug!(user = %user_id, "closing session");
            session.close();
        }

        let c = self.counters;
        info!(
            lines = line,
            saved = c.succeeded,
            not_saved = c.validation_failed,
            failed = c.dispatch_failed,
            commits = self.batch.commits(),
            failed_commits = self.batch.failed_commits(),
            "replay finished"
        );
        if !ctx.messages.is_empty() {
            warn!("run messages:\n{}", ctx.messages);
        }
        let primary_messages = self.primary.messages();
        if !primary_messages.is_empty() {
            info!("{}", primary_messages);
        }

        self.report = Some(ReplayReport {
            source: ctx.source_name.clone(),
            lines: line,
            stop_reason: ctx.stop_reason,
            counters: c,
            commits: self.batch.commits(),
            failed_commits: self.batch.failed_commits(),
            sessions_closed,
            started_at: self.started_at,
            finished_at: Utc::now(),
            messages: ctx.messages.messages().to_vec(),
        });
    }
}

/// Replay `source` with a fresh interpreter and return the report together
/// with the interpreter, so callers can inspect the primary session.
pub fn replay_source<F, S>(
    factory: F,
    primary: F::Session,
    config: ProcessorConfig,
    source: &mut S,
) -> (ReplayReport, UlfInterpreter<F>)
where
    F: SessionFactory,
    S: LineSource + ?Sized,
{
    let mut interpreter = UlfInterpreter::new(factory, primary, config);
    let report = interpreter.replay(source);
    (report, interpreter)
}

#[cfg(test)]
mod tests;
