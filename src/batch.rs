// src/batch.rs
use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::{
    app::{Session, UnitOfWork},
    config::ProcessorConfig,
    messages::MessageLog,
};

/// Owns the single open unit-of-work of a run and decides when to save it.
pub struct BatchCommitController<W: UnitOfWork> {
    batch_size: usize,
    override_all_validations: bool,
    work: Option<W>,
    started: DateTime<Utc>,
    batch_index: usize,
    commits: usize,
    failed_commits: usize,
}

impl<W: UnitOfWork> BatchCommitController<W> {
    pub fn new(config: &ProcessorConfig) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            override_all_validations: config.override_all_validations,
            work: None,
            started: Utc::now(),
            batch_index: 0,
            commits: 0,
            failed_commits: 0,
        }
    }

    /// Save the open batch if it is full, invalid or `force_final` is set, then
    /// open a fresh one unless this is the final call.
    ///
    /// Save failures are recorded in `messages` and the session's log and the
    /// batch is cancelled; only a failure to open a new batch is returned.
    pub fn advance<S>(
        &mut self,
        session: &mut S,
        force_final: bool,
        line: usize,
        interaction: Option<&str>,
        messages: &mut MessageLog,
    ) -> Result<()>
    where
        S: Session<Work = W>,
    {
        if let Some(mut work) = self.work.take() {
            let rows = work.modified_row_count();
            if rows >= self.batch_size || force_final || !work.is_valid() {
                session.update_visit(self.started);
                if rows == 0 {
                    debug!(batch = self.batch_index, "closing empty batch");
                    work.cancel();
                } else {
                    match work.save() {
                        Ok(()) => {
                            self.commits += 1;
                            info!(batch = self.batch_index, rows, "batch saved");
                        }
                        Err(e) => {
                            self.failed_commits += 1;
                            error!(batch = self.batch_index, rows, error = ?e, "batch save failed");
                            messages.error(format!(
                                "batch {} ending at line {} failed to save: {:#}",
                                self.batch_index, line, e
                            ));
                            session.messages().report(&e);
                            work.cancel();
                        }
                    }
                }
            } else {
                self.work = Some(work);
            }
        }

        if self.work.is_none() && !force_final {
            let label = format!("batch {} from line {}", self.batch_index + 1, line);
            let mut work = session.new_unit_of_work(&label)?;
            work.set_override_all_validations(self.override_all_validations);
            self.batch_index += 1;
            self.started = Utc::now();
            session.new_visit(interaction, &format!("batch started at line {}", line));
            debug!(batch = self.batch_index, line, "opened batch");
            self.work = Some(work);
        }
        Ok(())
    }

    pub fn work_mut(&mut self) -> Option<&mut W> {
        self.work.as_mut()
    }

    pub fn is_open(&self) -> bool {
        self.work.is_some()
    }

    pub fn commits(&self) -> usize {
        self.commits
    }

    pub fn failed_commits(&self) -> usize {
        self.failed_commits
    }
}
