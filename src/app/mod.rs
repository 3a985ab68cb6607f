// src/app/mod.rs
//! Boundary of the application being replayed against.
//!
//! The replay engine only talks to these traits. [`memory`] provides an
//! in-process implementation used by the CLI and the tests.

use anyhow::Result;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::messages::MessageLog;

pub mod memory;

/// Insertion-ordered parameter name → raw value.
pub type ParameterMap = IndexMap<String, String>;

/// Parameter names with a fixed meaning to the replay engine.
pub mod params {
    pub const USER_ID: &str = "user_id";
    pub const PAGE_ID: &str = "page_id";
    pub const PAGE_KEY: &str = "page_key";
    pub const PAGE_BUTTON: &str = "page_button";

    /// `page_button` value asking the context to validate and commit.
    pub const SAVE: &str = "save";

    pub fn is_reserved(name: &str) -> bool {
        matches!(name, USER_ID | PAGE_ID | PAGE_KEY | PAGE_BUTTON)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum RowAction {
    Create,
    Update,
    Delete,
}

/// One pending change to a stored row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct RowMutation {
    pub action: RowAction,
    pub entity: String,
    pub key: String,
    pub fields: BTreeMap<String, String>,
}

/// A transactional batch of pending row mutations.
pub trait UnitOfWork {
    fn stage(&mut self, mutation: RowMutation) -> Result<()>;

    /// Rows with pending modifications.
    fn modified_row_count(&self) -> usize;

    fn is_valid(&self) -> bool;

    fn is_active(&self) -> bool;

    fn set_override_all_validations(&mut self, on: bool);

    fn override_all_validations(&self) -> bool;

    /// Apply every staged mutation or none of them.
    fn save(&mut self) -> Result<()>;

    /// Discard everything staged.
    fn cancel(&mut self);
}

/// A loaded page/screen of the application that parameters are applied to.
pub trait InteractionContext {
    fn interaction_id(&self) -> &str;

    /// Key of the record this context is positioned on, if known.
    fn primary_key(&self) -> Option<String>;

    /// Add an empty row to a grid section, returning the row's parameter-name prefix.
    fn add_row(&mut self, section: &str, seed: Option<&str>) -> Result<String>;

    /// Apply parameters; a save request validates and stages into `work`.
    fn update(&mut self, params: &ParameterMap, work: &mut dyn UnitOfWork) -> Result<()>;

    /// Still open: nothing saved yet, or a save failed validation.
    fn is_active(&self) -> bool;

    fn is_saved(&self) -> bool;

    fn cancel(&mut self);
}

/// A simulated actor.
pub trait Session {
    type Context: InteractionContext;
    type Work: UnitOfWork;

    fn user_id(&self) -> &str;

    fn get_context(&mut self, interaction_id: &str, key: Option<&str>) -> Result<Self::Context>;

    fn new_unit_of_work(&mut self, label: &str) -> Result<Self::Work>;

    /// Begin a new visit (batch) marker.
    fn new_visit(&mut self, interaction_id: Option<&str>, note: &str);

    /// Close the current visit bookkeeping with the time its work started.
    fn update_visit(&mut self, started: DateTime<Utc>);

    fn messages(&mut self) -> &mut MessageLog;

    fn close(&mut self);
}

/// Creates sessions for actors met in the input.
pub trait SessionFactory {
    type Session: Session;

    fn create(&mut self, user_id: &str) -> Result<Self::Session>;
}
