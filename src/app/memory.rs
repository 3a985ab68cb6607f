// src/app/memory.rs
//! In-process application: interactions described in YAML, rows kept in memory.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap, HashSet},
    fs,
    path::Path,
    rc::Rc,
};
use tracing::{debug, trace, warn};

use super::{
    params, InteractionContext, ParameterMap, RowAction, RowMutation, Session, SessionFactory,
    UnitOfWork,
};
use crate::messages::MessageLog;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Create,
    Update,
}

/// A repeating grid of child rows on an interaction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionDef {
    pub id: String,
    pub entity: String,
    /// Field set from the seed value when a row is added.
    pub add_row_field: String,
    /// Field on the child row holding the parent's key.
    #[serde(default)]
    pub link_field: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InteractionDef {
    pub id: String,
    pub entity: String,
    pub mode: Mode,
    /// Field whose value is the row key; generated keys are used when absent.
    #[serde(default)]
    pub key_field: Option<String>,
    /// Accepted field names; empty accepts any non-reserved parameter.
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub sections: Vec<SectionDef>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppModel {
    pub interactions: Vec<InteractionDef>,
}

impl AppModel {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let model: AppModel = serde_yaml::from_str(yaml).context("parsing application model")?;
        let mut ids = HashSet::new();
        for i in &model.interactions {
            if !ids.insert(i.id.as_str()) {
                bail!("duplicate interaction id: {}", i.id);
            }
        }
        Ok(model)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading model file {}", path.display()))?;
        Self::from_yaml_str(&text)
    }

    pub fn interaction(&self, id: &str) -> Option<&InteractionDef> {
        self.interactions.iter().find(|i| i.id == id)
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct CommitRecord {
    pub label: String,
    pub rows: usize,
    pub at: DateTime<Utc>,
}

/// Committed rows per entity, plus what happened to them.
#[derive(Debug, Default, Serialize)]
pub struct MemoryStore {
    tables: BTreeMap<String, BTreeMap<String, BTreeMap<String, String>>>,
    commits: Vec<CommitRecord>,
    closed_sessions: Vec<String>,
    #[serde(skip)]
    sequences: HashMap<String, u64>,
}

pub type SharedStore = Rc<RefCell<MemoryStore>>;

impl MemoryStore {
    pub fn shared() -> SharedStore {
        Rc::new(RefCell::new(Self::default()))
    }

    /// Next generated key for `entity`, starting at 1.
    pub fn next_key(&mut self, entity: &str) -> String {
        let seq = self.sequences.entry(entity.to_string()).or_insert(0);
        *seq += 1;
        seq.to_string()
    }

    pub fn row(&self, entity: &str, key: &str) -> Option<&BTreeMap<String, String>> {
        self.tables.get(entity).and_then(|t| t.get(key))
    }

    pub fn row_count(&self, entity: &str) -> usize {
        self.tables.get(entity).map(|t| t.len()).unwrap_or(0)
    }

    pub fn commits(&self) -> &[CommitRecord] {
        &self.commits
    }

    pub fn closed_sessions(&self) -> &[String] {
        &self.closed_sessions
    }

    /// Apply a batch atomically: every mutation is checked before any is written.
    pub fn apply(&mut self, label: &str, mutations: &[RowMutation]) -> Result<()> {
        let mut created: HashSet<(&str, &str)> = HashSet::new();
        for m in mutations {
            let exists = self.row(&m.entity, &m.key).is_some()
                || created.contains(&(m.entity.as_str(), m.key.as_str()));
            match m.action {
                RowAction::Create if exists => {
                    bail!("duplicate key {}[{}]", m.entity, m.key)
                }
                RowAction::Create => {
                    created.insert((m.entity.as_str(), m.key.as_str()));
                }
                RowAction::Update | RowAction::Delete if !exists => {
                    bail!("no such row {}[{}]", m.entity, m.key)
                }
                _ => {}
            }
        }

        for m in mutations {
            let table = self.tables.entry(m.entity.clone()).or_default();
            match m.action {
                RowAction::Create | RowAction::Update => {
                    table
                        .entry(m.key.clone())
                        .or_default()
                        .extend(m.fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                RowAction::Delete => {
                    table.remove(&m.key);
                }
            }
        }
        self.commits.push(CommitRecord {
            label: label.to_string(),
            rows: mutations.len(),
            at: Utc::now(),
        });
        debug!(label, rows = mutations.len(), "committed batch");
        Ok(())
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("serializing store")
    }
}

pub struct MemoryUnitOfWork {
    label: String,
    store: SharedStore,
    pending: Vec<RowMutation>,
    active: bool,
    valid: bool,
    override_all: bool,
}

impl MemoryUnitOfWork {
    pub fn new(label: impl Into<String>, store: SharedStore) -> Self {
        Self {
            label: label.into(),
            store,
            pending: Vec::new(),
            active: true,
            valid: true,
            override_all: false,
        }
    }

    pub fn pending(&self) -> &[RowMutation] {
        &self.pending
    }
}

impl UnitOfWork for MemoryUnitOfWork {
    fn stage(&mut self, mutation: RowMutation) -> Result<()> {
        if !self.active {
            bail!("unit of work '{}' is not active", self.label);
        }
        if mutation.key.is_empty() {
            warn!(entity = %mutation.entity, "staged row has no key");
            self.valid = false;
        }
        self.pending.push(mutation);
        Ok(())
    }

    fn modified_row_count(&self) -> usize {
        self.pending.len()
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn is_active(&self) -> bool {
        self.active
    }

    fn set_override_all_validations(&mut self, on: bool) {
        self.override_all = on;
    }

    fn override_all_validations(&self) -> bool {
        self.override_all
    }

    fn save(&mut self) -> Result<()> {
        if !self.active {
            bail!("unit of work '{}' is not active", self.label);
        }
        if !self.valid {
            bail!("unit of work '{}' contains rows without a key", self.label);
        }
        self.store
            .borrow_mut()
            .apply(&self.label, &self.pending)
            .with_context(|| format!("saving '{}'", self.label))?;
        self.pending.clear();
        self.active = false;
        Ok(())
    }

    fn cancel(&mut self) {
        self.pending.clear();
        self.active = false;
    }
}

#[derive(Debug)]
struct GridRow {
    section: usize,
    prefix: String,
    fields: BTreeMap<String, String>,
}

struct ContextState {
    def: InteractionDef,
    store: SharedStore,
    key: Option<String>,
    values: BTreeMap<String, String>,
    rows: Vec<GridRow>,
    active: bool,
    saved: bool,
    errors: Vec<String>,
}

impl ContextState {
    fn new(def: InteractionDef, store: SharedStore, key: Option<&str>) -> Result<Self> {
        let key = key.filter(|k| !k.is_empty()).map(str::to_string);
        if def.mode == Mode::Update && key.is_none() {
            bail!("interaction {} needs a {}", def.id, params::PAGE_KEY);
        }
        Ok(Self {
            def,
            store,
            key,
            values: BTreeMap::new(),
            rows: Vec::new(),
            active: true,
            saved: false,
            errors: Vec::new(),
        })
    }

    fn accepts(&self, name: &str) -> bool {
        self.def.fields.is_empty()
            || self.def.fields.iter().any(|f| f == name)
            || self.def.key_field.as_deref() == Some(name)
    }

    fn save(&mut self, work: &mut dyn UnitOfWork) -> Result<()> {
        self.errors = self
            .def
            .required
            .iter()
            .filter(|f| self.values.get(*f).map_or(true, |v| v.trim().is_empty()))
            .map(|f| format!("{} is mandatory", f))
            .collect();
        if !self.errors.is_empty() {
            if work.override_all_validations() {
                debug!(interaction = %self.def.id, "validations overridden");
            } else {
                warn!(interaction = %self.def.id, errors = ?self.errors, "save failed validation");
                return Ok(());
            }
        }

        let key = match &self.key {
            Some(k) => k.clone(),
            None => match self
                .def
                .key_field
                .as_ref()
                .and_then(|f| self.values.get(f))
                .filter(|v| !v.is_empty())
            {
                Some(v) => v.clone(),
                None => self.store.borrow_mut().next_key(&self.def.entity),
            },
        };

        if self.def.mode == Mode::Create || !self.values.is_empty() {
            work.stage(RowMutation {
                action: match self.def.mode {
                    Mode::Create => RowAction::Create,
                    Mode::Update => RowAction::Update,
                },
                entity: self.def.entity.clone(),
                key: key.clone(),
                fields: self.values.clone(),
            })?;
        }

        for row in &self.rows {
            let section = &self.def.sections[row.section];
            let mut fields = row.fields.clone();
            if let Some(link) = &section.link_field {
                fields.insert(link.clone(), key.clone());
            }
            let row_key = self.store.borrow_mut().next_key(&section.entity);
            work.stage(RowMutation {
                action: RowAction::Create,
                entity: section.entity.clone(),
                key: row_key,
                fields,
            })?;
        }

        self.key = Some(key);
        self.active = false;
        self.saved = true;
        Ok(())
    }

    fn primary_key(&self) -> Option<String> {
        self.key.clone().or_else(|| {
            self.def
                .key_field
                .as_ref()
                .and_then(|f| self.values.get(f))
                .filter(|v| !v.is_empty())
                .cloned()
        })
    }

    fn add_row(&mut self, section_id: &str, seed: Option<&str>) -> Result<String> {
        let section = self
            .def
            .sections
            .iter()
            .position(|s| s.id == section_id)
            .ok_or_else(|| anyhow!("unrecognized section id: {}", section_id))?;
        let n = self.rows.iter().filter(|r| r.section == section).count();
        let prefix = format!("{}_{}_", section_id, n);
        let mut fields = BTreeMap::new();
        if let Some(seed) = seed {
            fields.insert(self.def.sections[section].add_row_field.clone(), seed.to_string());
        }
        self.rows.push(GridRow {
            section,
            prefix: prefix.clone(),
            fields,
        });
        Ok(prefix)
    }

    fn update(&mut self, incoming: &ParameterMap, work: &mut dyn UnitOfWork) -> Result<()> {
        if !self.active {
            bail!("interaction {} is no longer active", self.def.id);
        }
        for (name, value) in incoming {
            if params::is_reserved(name) {
                continue;
            }
            if let Some(row) = self.rows.iter_mut().find(|r| name.starts_with(&r.prefix)) {
                row.fields
                    .insert(name[row.prefix.len()..].to_string(), value.clone());
                continue;
            }
            if self.accepts(name) {
                self.values.insert(name.clone(), value.clone());
            } else {
                trace!(interaction = %self.def.id, param = %name, "ignoring unknown parameter");
            }
        }
        if incoming.get(params::PAGE_BUTTON).map(String::as_str) == Some(params::SAVE) {
            self.save(work)?;
        }
        Ok(())
    }

    fn cancel(&mut self) {
        self.active = false;
        self.saved = false;
    }
}

/// Handle to an open interaction; clones share the same state.
#[derive(Clone)]
pub struct MemoryContext {
    id: String,
    requested_key: Option<String>,
    state: Rc<RefCell<ContextState>>,
}

impl MemoryContext {
    /// Validation errors from the last save attempt.
    pub fn validation_errors(&self) -> Vec<String> {
        self.state.borrow().errors.clone()
    }

    fn is_for(&self, interaction_id: &str, key: Option<&str>) -> bool {
        self.id == interaction_id && self.requested_key.as_deref() == key
    }
}

impl InteractionContext for MemoryContext {
    fn interaction_id(&self) -> &str {
        &self.id
    }

    fn primary_key(&self) -> Option<String> {
        self.state.borrow().primary_key()
    }

    fn add_row(&mut self, section_id: &str, seed: Option<&str>) -> Result<String> {
        self.state.borrow_mut().add_row(section_id, seed)
    }

    fn update(&mut self, incoming: &ParameterMap, work: &mut dyn UnitOfWork) -> Result<()> {
        self.state.borrow_mut().update(incoming, work)
    }

    fn is_active(&self) -> bool {
        self.state.borrow().active
    }

    fn is_saved(&self) -> bool {
        self.state.borrow().saved
    }

    fn cancel(&mut self) {
        self.state.borrow_mut().cancel();
    }
}

pub struct MemorySession {
    user_id: String,
    store: SharedStore,
    model: Rc<AppModel>,
    messages: MessageLog,
    visits: usize,
    last_visit_start: Option<DateTime<Utc>>,
    contexts: Vec<MemoryContext>,
    open: bool,
}

impl MemorySession {
    pub fn new(user_id: impl Into<String>, store: SharedStore, model: Rc<AppModel>) -> Self {
        Self {
            user_id: user_id.into(),
            store,
            model,
            messages: MessageLog::new(),
            visits: 0,
            last_visit_start: None,
            contexts: Vec::new(),
            open: true,
        }
    }

    pub fn visits(&self) -> usize {
        self.visits
    }

    pub fn last_visit_start(&self) -> Option<DateTime<Utc>> {
        self.last_visit_start
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}

impl Session for MemorySession {
    type Context = MemoryContext;
    type Work = MemoryUnitOfWork;

    fn user_id(&self) -> &str {
        &self.user_id
    }

    /// Returns the still-active context for the same interaction and key when
    /// there is one, so consecutive records can build up one interaction.
    fn get_context(&mut self, interaction_id: &str, key: Option<&str>) -> Result<MemoryContext> {
        if !self.open {
            bail!("session for {} is closed", self.user_id);
        }
        let key = key.filter(|k| !k.is_empty());
        self.contexts.retain(|c| c.is_active());
        if let Some(existing) = self.contexts.iter().find(|c| c.is_for(interaction_id, key)) {
            trace!(interaction = interaction_id, "reusing active context");
            return Ok(existing.clone());
        }
        let def = self
            .model
            .interaction(interaction_id)
            .ok_or_else(|| anyhow!("unknown interaction: {}", interaction_id))?
            .clone();
        let ctx = MemoryContext {
            id: def.id.clone(),
            requested_key: key.map(str::to_string),
            state: Rc::new(RefCell::new(ContextState::new(def, self.store.clone(), key)?)),
        };
        self.contexts.push(ctx.clone());
        Ok(ctx)
    }

    fn new_unit_of_work(&mut self, label: &str) -> Result<MemoryUnitOfWork> {
        if !self.open {
            bail!("session for {} is closed", self.user_id);
        }
        Ok(MemoryUnitOfWork::new(label, self.store.clone()))
    }

    fn new_visit(&mut self, interaction_id: Option<&str>, note: &str) {
        self.visits += 1;
        debug!(
            user = %self.user_id,
            interaction = interaction_id.unwrap_or("-"),
            note,
            visit = self.visits,
            "new visit"
        );
    }

    fn update_visit(&mut self, started: DateTime<Utc>) {
        self.last_visit_start = Some(started);
    }

    fn messages(&mut self) -> &mut MessageLog {
        &mut self.messages
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.contexts.clear();
            self.store.borrow_mut().closed_sessions.push(self.user_id.clone());
        }
    }
}

pub struct MemorySessionFactory {
    store: SharedStore,
    model: Rc<AppModel>,
}

impl MemorySessionFactory {
    pub fn new(store: SharedStore, model: AppModel) -> Self {
        Self {
            store,
            model: Rc::new(model),
        }
    }

    pub fn store(&self) -> SharedStore {
        self.store.clone()
    }
}

impl SessionFactory for MemorySessionFactory {
    type Session = MemorySession;

    fn create(&mut self, user_id: &str) -> Result<MemorySession> {
        if user_id.trim().is_empty() {
            bail!("cannot create a session without a user id");
        }
        Ok(MemorySession::new(
            user_id,
            self.store.clone(),
            self.model.clone(),
        ))
    }
}
