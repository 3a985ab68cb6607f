// src/ulf/keys.rs
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use std::collections::BTreeMap;
use tracing::debug;

use crate::{app::ParameterMap, error::ReplayError};

/// `{key:<line>}`: the key generated by the record at that line.
static KEY_REF: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\{key:([0-9]*)\}").expect("key reference pattern should be valid"));

/// Replaced by the key of the record the current interaction is positioned on.
pub const CURRENT_KEY_TOKEN: &str = "{curr_page_key}";

/// Keys generated during one run, by the line number that produced them.
#[derive(Debug, Default, Clone)]
pub struct KeyRegistry {
    keys: BTreeMap<usize, String>,
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, line: usize, key: String) {
        debug!("Setting {{key:{}}} to {}", line, key);
        self.keys.insert(line, key);
    }

    pub fn get(&self, line: usize) -> Option<&str> {
        self.keys.get(&line).map(String::as_str)
    }

    /// Look up the digits captured from a `{key:..}` token.
    fn lookup(&self, reference: &str) -> Option<&str> {
        reference.parse::<usize>().ok().and_then(|n| self.get(n))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// Replace every `{key:N}` in every value with the key registered for line N.
///
/// Each token resolves independently, so one value may reference several
/// lines. Any reference without a registered key fails the whole record.
pub fn resolve_forward_keys(
    values: &mut ParameterMap,
    registry: &KeyRegistry,
    line: usize,
) -> Result<(), ReplayError> {
    for (param, value) in values.iter_mut() {
        if !KEY_REF.is_match(value) {
            continue;
        }
        if let Some(missing) = KEY_REF
            .captures_iter(value)
            .map(|caps| caps.get(1).map_or("", |m| m.as_str()))
            .find(|reference| registry.lookup(reference).is_none())
        {
            return Err(ReplayError::UnresolvedKey {
                line,
                reference: missing.to_string(),
            });
        }
        let resolved = KEY_REF
            .replace_all(value, |caps: &Captures| {
                registry.lookup(&caps[1]).unwrap_or_default().to_string()
            })
            .into_owned();
        debug!(param = %param, value = %resolved, "replaced {{key}} references");
        *value = resolved;
    }
    Ok(())
}

/// Put `key` in place of [`CURRENT_KEY_TOKEN`] in values and in parameter names.
///
/// A renamed parameter overwrites any parameter already holding the new name.
pub fn substitute_current_key(values: &mut ParameterMap, key: &str) {
    let names: Vec<String> = values.keys().cloned().collect();
    for name in names {
        if let Some(value) = values.get_mut(&name) {
            if value.contains(CURRENT_KEY_TOKEN) {
                *value = value.replace(CURRENT_KEY_TOKEN, key);
            }
        }
        if name.contains(CURRENT_KEY_TOKEN) {
            if let Some(value) = values.shift_remove(&name) {
                values.insert(name.replace(CURRENT_KEY_TOKEN, key), value);
            }
        }
    }
}
