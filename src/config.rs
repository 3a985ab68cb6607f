// src/config.rs
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

/// Settings consumed by the processing loop, the CSV reader and the batch controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProcessorConfig {
    /// Modified-row threshold at which the open unit-of-work is saved.
    pub batch_size: usize,
    /// Abort at the next record boundary once an error has been recorded.
    pub stop_at_error: bool,
    /// Stop once more than this many logical records have been processed.
    pub line_limit: Option<usize>,
    /// Column headings expected in the first record, checked positionally.
    pub expected_header: Option<Vec<String>>,
    /// Passed through to every unit-of-work the batch controller opens.
    pub override_all_validations: bool,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            stop_at_error: true,
            line_limit: None,
            expected_header: None,
            override_all_validations: false,
        }
    }
}

impl ProcessorConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let cfg: ProcessorConfig =
            serde_yaml::from_str(yaml).context("parsing processor config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("in config file {}", path.display()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be at least 1");
        }
        Ok(())
    }
}
