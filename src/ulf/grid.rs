// src/ulf/grid.rs
use anyhow::Result;
use tracing::debug;

use crate::app::{params, InteractionContext, ParameterMap};

/// `page_button` prefix asking for a new row in the named section.
pub const ADD_ROW_BUTTON_PREFIX: &str = "list_add_";
/// Prefix of the parameter seeding the new row, followed by the section id.
pub const ADD_ROW_SEED_PREFIX: &str = "add_row_field_";
/// Parameter-name prefix standing for "the row just added".
pub const GRID_ROW_TOKEN: &str = "{grid_id}";

/// Add the grid row requested by `page_button`, if any, and point the
/// `{grid_id}` parameters at it.
///
/// Returns the new row's prefix. The button and seed parameters are removed so
/// they are not applied as ordinary fields.
pub fn expand_grid_row<C>(values: &mut ParameterMap, ctx: &mut C) -> Result<Option<String>>
where
    C: InteractionContext + ?Sized,
{
    let section = match values
        .get(params::PAGE_BUTTON)
        .and_then(|b| b.strip_prefix(ADD_ROW_BUTTON_PREFIX))
    {
        Some(section) => section.to_string(),
        None => return Ok(None),
    };
    let seed_param = format!("{}{}", ADD_ROW_SEED_PREFIX, section);
    let prefix = ctx.add_row(&section, values.get(&seed_param).map(String::as_str))?;
    values.shift_remove(&seed_param);
    values.shift_remove(params::PAGE_BUTTON);

    let generic: Vec<String> = values
        .keys()
        .filter(|name| name.starts_with(GRID_ROW_TOKEN))
        .cloned()
        .collect();
    for name in generic {
        if let Some(value) = values.shift_remove(&name) {
            values.insert(format!("{}{}", prefix, &name[GRID_ROW_TOKEN.len()..]), value);
        }
    }
    debug!(section = %section, prefix = %prefix, "added grid row");
    Ok(Some(prefix))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::UnitOfWork;
    use anyhow::bail;

    #[derive(Default)]
    struct Rows {
        added: Vec<(String, Option<String>)>,
    }

    impl InteractionContext for Rows {
        fn interaction_id(&self) -> &str {
            "rows"
        }
        fn primary_key(&self) -> Option<String> {
            None
        }
        fn add_row(&mut self, section: &str, seed: Option<&str>) -> Result<String> {
            if section != "lines" {
                bail!("unrecognized section id: {}", section);
            }
            self.added.push((section.to_string(), seed.map(str::to_string)));
            Ok(format!("lines_{}_", self.added.len() - 1))
        }
        fn update(&mut self, _: &ParameterMap, _: &mut dyn UnitOfWork) -> Result<()> {
            Ok(())
        }
        fn is_active(&self) -> bool {
            true
        }
        fn is_saved(&self) -> bool {
            false
        }
        fn cancel(&mut self) {}
    }

    fn map(pairs: &[(&str, &str)]) -> ParameterMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn rewrites_generic_row_parameters() -> Result<()> {
        let mut ctx = Rows::default();
        let mut values = map(&[
            ("page_button", "list_add_lines"),
            ("add_row_field_lines", "WIDGET"),
            ("{grid_id}qty", "4"),
            ("customer", "C1"),
        ]);
        let prefix = expand_grid_row(&mut values, &mut ctx)?;
        assert_eq!(prefix.as_deref(), Some("lines_0_"));
        assert_eq!(ctx.added, vec![("lines".to_string(), Some("WIDGET".to_string()))]);
        assert_eq!(values.len(), 2);
        assert_eq!(values["lines_0_qty"], "4");
        assert!(!values.contains_key("page_button"));
        assert!(!values.contains_key("add_row_field_lines"));
        Ok(())
    }

    #[test]
    fn other_buttons_are_left_alone() -> Result<()> {
        let mut ctx = Rows::default();
        let mut values = map(&[("page_button", "save"), ("{grid_id}qty", "4")]);
        assert_eq!(expand_grid_row(&mut values, &mut ctx)?, None);
        assert_eq!(values.len(), 2);
        assert!(ctx.added.is_empty());
        Ok(())
    }

    #[test]
    fn unknown_section_fails() {
        let mut ctx = Rows::default();
        let mut values = map(&[("page_button", "list_add_notes")]);
        assert!(expand_grid_row(&mut values, &mut ctx).is_err());
    }
}
