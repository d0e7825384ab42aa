use anyhow::Result;
use inquire::{Confirm, Select, Text};

use tbl_core::{CopyConfig, Node};

/// Asks before duplicating `root` and its subtree
pub fn confirm_copy(root: &Node, subtree_size: usize, suffix: Option<&str>) -> Result<bool> {
    let label = root.label.as_deref().unwrap_or("(no label)");
    let suffix = suffix.map_or_else(|| "auto".to_string(), |s| format!("-{}", s));
    let message = format!(
        "Duplicate '{}' ({} node(s)) with suffix {}?",
        label, subtree_size, suffix
    );

    let confirmed = Confirm::new(&message).with_default(true).prompt()?;
    Ok(confirmed)
}

/// Asks before replacing the database contents
pub fn confirm_import(path: &str) -> Result<bool> {
    let confirmed = Confirm::new(&format!("Replace the contents of {} with the import?", path))
        .with_default(false)
        .prompt()?;
    Ok(confirmed)
}

/// Prompts for every config value, starting from `defaults`
pub fn prompt_config(defaults: &CopyConfig) -> Result<CopyConfig> {
    let clone_external_parents = Confirm::new("Clone parents outside the copied subtree?")
        .with_default(defaults.clone_external_parents)
        .prompt()?;

    let preserve_shared_references = Confirm::new("Keep shared-reference fields on copies?")
        .with_default(defaults.preserve_shared_references)
        .prompt()?;

    let create_display_nodes = Confirm::new("Create display nodes for copied variables?")
        .with_default(defaults.create_display_nodes)
        .prompt()?;

    let atomic = Confirm::new("Save each copy in a single write?")
        .with_default(defaults.atomic)
        .prompt()?;

    let filter_options = vec!["error", "warn", "info", "debug", "trace"];
    let starting = filter_options
        .iter()
        .position(|f| *f == defaults.log_filter)
        .unwrap_or(2);
    let log_filter = Select::new("Log level:", filter_options)
        .with_starting_cursor(starting)
        .prompt()?
        .to_string();

    let current_db = defaults.database_path().to_string_lossy().to_string();
    let database_input = Text::new("Database path:").with_default(&current_db).prompt()?;
    let database_path = if database_input.trim().is_empty() {
        None
    } else {
        Some(database_input.trim().to_string())
    };

    Ok(CopyConfig {
        clone_external_parents,
        preserve_shared_references,
        create_display_nodes,
        atomic,
        log_filter,
        database_path,
    })
}
