mod cli;
mod prompts;

use anyhow::{Context, Result};
use clap::Parser;
use colored::*;
use std::collections::HashMap;
use std::path::Path;
use tracing_subscriber::EnvFilter;

use tbl_core::db::{copy_store, export_backend_to_json, import_json_to_backend};
use tbl_core::{
    collect_subtree_ids, deep_copy, deep_copy_atomically, get_config_path, open_or_create,
    order_creation, CapacityRef, CopyConfig, DatabaseStats, DeepCopyOptions, DeepCopyResult,
    LinkIndexMaintainer, Node, NodeFilter, RootParent, TeeSink, TreeBackend,
};

use cli::{Cli, Command, ConfigCommand, DbCommand};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = get_config_path()?;
    let config = CopyConfig::load(&config_path)?;
    init_tracing(&config.log_filter);

    let db_path = cli.db.clone().unwrap_or_else(|| config.database_path());
    let open_backend = || -> Result<Box<dyn TreeBackend>> {
        let backend = open_or_create(&db_path, None)
            .with_context(|| format!("Failed to open database: {:?}", db_path))?;
        tracing::debug!(
            target: "tbl::cli",
            path = %db_path.display(),
            backend = %backend.backend_type(),
            "opened database"
        );
        Ok(backend)
    };

    match &cli.command {
        Command::Copy {
            node_id,
            suffix,
            parent,
            top_level,
            clone_external_parents,
            preserve_shared_refs,
            no_display_nodes,
            best_effort,
            yes,
        } => {
            let mut options = config.deep_copy_options();
            options.suffix = suffix.clone();
            options.root_parent = match (parent, top_level) {
                (Some(parent_id), _) => RootParent::Under(parent_id.clone()),
                (None, true) => RootParent::TopLevel,
                (None, false) => RootParent::Source,
            };
            options.clone_external_parents |= *clone_external_parents;
            options.preserve_shared_references |= *preserve_shared_refs;
            if *no_display_nodes {
                options.create_display_nodes = false;
            }
            let atomic = config.atomic && !*best_effort;
            handle_copy_command(open_backend()?.as_ref(), node_id, &options, atomic, *yes)?;
        }
        Command::Tree { node_id } => {
            handle_tree_command(open_backend()?.as_ref(), node_id)?;
        }
        Command::Links { node_id } => {
            handle_links_command(open_backend()?.as_ref(), node_id)?;
        }
        Command::Relink { reference } => {
            handle_relink_command(open_backend()?.as_ref(), reference)?;
        }
        Command::Db(cmd) => {
            handle_db_command(cmd, open_backend()?.as_ref())?;
        }
        Command::Config(cmd) => {
            handle_config_command(cmd, &config, &config_path)?;
        }
    }

    Ok(())
}

fn init_tracing(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn find_node_or_bail(backend: &dyn TreeBackend, node_id: &str) -> Result<Node> {
    backend
        .find_node(node_id)?
        .with_context(|| format!("Node '{}' not found", node_id))
}

fn handle_copy_command(
    backend: &dyn TreeBackend,
    node_id: &str,
    options: &DeepCopyOptions,
    atomic: bool,
    skip_confirm: bool,
) -> Result<()> {
    let root = find_node_or_bail(backend, node_id)?;

    if !skip_confirm {
        let tree_nodes = backend.find_nodes(&NodeFilter::in_tree(root.tree_id.clone()))?;
        let subtree_size = collect_subtree_ids(node_id, &tree_nodes).len();
        if !prompts::confirm_copy(&root, subtree_size, options.suffix.as_deref())? {
            println!("{}", "Copy cancelled.".yellow());
            return Ok(());
        }
    }

    let sink = TeeSink::default();
    let result = if atomic {
        deep_copy_atomically(backend, &sink, node_id, options)?
    } else {
        deep_copy(backend, &sink, node_id, options)?
    };

    print_copy_result(&result);

    let recoveries = sink.recording.count_where(|event| event.is_recovery());
    if recoveries > 0 {
        println!(
            "{} {} recovery event(s) during the pass (see log output)",
            "!".yellow(),
            recoveries
        );
    }

    Ok(())
}

fn print_copy_result(result: &DeepCopyResult) {
    let marker = if result.is_complete() { "✓".green() } else { "!".yellow() };
    println!(
        "{} Copied {} -> {} (suffix -{})",
        marker,
        result.root.old_id.cyan(),
        result.root.new_id.cyan().bold(),
        result.suffix
    );
    println!("{} {}", "Pass:".blue().bold(), result.pass_id);

    print_id_map("Nodes", &result.node_id_map);
    print_id_map("Formulas", &result.formula_id_map);
    print_id_map("Conditions", &result.condition_id_map);
    print_id_map("Tables", &result.table_id_map);

    if !result.display_node_ids.is_empty() {
        println!("\n{}", "Display nodes:".blue().bold());
        for id in &result.display_node_ids {
            println!("  {}", id);
        }
    }

    if !result.failures.is_empty() {
        println!("\n{}", "Failed copies:".red().bold());
        for failure in &result.failures {
            println!("  {} {}: {}", "✗".red(), failure.reference, failure.reason);
        }
    }
}

fn print_id_map(title: &str, map: &HashMap<String, String>) {
    if map.is_empty() {
        return;
    }
    println!("\n{}", format!("{} ({}):", title, map.len()).blue().bold());
    let mut entries: Vec<_> = map.iter().collect();
    entries.sort();
    for (old_id, new_id) in entries {
        println!("  {} -> {}", old_id, new_id.green());
    }
}

fn handle_tree_command(backend: &dyn TreeBackend, node_id: &str) -> Result<()> {
    let root = find_node_or_bail(backend, node_id)?;
    let tree_nodes = backend.find_nodes(&NodeFilter::in_tree(root.tree_id.clone()))?;
    let ids = collect_subtree_ids(node_id, &tree_nodes);
    let by_id: HashMap<String, Node> = tree_nodes.into_iter().map(|n| (n.id.clone(), n)).collect();
    let order = order_creation(&ids, &by_id);

    println!("{} {}", "Tree:".blue().bold(), root.tree_id);
    for id in &order.ids {
        let Some(node) = by_id.get(id) else { continue };
        let depth = depth_below(node, node_id, &by_id);
        let label = node.label.as_deref().unwrap_or("");
        println!(
            "{}{} {} {}",
            "  ".repeat(depth),
            id.cyan(),
            format!("[{}]", node.node_type).dimmed(),
            label
        );
    }

    if !order.is_clean() {
        println!(
            "\n{} Out-of-order nodes: {}",
            "!".yellow(),
            order.anomalies.join(", ")
        );
    }

    Ok(())
}

fn depth_below(node: &Node, root_id: &str, by_id: &HashMap<String, Node>) -> usize {
    let mut depth = 0;
    let mut current = node;
    while current.id != root_id {
        match current.parent_id.as_deref().and_then(|p| by_id.get(p)) {
            Some(parent) if depth < by_id.len() => {
                depth += 1;
                current = parent;
            }
            _ => break,
        }
    }
    depth
}

fn handle_links_command(backend: &dyn TreeBackend, node_id: &str) -> Result<()> {
    let node = find_node_or_bail(backend, node_id)?;

    println!("{} {}", "Node:".blue().bold(), node.id);
    print_link_list("Formulas", &node.linked_formula_ids);
    print_link_list("Conditions", &node.linked_condition_ids);
    print_link_list("Tables", &node.linked_table_ids);
    print_link_list("Variables", &node.linked_variable_ids);
    Ok(())
}

fn print_link_list(title: &str, ids: &[String]) {
    if ids.is_empty() {
        println!("  {} {}", format!("{}:", title).bold(), "(none)".dimmed());
    } else {
        println!("  {} {}", format!("{}:", title).bold(), ids.join(", "));
    }
}

fn handle_relink_command(backend: &dyn TreeBackend, reference: &str) -> Result<()> {
    let capacity = CapacityRef::parse(reference)
        .with_context(|| format!("Not a capacity reference: '{}'", reference))?;

    let sink = TeeSink::default();
    let linked = LinkIndexMaintainer::new(backend, &sink).link_capacity(&capacity)?;

    if linked.is_empty() {
        println!("{} No nodes reference {}", "!".yellow(), capacity);
    } else {
        println!("{} Linked {} to {} node(s):", "✓".green(), capacity, linked.len());
        for id in &linked {
            println!("  {}", id);
        }
    }
    Ok(())
}

fn handle_db_command(cmd: &DbCommand, backend: &dyn TreeBackend) -> Result<()> {
    match cmd {
        DbCommand::Migrate { to } => {
            let target = open_or_create(to, None)
                .with_context(|| format!("Failed to open target database: {:?}", to))?;
            let stats = copy_store(backend, target.as_ref())?;
            println!(
                "{} Migrated {} ({}) -> {} ({})",
                "✓".green(),
                backend.path().display(),
                backend.backend_type(),
                to.display(),
                target.backend_type()
            );
            print_stats(&stats);
        }
        DbCommand::Export { output } => {
            export_backend_to_json(backend, output)?;
            println!("{} Exported to {}", "✓".green(), output.display());
        }
        DbCommand::Import { input, yes } => {
            if !*yes && !prompts::confirm_import(&backend.path().display().to_string())? {
                println!("{}", "Import cancelled.".yellow());
                return Ok(());
            }
            let stats = import_json_to_backend(input, backend)?;
            println!("{} Imported {}", "✓".green(), input.display());
            print_stats(&stats);
        }
        DbCommand::Stats => {
            println!("{} {}", "Database:".blue().bold(), backend.path().display());
            print_stats(&backend.stats()?);
        }
    }
    Ok(())
}

fn print_stats(stats: &DatabaseStats) {
    println!("  {} {}", "Backend:".bold(), stats.backend_type);
    println!("  {} {}", "Nodes:".bold(), stats.node_count);
    println!("  {} {}", "Formulas:".bold(), stats.formula_count);
    println!("  {} {}", "Conditions:".bold(), stats.condition_count);
    println!("  {} {}", "Tables:".bold(), stats.table_count);
    println!("  {} {}", "Variables:".bold(), stats.variable_count);
}

fn handle_config_command(
    cmd: &ConfigCommand,
    config: &CopyConfig,
    config_path: &Path,
) -> Result<()> {
    match cmd {
        ConfigCommand::Show => {
            println!("{} {}", "Config file:".blue().bold(), config_path.display());
            if !config_path.exists() {
                println!("  {}", "(not found, showing defaults)".dimmed());
            }
            println!("  clone_external_parents: {}", config.clone_external_parents);
            println!("  preserve_shared_references: {}", config.preserve_shared_references);
            println!("  create_display_nodes: {}", config.create_display_nodes);
            println!("  atomic: {}", config.atomic);
            println!("  log_filter: {}", config.log_filter);
            println!("  database_path: {}", config.database_path().display());
        }
        ConfigCommand::Init { interactive, force } => {
            if config_path.exists() && !*force {
                println!(
                    "{} Config already exists at {} (use --force to overwrite)",
                    "!".yellow(),
                    config_path.display()
                );
                return Ok(());
            }
            let new_config = if *interactive {
                prompts::prompt_config(config)?
            } else {
                CopyConfig::default()
            };
            new_config.save(config_path)?;
            println!("{} Wrote {}", "✓".green(), config_path.display());
        }
    }
    Ok(())
}
