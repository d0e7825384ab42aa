use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[clap(
    author,
    version,
    about = "Duplicate tree/branch/leaf subtrees along with their capacities and variables"
)]
pub struct Cli {
    /// Path to the tree database (.yaml, .yml, .db, .sqlite)
    #[clap(long)]
    pub db: Option<PathBuf>,

    #[clap(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum DbCommand {
    /// Copy a database into another backend (YAML <-> SQLite)
    Migrate {
        /// Target database path; the backend is inferred from the extension
        #[clap(long)]
        to: PathBuf,
    },

    /// Export the database as JSON
    Export {
        /// Output file
        #[clap(long, short = 'o')]
        output: PathBuf,
    },

    /// Replace the database contents with a JSON export
    Import {
        /// JSON file produced by `tbl db export`
        #[clap(long, short = 'i')]
        input: PathBuf,

        /// Skip the confirmation prompt
        #[clap(long, short = 'y')]
        yes: bool,
    },

    /// Print row counts per collection
    Stats,
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Show the effective configuration
    Show,

    /// Write a config file
    Init {
        /// Use interactive mode (prompts)
        #[clap(long)]
        interactive: bool,

        /// Overwrite an existing config file
        #[clap(long)]
        force: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Deep-copy a node, its subtree and everything attached to it
    Copy {
        /// Id of the root node to duplicate
        node_id: String,

        /// Suffix for the copied ids (default: next free number)
        #[clap(long)]
        suffix: Option<String>,

        /// Attach the copied root under this node
        #[clap(long, conflicts_with = "top_level")]
        parent: Option<String>,

        /// Make the copied root a top-level node
        #[clap(long)]
        top_level: bool,

        /// Clone parents outside the subtree instead of referencing them
        #[clap(long)]
        clone_external_parents: bool,

        /// Keep shared-reference fields on copied nodes
        #[clap(long)]
        preserve_shared_refs: bool,

        /// Never synthesize display nodes for copied variables
        #[clap(long)]
        no_display_nodes: bool,

        /// Write directly to the database instead of saving once at the end
        #[clap(long)]
        best_effort: bool,

        /// Skip the confirmation prompt
        #[clap(long, short = 'y')]
        yes: bool,
    },

    /// Show a subtree in creation order
    Tree {
        /// Root node id
        node_id: String,
    },

    /// Show the link indexes of a node
    Links {
        /// Node id
        node_id: String,
    },

    /// Recompute link indexes for one capacity (e.g. formula:f1, @table.t1)
    Relink {
        /// Capacity reference in any accepted spelling
        reference: String,
    },

    /// Database commands
    #[clap(subcommand)]
    Db(DbCommand),

    /// Configuration commands
    #[clap(subcommand)]
    Config(ConfigCommand),
}
