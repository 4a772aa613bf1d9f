//! Command-line interface definitions.

use clap::{ColorChoice, Parser, Subcommand};
use std::path::PathBuf;

/// Hot-reload orchestrator for TOML plugin trees
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None, arg_required_else_help = true)]
pub struct Cli {
    /// Control colored output (auto, always, never)
    #[arg(long, global = true, default_value = "auto")]
    pub color: ColorChoice,

    /// Config file path (default: hotmount.toml)
    #[arg(short = 'C', long, global = true, default_value = "hotmount.toml", value_hint = clap::ValueHint::FilePath)]
    pub config: PathBuf,

    /// subcommands
    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Mount every plugin under the watch roots and reload them on change
    #[command(visible_alias = "w")]
    Watch {
        #[command(flatten)]
        args: WatchArgs,
    },
}

/// Watch command arguments.
#[derive(clap::Args, Debug, Clone)]
pub struct WatchArgs {
    /// Watch root (repeatable). Replaces `dirs` from the config file
    #[arg(short, long = "dir", value_name = "DIR", value_hint = clap::ValueHint::DirPath)]
    pub dirs: Vec<PathBuf>,

    /// Watched extension without the dot (repeatable)
    #[arg(short, long = "ext", value_name = "EXT")]
    pub extensions: Vec<String>,

    /// Debounce window in milliseconds
    #[arg(long, value_name = "MS")]
    pub debounce: Option<u64>,

    /// Enable verbose output for debugging
    #[arg(short, long)]
    pub verbose: bool,

    /// Print performance stats as JSON on exit
    #[arg(long)]
    pub stats: bool,
}
