//! hotmount - hot-reload orchestrator for in-process plugin trees.

mod cli;

use anyhow::Result;
use clap::{ColorChoice, Parser};
use cli::{Cli, Commands};

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set global color override based on CLI option
    match cli.color {
        ColorChoice::Always => owo_colors::set_override(true),
        ColorChoice::Never => owo_colors::set_override(false),
        ColorChoice::Auto => {} // owo-colors auto-detects TTY
    }

    let (mut config, ignored) = cli::load_config(&cli.config)?;

    match &cli.command {
        Commands::Watch { args } => {
            cli::apply_overrides(&mut config, args)?;
            cli::watch::run(config, &ignored, args)
        }
    }
}
