//! CLI definition and command handling

pub mod commands;
pub mod output;

use std::path::PathBuf;

use anvil_core::config::{load_config_or_default, Config};
use clap::{Parser, Subcommand};

use commands::{CacheCommand, ExecCommand, InitCommand};

/// Anvil - content-addressed build task runner
#[derive(Debug, Parser)]
#[command(name = "anvil")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Suppress output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Working directory
    #[arg(short = 'C', long, global = true)]
    pub directory: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Output format for CLI
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output
    #[default]
    Text,
    /// JSON output
    Json,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Write a default anvil.toml
    Init(InitCommand),

    /// Run one command through the content-addressed cache
    Exec(ExecCommand),

    /// Inspect and maintain the local content store
    Cache(CacheCommand),
}

impl Cli {
    /// Execute the CLI command, returning the process exit code
    pub fn execute(self) -> anyhow::Result<i32> {
        // Change to specified directory if provided
        if let Some(dir) = &self.directory {
            std::env::set_current_dir(dir)?;
        }

        match self.command {
            Commands::Init(ref cmd) => cmd.execute(&self),
            Commands::Exec(ref cmd) => cmd.execute(&self),
            Commands::Cache(ref cmd) => cmd.execute(&self),
        }
    }

    /// Configuration for the current directory, with relative paths resolved
    pub fn load_config(&self) -> anyhow::Result<(Config, PathBuf)> {
        let cwd = std::env::current_dir()?;
        let (config, _) = load_config_or_default(&cwd);
        Ok((config, cwd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_exec() {
        let cli = Cli::try_parse_from([
            "anvil", "--format", "json", "exec", "--input", "a.c", "--output", "a.o", "--env",
            "LANG=C", "--", "cc", "-c", "a.c",
        ])
        .unwrap();
        assert_eq!(cli.format, OutputFormat::Json);
        let Commands::Exec(exec) = cli.command else {
            panic!("expected exec");
        };
        assert_eq!(exec.inputs, vec![PathBuf::from("a.c")]);
        assert_eq!(exec.outputs, vec![PathBuf::from("a.o")]);
        assert_eq!(exec.command, vec!["cc", "-c", "a.c"]);
    }

    #[test]
    fn test_parse_cache_clean() {
        let cli = Cli::try_parse_from(["anvil", "-q", "cache", "clean", "-y"]).unwrap();
        assert!(cli.quiet);
        assert!(matches!(cli.command, Commands::Cache(_)));
    }
}
