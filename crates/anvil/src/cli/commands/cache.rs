//! Cache management command

use std::path::Path;
use std::sync::Arc;

use clap::{Args, Subcommand};
use console::style;
use tracing::info;

use anvil_cas::{format_size, CasOptions, CasPruner, ContentStore, OnDiskCas, SizeLimitingStrategy};

use crate::cli::{Cli, OutputFormat};
use crate::exit_codes;

/// Content store management
#[derive(Debug, Args)]
pub struct CacheCommand {
    #[command(subcommand)]
    pub action: CacheAction,
}

/// Cache subcommands
#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Show store statistics
    Status(CacheStatusCommand),
    /// Apply the configured size limit now
    Prune(CachePruneCommand),
    /// Remove every object and cache entry
    Clean(CacheCleanCommand),
}

/// Show store statistics
#[derive(Debug, Args)]
pub struct CacheStatusCommand;

/// Apply the configured size limit now
#[derive(Debug, Args)]
pub struct CachePruneCommand;

/// Remove every object and cache entry
#[derive(Debug, Args)]
pub struct CacheCleanCommand {
    /// Skip confirmation
    #[arg(short = 'y', long)]
    pub yes: bool,
}

impl CacheCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        let (config, _) = cli.load_config()?;
        let options = CasOptions::from_config(&config.cas)?;
        info!(cas = %options.cas_path.display(), "executing cache command");

        match &self.action {
            CacheAction::Status(cmd) => cmd.execute(cli, &options),
            CacheAction::Prune(cmd) => cmd.execute(cli, &options),
            CacheAction::Clean(cmd) => cmd.execute(cli, &options),
        }?;
        Ok(exit_codes::SUCCESS)
    }
}

fn describe_limit(strategy: SizeLimitingStrategy) -> String {
    match strategy {
        SizeLimitingStrategy::Discarded => "discarded after each build".to_string(),
        SizeLimitingStrategy::MaxSizeBytes(None) => "unlimited".to_string(),
        SizeLimitingStrategy::MaxSizeBytes(Some(bytes)) => format_size(bytes),
        SizeLimitingStrategy::MaxPercentageOfAvailableSpace(percent) => {
            format!("{percent}% of available space")
        }
    }
}

fn store_exists(path: &Path) -> bool {
    path.join("objects").is_dir()
}

impl CacheStatusCommand {
    fn execute(&self, cli: &Cli, options: &CasOptions) -> anyhow::Result<()> {
        let runtime = tokio::runtime::Runtime::new()?;
        let stats = if store_exists(&options.cas_path) {
            let store = OnDiskCas::open(&options.cas_path)?;
            Some(runtime.block_on(store.stats())?)
        } else {
            None
        };

        if cli.format == OutputFormat::Json {
            let result = serde_json::json!({
                "cas_path": options.cas_path.display().to_string(),
                "exists": stats.is_some(),
                "objects": stats.as_ref().map(|s| s.objects),
                "cache_entries": stats.as_ref().map(|s| s.cache_entries),
                "total_size": stats.as_ref().map(|s| s.total_size),
                "size_limit": describe_limit(options.limiting_strategy),
                "remote": options.remote_service_path.as_ref().map(|p| p.display().to_string()),
            });
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            println!("{}", style("CAS Status").bold());
            println!();
            println!("  Location: {}", style(options.cas_path.display()).cyan());
            match &stats {
                Some(stats) => {
                    println!("  Objects:  {}", stats.objects);
                    println!("  Entries:  {}", stats.cache_entries);
                    println!("  Size:     {}", style(stats.formatted_size()).yellow());
                }
                None => println!("  {}", style("(no store yet)").dim()),
            }
            println!("  Limit:    {}", describe_limit(options.limiting_strategy));
            if let Some(remote) = &options.remote_service_path {
                println!("  Remote:   {}", style(remote.display()).cyan());
            }
        }

        Ok(())
    }
}

impl CachePruneCommand {
    fn execute(&self, cli: &Cli, options: &CasOptions) -> anyhow::Result<()> {
        if !store_exists(&options.cas_path) {
            if !cli.quiet {
                println!("{} No store to prune.", style("✓").green());
            }
            return Ok(());
        }

        if !cli.quiet && cli.format == OutputFormat::Text {
            println!(
                "{} Pruning {} (limit: {})...",
                style("→").blue(),
                style(options.cas_path.display()).cyan(),
                describe_limit(options.limiting_strategy)
            );
        }

        let runtime = tokio::runtime::Runtime::new()?;
        let reports = runtime.block_on(async {
            let store: Arc<dyn ContentStore> = Arc::new(OnDiskCas::open(&options.cas_path)?);
            let pruner = CasPruner::new();
            pruner.prune_cas(store, options);
            anyhow::Ok(pruner.wait_for_completion().await)
        })?;

        if cli.format == OutputFormat::Json {
            let result: Vec<_> = reports
                .iter()
                .map(|report| {
                    serde_json::json!({
                        "cas_path": report.cas_path.display().to_string(),
                        "size": report.db_size,
                        "size_limit": report.size_limit,
                        "notes": report.notes,
                        "error": report.error,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&result)?);
        } else if !cli.quiet {
            if reports.is_empty() {
                println!("  {} Pruning is disabled for this store", style("!").yellow());
            }
            for report in &reports {
                for note in &report.notes {
                    println!("  {} {}", style("note:").blue(), note);
                }
                match &report.error {
                    Some(error) => println!("  {} {}", style("✗").red(), error),
                    None => println!(
                        "  {} Store is {} (limit {})",
                        style("✓").green(),
                        report.db_size.map(format_size).unwrap_or_else(|| "unknown".to_string()),
                        report.size_limit.map(format_size).unwrap_or_else(|| "none".to_string()),
                    ),
                }
            }
        }

        if let Some(error) = reports.iter().find_map(|r| r.error.as_ref()) {
            anyhow::bail!("pruning failed: {error}");
        }
        Ok(())
    }
}

impl CacheCleanCommand {
    fn execute(&self, cli: &Cli, options: &CasOptions) -> anyhow::Result<()> {
        let cas_path = &options.cas_path;

        if !store_exists(cas_path) {
            if !cli.quiet {
                println!("{} Store does not exist.", style("✓").green());
            }
            return Ok(());
        }

        if !self.yes {
            let confirmed = dialoguer::Confirm::new()
                .with_prompt(format!("Remove all objects and cache entries at {}?", cas_path.display()))
                .default(false)
                .interact()?;

            if !confirmed {
                println!("{}", style("Aborted.").yellow());
                return Ok(());
            }
        }

        OnDiskCas::open(cas_path)?.clean()?;

        if !cli.quiet {
            println!(
                "{} Store cleaned at {}",
                style("✓").green(),
                style(cas_path.display()).cyan()
            );
        }

        Ok(())
    }
}
