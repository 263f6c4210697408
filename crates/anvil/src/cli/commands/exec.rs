//! Exec command - run one command through the content-addressed cache

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Args;
use console::style;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use anvil_cas::{CasOptions, SizeLimitingStrategy};
use anvil_core::config::Config;
use anvil_tasks::{
    process, CollectingOutputDelegate, CommandLineArgument, CommandResult, EnvironmentBindings,
    ExecutableTask, GenericCachingTaskAction, LocalExecutionDelegate, LocalScheduler,
    OperationContext, TaskAction, TaskCounter, TaskOutputDelegate,
};

use crate::cli::output::{self, ConsoleOutputDelegate};
use crate::cli::{Cli, OutputFormat};
use crate::exit_codes;

/// Variables passed through to the command unless overridden with --env
const INHERITED_VARIABLES: [&str; 3] = ["PATH", "HOME", "TMPDIR"];

/// Run one command through the content-addressed cache
#[derive(Debug, Args)]
pub struct ExecCommand {
    /// Files or directories the command reads (can be repeated)
    #[arg(long = "input", value_name = "PATH")]
    pub inputs: Vec<PathBuf>,

    /// Files or directories the command writes (can be repeated)
    #[arg(long = "output", value_name = "PATH")]
    pub outputs: Vec<PathBuf>,

    /// Environment binding for the command, KEY=VALUE (can be repeated)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_binding)]
    pub environment: Vec<(String, String)>,

    /// Command to run
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

fn parse_binding(value: &str) -> Result<(String, String), String> {
    match value.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got '{value}'")),
    }
}

impl ExecCommand {
    pub fn execute(&self, cli: &Cli) -> anyhow::Result<i32> {
        let runtime = tokio::runtime::Runtime::new()?;
        runtime.block_on(self.execute_async(cli))
    }

    async fn execute_async(&self, cli: &Cli) -> anyhow::Result<i32> {
        let (config, cwd) = cli.load_config()?;
        let task = self.task(&cwd);
        info!(task = %task.identifier, inputs = task.input_paths.len(), outputs = task.output_paths.len(), "executing command");

        if !config.caching.enabled {
            debug!("caching disabled, running command directly");
            return self.run_uncached(cli, &task).await;
        }

        let cas_options = CasOptions::from_config(&config.cas)?;
        let context = OperationContext::open(&cas_options)
            .with_context(|| format!("failed to open CAS at {}", cas_options.cas_path.display()))?;
        let action = caching_action(&config, cas_options.clone());

        let execution = LocalExecutionDelegate::new()
            .with_preferences(config.preferences.clone())
            .with_environment(task.environment.clone());
        let scheduler = LocalScheduler::new(context, Arc::new(execution))
            .with_concurrency(config.scheduler.concurrency);

        cancel_on_interrupt(scheduler.cancellation_token());

        let (result, cache_hit) = if cli.format == OutputFormat::Json {
            let collected = CollectingOutputDelegate::new();
            let report = scheduler.run(task, action, &collected).await;
            let cache_hit = collected.counter(TaskCounter::CacheHits) > 0;
            let json = serde_json::json!({
                "result": format!("{:?}", report.result).to_lowercase(),
                "cache_hit": cache_hit,
                "output": String::from_utf8_lossy(&collected.output()),
                "diagnostics": collected.diagnostics(),
            });
            println!("{}", serde_json::to_string_pretty(&json)?);
            (report.result, cache_hit)
        } else {
            let console = ConsoleOutputDelegate::new(cli.verbose);
            let report = scheduler.run(task, action, &console).await;
            (report.result, console.cache_hit())
        };

        if cas_options.limiting_strategy == SizeLimitingStrategy::Discarded {
            discard_store(&cas_options.cas_path)?;
        }

        if cli.format == OutputFormat::Text && !cli.quiet {
            report_result(result, cache_hit);
        }
        Ok(exit_codes::for_result(result))
    }

    /// The task for this invocation, with paths made absolute
    fn task(&self, cwd: &Path) -> ExecutableTask {
        let mut environment = EnvironmentBindings::new();
        for name in INHERITED_VARIABLES {
            if let Ok(value) = std::env::var(name) {
                environment.push(name, value);
            }
        }
        for (key, value) in &self.environment {
            environment.push(key.clone(), value.clone());
        }

        ExecutableTask::new(self.command.join(" "))
            .with_rule_info(["Exec", self.command[0].as_str()])
            .with_command_line(self.command.iter().map(|arg| CommandLineArgument::literal(arg)))
            .with_working_directory(cwd)
            .with_environment(environment)
            .with_inputs(self.inputs.iter().map(|p| cwd.join(p)).collect())
            .with_outputs(self.outputs.iter().map(|p| cwd.join(p)).collect())
    }

    async fn run_uncached(&self, cli: &Cli, task: &ExecutableTask) -> anyhow::Result<i32> {
        let console = ConsoleOutputDelegate::new(cli.verbose);
        let cancellation = CancellationToken::new();
        cancel_on_interrupt(cancellation.clone());
        let result = match process::spawn(
            &task.command_line_strings(),
            &task.environment,
            &task.working_directory,
            cancellation,
        )
        .await
        {
            Ok(finished) => {
                console.emit_output(&finished.stdout);
                console.emit_output(&finished.stderr);
                if finished.success() {
                    CommandResult::Succeeded
                } else {
                    CommandResult::Failed
                }
            }
            Err(anvil_tasks::TaskError::Cancelled) => CommandResult::Cancelled,
            Err(e) => return Err(e.into()),
        };
        Ok(exit_codes::for_result(result))
    }
}

fn caching_action(config: &Config, cas_options: CasOptions) -> Box<dyn TaskAction> {
    let sandbox = config
        .caching
        .sandbox_dir
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("anvil-sandbox"));
    let mut action = GenericCachingTaskAction::new(sandbox, cas_options)
        .with_debugging_remarks(config.caching.debugging_remarks)
        .with_sandbox_enforcement(config.caching.enforce_sandbox)
        .with_extra_subdirectories(config.caching.extra_sandbox_subdirectories.clone());
    if let Some(developer_dir) = &config.caching.developer_dir {
        action = action.with_developer_directory(developer_dir);
    }
    Box::new(action)
}

fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, cancelling");
            token.cancel();
        }
    });
}

/// Remove a store configured not to outlive the build
fn discard_store(path: &Path) -> anyhow::Result<()> {
    debug!(cas = %path.display(), "discarding CAS");
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to discard CAS at {}", path.display())),
    }
}

fn report_result(result: CommandResult, cache_hit: bool) {
    match result {
        CommandResult::Succeeded if cache_hit => {
            output::success(&format!("Replayed from cache {}", style("(hit)").dim()))
        }
        CommandResult::Succeeded => output::success("Command succeeded"),
        CommandResult::Failed => output::error("Command failed"),
        CommandResult::Cancelled => output::warning("Command cancelled"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_binding() {
        assert_eq!(parse_binding("LANG=C"), Ok(("LANG".to_string(), "C".to_string())));
        assert_eq!(parse_binding("EMPTY="), Ok(("EMPTY".to_string(), String::new())));
        assert_eq!(parse_binding("A=b=c"), Ok(("A".to_string(), "b=c".to_string())));
        assert!(parse_binding("=x").is_err());
        assert!(parse_binding("novalue").is_err());
    }

    #[test]
    fn test_task_paths_are_absolute() {
        let command = ExecCommand {
            inputs: vec![PathBuf::from("src/a.c")],
            outputs: vec![PathBuf::from("/abs/a.o")],
            environment: vec![("LANG".to_string(), "C".to_string())],
            command: vec!["cc".to_string(), "-c".to_string(), "src/a.c".to_string()],
        };
        let task = command.task(Path::new("/work"));
        assert_eq!(task.input_paths, vec![PathBuf::from("/work/src/a.c")]);
        assert_eq!(task.output_paths, vec![PathBuf::from("/abs/a.o")]);
        assert_eq!(task.environment.get("LANG"), Some("C"));
        assert_eq!(task.command_line_strings(), vec!["cc", "-c", "src/a.c"]);
        assert_eq!(task.identifier, "cc -c src/a.c");
    }

    #[test]
    fn test_discard_missing_store() {
        let temp = tempfile::TempDir::new().unwrap();
        discard_store(&temp.path().join("absent")).unwrap();
        std::fs::create_dir_all(temp.path().join("cas/objects")).unwrap();
        discard_store(&temp.path().join("cas")).unwrap();
        assert!(!temp.path().join("cas").exists());
    }
}
