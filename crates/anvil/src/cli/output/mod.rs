//! Output formatting utilities

use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};

use anvil_core::Signature;
use anvil_tasks::delegates::{Diagnostic, DiagnosticBehavior, TaskCounter, TaskOutputDelegate};
use anvil_tasks::ConfiguredTarget;
use console::style;

/// Print a success message
pub fn success(message: &str) {
    println!("{} {}", style("✓").green().bold(), message);
}

/// Print an error message
pub fn error(message: &str) {
    eprintln!("{} {}", style("✗").red().bold(), message);
}

/// Print a warning message
pub fn warning(message: &str) {
    println!("{} {}", style("!").yellow().bold(), message);
}

/// Streams task output to the terminal as it arrives.
///
/// Process output goes to stdout untouched; diagnostics go to stderr.
/// Remarks are shown only when verbose.
#[derive(Debug, Default)]
pub struct ConsoleOutputDelegate {
    verbose: bool,
    cache_hits: AtomicUsize,
}

impl ConsoleOutputDelegate {
    pub fn new(verbose: bool) -> Self {
        Self {
            verbose,
            cache_hits: AtomicUsize::new(0),
        }
    }

    pub fn cache_hit(&self) -> bool {
        self.cache_hits.load(Ordering::SeqCst) > 0
    }
}

impl TaskOutputDelegate for ConsoleOutputDelegate {
    fn emit_diagnostic(&self, diagnostic: Diagnostic) {
        let prefix = match diagnostic.behavior {
            DiagnosticBehavior::Error => style("error:").red().bold(),
            DiagnosticBehavior::Warning => style("warning:").yellow().bold(),
            DiagnosticBehavior::Note => style("note:").blue(),
            DiagnosticBehavior::Remark if self.verbose => style("remark:").dim(),
            DiagnosticBehavior::Remark => return,
        };
        match &diagnostic.location {
            Some(path) => eprintln!("{}: {} {}", path.display(), prefix, diagnostic.message),
            None => eprintln!("{} {}", prefix, diagnostic.message),
        }
    }

    fn emit_output(&self, bytes: &[u8]) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(bytes);
        let _ = stdout.flush();
    }

    fn increment_task_counter(&self, counter: TaskCounter) {
        if matches!(counter, TaskCounter::CacheHits | TaskCounter::CompilationCacheHits) {
            self.cache_hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn subtask_up_to_date(&self, rule_info: &[String], _signature: &Signature) {
        if self.verbose {
            eprintln!("{} {} up to date", style("→").blue(), rule_info.join(" "));
        }
    }

    fn previously_batched_subtask_up_to_date(&self, signature: &Signature, target: &ConfiguredTarget) {
        if self.verbose {
            eprintln!("{} {} {} up to date", style("→").blue(), target, signature.short());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counts_cache_hits() {
        let output = ConsoleOutputDelegate::new(false);
        assert!(!output.cache_hit());
        output.increment_task_counter(TaskCounter::CacheMisses);
        assert!(!output.cache_hit());
        output.increment_task_counter(TaskCounter::CacheHits);
        assert!(output.cache_hit());
    }
}
