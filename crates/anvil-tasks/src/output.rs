//! Output delegates
//!
//! [`TracingOutputDelegate`] forwards everything to `tracing`,
//! [`CollectingOutputDelegate`] records it for later inspection, and
//! [`CapturingOutputDelegate`] records what a process produced while passing
//! it through, so that the caching executor can store it with a result.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use anvil_core::{ByteString, Signature};

use crate::delegates::{Diagnostic, DiagnosticBehavior, TaskCounter, TaskOutputDelegate};
use crate::task::ConfiguredTarget;

/// Something a task reported
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Diagnostic(Diagnostic),
    Output(Vec<u8>),
    Counter(TaskCounter),
    SubtaskUpToDate {
        rule_info: Vec<String>,
        signature: Signature,
    },
    PreviouslyBatchedSubtaskUpToDate {
        signature: Signature,
        target: ConfiguredTarget,
    },
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Output delegate that logs to tracing
#[derive(Debug, Default)]
pub struct TracingOutputDelegate {
    task: String,
}

impl TracingOutputDelegate {
    pub fn new(task: impl Into<String>) -> Self {
        Self { task: task.into() }
    }
}

impl TaskOutputDelegate for TracingOutputDelegate {
    fn emit_diagnostic(&self, diagnostic: Diagnostic) {
        let task = &self.task;
        match diagnostic.behavior {
            DiagnosticBehavior::Error => tracing::error!(task = %task, "{}", diagnostic),
            DiagnosticBehavior::Warning => tracing::warn!(task = %task, "{}", diagnostic),
            DiagnosticBehavior::Note => tracing::info!(task = %task, "{}", diagnostic),
            DiagnosticBehavior::Remark => tracing::debug!(task = %task, "{}", diagnostic),
        }
    }

    fn emit_output(&self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        for line in String::from_utf8_lossy(bytes).lines() {
            tracing::info!(task = %self.task, "{}", line);
        }
    }

    fn increment_task_counter(&self, counter: TaskCounter) {
        tracing::debug!(task = %self.task, counter = ?counter, "counter incremented");
    }

    fn subtask_up_to_date(&self, rule_info: &[String], signature: &Signature) {
        tracing::info!(
            task = %self.task,
            signature = %signature.short(),
            "{} up to date",
            rule_info.join(" ")
        );
    }

    fn previously_batched_subtask_up_to_date(&self, signature: &Signature, target: &ConfiguredTarget) {
        tracing::info!(
            task = %self.task,
            target = %target,
            signature = %signature.short(),
            "batched subtask up to date"
        );
    }
}

/// Output delegate that collects events (useful for testing and replay)
#[derive(Debug, Default)]
pub struct CollectingOutputDelegate {
    events: Mutex<Vec<OutputEvent>>,
    counters: Mutex<HashMap<TaskCounter, usize>>,
}

impl CollectingOutputDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    /// All collected events, in order
    pub fn events(&self) -> Vec<OutputEvent> {
        lock(&self.events).clone()
    }

    pub fn diagnostics(&self) -> Vec<Diagnostic> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                OutputEvent::Diagnostic(d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    /// Messages of diagnostics with the given behavior
    pub fn messages(&self, behavior: DiagnosticBehavior) -> Vec<String> {
        self.diagnostics()
            .into_iter()
            .filter(|d| d.behavior == behavior)
            .map(|d| d.message)
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.messages(DiagnosticBehavior::Error)
    }

    /// All raw output concatenated
    pub fn output(&self) -> Vec<u8> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                OutputEvent::Output(bytes) => Some(bytes.as_slice()),
                _ => None,
            })
            .flatten()
            .copied()
            .collect()
    }

    pub fn counter(&self, counter: TaskCounter) -> usize {
        lock(&self.counters).get(&counter).copied().unwrap_or(0)
    }
}

impl TaskOutputDelegate for CollectingOutputDelegate {
    fn emit_diagnostic(&self, diagnostic: Diagnostic) {
        lock(&self.events).push(OutputEvent::Diagnostic(diagnostic));
    }

    fn emit_output(&self, bytes: &[u8]) {
        if !bytes.is_empty() {
            lock(&self.events).push(OutputEvent::Output(bytes.to_vec()));
        }
    }

    fn increment_task_counter(&self, counter: TaskCounter) {
        *lock(&self.counters).entry(counter).or_insert(0) += 1;
        lock(&self.events).push(OutputEvent::Counter(counter));
    }

    fn subtask_up_to_date(&self, rule_info: &[String], signature: &Signature) {
        lock(&self.events).push(OutputEvent::SubtaskUpToDate {
            rule_info: rule_info.to_vec(),
            signature: signature.clone(),
        });
    }

    fn previously_batched_subtask_up_to_date(&self, signature: &Signature, target: &ConfiguredTarget) {
        lock(&self.events).push(OutputEvent::PreviouslyBatchedSubtaskUpToDate {
            signature: signature.clone(),
            target: target.clone(),
        });
    }
}

impl<T: TaskOutputDelegate + ?Sized> TaskOutputDelegate for Arc<T> {
    fn emit_diagnostic(&self, diagnostic: Diagnostic) {
        (**self).emit_diagnostic(diagnostic)
    }

    fn emit_output(&self, bytes: &[u8]) {
        (**self).emit_output(bytes)
    }

    fn increment_task_counter(&self, counter: TaskCounter) {
        (**self).increment_task_counter(counter)
    }

    fn subtask_up_to_date(&self, rule_info: &[String], signature: &Signature) {
        (**self).subtask_up_to_date(rule_info, signature)
    }

    fn previously_batched_subtask_up_to_date(&self, signature: &Signature, target: &ConfiguredTarget) {
        (**self).previously_batched_subtask_up_to_date(signature, target)
    }
}

/// Passes everything through to another delegate while keeping a copy of
/// raw output and diagnostics
pub struct CapturingOutputDelegate<'a> {
    underlying: &'a dyn TaskOutputDelegate,
    output: Mutex<ByteString>,
    diagnostics: Mutex<Vec<Diagnostic>>,
}

impl<'a> CapturingOutputDelegate<'a> {
    pub fn new(underlying: &'a dyn TaskOutputDelegate) -> Self {
        Self {
            underlying,
            output: Mutex::new(ByteString::new()),
            diagnostics: Mutex::new(Vec::new()),
        }
    }

    pub fn captured_output(&self) -> ByteString {
        lock(&self.output).clone()
    }

    pub fn captured_diagnostics(&self) -> Vec<Diagnostic> {
        lock(&self.diagnostics).clone()
    }
}

impl TaskOutputDelegate for CapturingOutputDelegate<'_> {
    fn emit_diagnostic(&self, diagnostic: Diagnostic) {
        lock(&self.diagnostics).push(diagnostic.clone());
        self.underlying.emit_diagnostic(diagnostic);
    }

    fn emit_output(&self, bytes: &[u8]) {
        lock(&self.output).append(bytes);
        self.underlying.emit_output(bytes);
    }

    fn increment_task_counter(&self, counter: TaskCounter) {
        self.underlying.increment_task_counter(counter);
    }

    fn subtask_up_to_date(&self, rule_info: &[String], signature: &Signature) {
        self.underlying.subtask_up_to_date(rule_info, signature);
    }

    fn previously_batched_subtask_up_to_date(&self, signature: &Signature, target: &ConfiguredTarget) {
        self.underlying
            .previously_batched_subtask_up_to_date(signature, target);
    }
}
