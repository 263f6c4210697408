//! Collaborator interfaces handed to task actions
//!
//! A task action never talks to the scheduler, the file system or the
//! terminal directly. It receives four delegates:
//! - [`TaskExecutionDelegate`]: file system, build command and preferences
//! - [`DynamicTaskExecutionDelegate`]: requesting input nodes and dynamic
//!   sub-tasks, activities, process spawning and the shared operation context
//! - [`TaskOutputDelegate`]: diagnostics, raw output and counters
//! - [`ClientDelegate`]: lets a client run a tool out of process

use std::fmt;
use std::path::{Path, PathBuf};

use anvil_core::config::PreferencesConfig;
use anvil_core::serialization::{Deserializer, Serializable, Serializer};
use anvil_core::{SerializationError, Signature};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::context::OperationContext;
use crate::error::Result;
use crate::fs::FsProxy;
use crate::process::{self, ProcessOutput};
use crate::task::{
    BuildCommand, ConfiguredTarget, DynamicTaskReason, EnvironmentBindings, ExecutionNode, TaskId,
    TaskPriority,
};
use crate::DynamicTaskKey;

/// Severity of a diagnostic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiagnosticBehavior {
    Error,
    Warning,
    Note,
    Remark,
}

impl fmt::Display for DiagnosticBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Error => write!(f, "error"),
            Self::Warning => write!(f, "warning"),
            Self::Note => write!(f, "note"),
            Self::Remark => write!(f, "remark"),
        }
    }
}

/// A structured message attributed to a location where one is known
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub behavior: DiagnosticBehavior,
    pub message: String,
    pub location: Option<PathBuf>,
}

impl Diagnostic {
    pub fn new(behavior: DiagnosticBehavior, message: impl Into<String>) -> Self {
        Self {
            behavior,
            message: message.into(),
            location: None,
        }
    }

    /// Builder: attach a path
    pub fn with_location(mut self, path: impl Into<PathBuf>) -> Self {
        self.location = Some(path.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(path) => write!(f, "{}: {}: {}", path.display(), self.behavior, self.message),
            None => write!(f, "{}: {}", self.behavior, self.message),
        }
    }
}

impl Serializable for Diagnostic {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.serialize_aggregate(3, |s| {
            let tag: u8 = match self.behavior {
                DiagnosticBehavior::Error => 0,
                DiagnosticBehavior::Warning => 1,
                DiagnosticBehavior::Note => 2,
                DiagnosticBehavior::Remark => 3,
            };
            s.serialize(&tag);
            s.serialize(&self.message);
            s.serialize(&self.location);
        });
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> std::result::Result<Self, SerializationError> {
        deserializer.begin_aggregate(3)?;
        let tag: u8 = deserializer.deserialize()?;
        let behavior = match tag {
            0 => DiagnosticBehavior::Error,
            1 => DiagnosticBehavior::Warning,
            2 => DiagnosticBehavior::Note,
            3 => DiagnosticBehavior::Remark,
            tag => {
                return Err(SerializationError::UnsupportedVariant {
                    type_name: "DiagnosticBehavior",
                    tag: tag as u64,
                })
            }
        };
        Ok(Self {
            behavior,
            message: deserializer.deserialize()?,
            location: deserializer.deserialize()?,
        })
    }
}

/// Counters a task may bump for build statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskCounter {
    CacheHits,
    CacheMisses,
    CompilationCacheHits,
    CompilationCacheMisses,
}

/// Where task output and diagnostics go
pub trait TaskOutputDelegate: Send + Sync {
    fn emit_diagnostic(&self, diagnostic: Diagnostic);

    /// Raw process output
    fn emit_output(&self, bytes: &[u8]);

    fn increment_task_counter(&self, counter: TaskCounter);

    /// A sub-task that did not need to run
    fn subtask_up_to_date(&self, rule_info: &[String], signature: &Signature);

    /// A per-file sub-task of a batched command that did not need to run
    fn previously_batched_subtask_up_to_date(&self, signature: &Signature, target: &ConfiguredTarget);

    fn error(&self, message: &str) {
        self.emit_diagnostic(Diagnostic::new(DiagnosticBehavior::Error, message));
    }

    fn warning(&self, message: &str) {
        self.emit_diagnostic(Diagnostic::new(DiagnosticBehavior::Warning, message));
    }

    fn note(&self, message: &str) {
        self.emit_diagnostic(Diagnostic::new(DiagnosticBehavior::Note, message));
    }

    fn remark(&self, message: &str) {
        self.emit_diagnostic(Diagnostic::new(DiagnosticBehavior::Remark, message));
    }
}

/// Build-wide facilities available to every action
pub trait TaskExecutionDelegate: Send + Sync {
    fn fs(&self) -> &dyn FsProxy;

    fn build_command(&self) -> BuildCommand;

    fn user_preferences(&self) -> &PreferencesConfig;

    /// Environment the build itself runs in
    fn environment(&self) -> &EnvironmentBindings;
}

/// A request for a sub-task, delivered back as a dependency-ready callback
#[derive(Debug, Clone)]
pub struct DynamicTaskRequest {
    pub tool_identifier: String,
    pub task_key: DynamicTaskKey,
    pub task_id: TaskId,
    /// When false, requests with an equal key share one execution
    pub single_use: bool,
    pub working_directory: PathBuf,
    pub environment: EnvironmentBindings,
    pub for_target: Option<ConfiguredTarget>,
    pub priority: TaskPriority,
    pub show_environment: bool,
    pub reason: Option<DynamicTaskReason>,
    /// Runs outside the regular execution lanes
    pub detached: bool,
}

/// Opaque handle of a started activity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ActivityId(pub u64);

/// How an activity ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActivityStatus {
    Succeeded,
    Failed,
    Cancelled,
}

/// Scheduler services for actions that request work at execution time.
///
/// Requests are fire-and-forget: the requesting action learns about the
/// outcome only through a later `task_dependency_ready` call carrying the id
/// it chose.
#[async_trait]
pub trait DynamicTaskExecutionDelegate: Send + Sync {
    fn request_input_node(&self, node: ExecutionNode, id: TaskId);

    fn request_dynamic_task(&self, request: DynamicTaskRequest);

    /// Report a file the task depended on that the scheduler did not know about
    fn discovered_dependency_node(&self, node: ExecutionNode);

    fn operation_context(&self) -> &OperationContext;

    fn allows_external_tool_execution(&self) -> bool;

    /// Cooperative cancellation signal for the build
    fn cancellation(&self) -> CancellationToken;

    fn begin_activity(
        &self,
        rule_info: &str,
        execution_description: &str,
        signature: &Signature,
        target: Option<&ConfiguredTarget>,
    ) -> ActivityId;

    fn emit_activity_output(&self, activity: ActivityId, bytes: &[u8]);

    fn end_activity(&self, activity: ActivityId, status: ActivityStatus);

    /// Run a process to completion, honoring the cancellation signal
    async fn spawn(
        &self,
        command_line: &[String],
        environment: &EnvironmentBindings,
        working_directory: &Path,
    ) -> Result<ProcessOutput> {
        process::spawn(command_line, environment, working_directory, self.cancellation()).await
    }
}

/// Run `body` inside an activity, ending it with the status the body reports
pub fn with_activity<T>(
    delegate: &dyn DynamicTaskExecutionDelegate,
    rule_info: &str,
    execution_description: &str,
    signature: &Signature,
    target: Option<&ConfiguredTarget>,
    body: impl FnOnce(ActivityId) -> Result<T>,
) -> Result<T> {
    let activity = delegate.begin_activity(rule_info, execution_description, signature, target);
    let result = body(activity);
    let status = if result.is_ok() {
        ActivityStatus::Succeeded
    } else {
        ActivityStatus::Failed
    };
    delegate.end_activity(activity, status);
    result
}

/// What a client did with a tool invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExternalToolResult {
    /// The client declined; run the tool locally
    Deferred,
    Result {
        exit_code: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    },
}

/// Lets a client intercept process execution
#[async_trait]
pub trait ClientDelegate: Send + Sync {
    async fn execute_external_tool(
        &self,
        command_line: &[String],
        working_directory: &Path,
        environment: &EnvironmentBindings,
    ) -> Result<ExternalToolResult>;
}

/// Client delegate that always defers to local execution
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalClientDelegate;

#[async_trait]
impl ClientDelegate for LocalClientDelegate {
    async fn execute_external_tool(
        &self,
        _command_line: &[String],
        _working_directory: &Path,
        _environment: &EnvironmentBindings,
    ) -> Result<ExternalToolResult> {
        Ok(ExternalToolResult::Deferred)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_core::serialization::{from_bytes, to_bytes};

    #[test]
    fn test_diagnostic_round_trip() {
        let diagnostic = Diagnostic::new(DiagnosticBehavior::Warning, "unused variable")
            .with_location("/src/main.c");
        let decoded: Diagnostic = from_bytes(&to_bytes(&diagnostic)).unwrap();
        assert_eq!(decoded, diagnostic);
    }

    #[test]
    fn test_diagnostic_display() {
        let diagnostic = Diagnostic::new(DiagnosticBehavior::Error, "boom").with_location("a.c");
        assert_eq!(diagnostic.to_string(), "a.c: error: boom");
        assert_eq!(
            Diagnostic::new(DiagnosticBehavior::Note, "hi").to_string(),
            "note: hi"
        );
    }

    #[tokio::test]
    async fn test_local_client_defers() {
        let result = LocalClientDelegate
            .execute_external_tool(&["true".to_string()], Path::new("/"), &EnvironmentBindings::new())
            .await
            .unwrap();
        assert_eq!(result, ExternalToolResult::Deferred);
    }
}
