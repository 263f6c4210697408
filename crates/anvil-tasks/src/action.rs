//! The task action contract
//!
//! A task action is the unit of work the scheduler runs for one task. Its
//! lifecycle is:
//!
//! 1. [`TaskAction::task_setup`]: request input nodes and dynamic sub-tasks
//! 2. [`TaskAction::task_dependency_ready`]: once per requested dependency,
//!    never concurrently for one action, in no particular order
//! 3. [`TaskAction::perform_task_action`]: produce the [`CommandResult`]
//!
//! Actions are persisted as `[tool_identifier, payload]` and rebuilt through
//! the [`TaskActionRegistry`], which also knows how to construct the tasks
//! and actions behind dynamic requests.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anvil_core::serialization::{Deserializer, Serializable, Serializer};
use anvil_core::{SerializationError, Signature};
use async_trait::async_trait;

use crate::compilation_cache::{
    CachedCompileTaskAction, CompilationCacheKeyQueryKey, CompilationCacheKeyQuerySpec,
    CompilationCacheKeyQueryTaskAction, CompilationOutputMaterializeKey,
    CompilationOutputMaterializeSpec, CompilationOutputMaterializeTaskAction,
};
use crate::context::OperationContext;
use crate::delegates::{
    ClientDelegate, DynamicTaskExecutionDelegate, DynamicTaskRequest, TaskExecutionDelegate,
    TaskOutputDelegate,
};
use crate::driver_jobs::{
    DriverExplicitDependencyJobTaskKey, DriverJobPartition, DriverJobSchedulingTaskAction,
    DriverJobSpec, DriverJobTaskAction, DriverJobTaskKey, DriverPlanningSpec,
    DriverPlanningTaskAction, DriverPlanningTaskKey,
};
use crate::error::{Result, TaskError};
use crate::generic_caching::GenericCachingTaskAction;
use crate::task::{BuildValueKind, CommandResult, ExecutableTask, TaskId};

/// A unit of build work bound to a tool identifier
#[async_trait]
pub trait TaskAction: Send + Sync + fmt::Debug {
    /// Stable identifier of the action type
    fn tool_identifier(&self) -> &'static str;

    /// Write the action's configuration
    fn serialize_payload(&self, serializer: &mut Serializer);

    /// Fingerprint for up-to-date checks, if the action contributes one
    fn compute_initial_signature(&self) -> Option<Signature> {
        None
    }

    /// Called before any dependency is requested. Resets per-invocation state.
    async fn task_setup(
        &mut self,
        _task: &ExecutableTask,
        _execution: &dyn TaskExecutionDelegate,
        _dynamic: &dyn DynamicTaskExecutionDelegate,
    ) {
    }

    /// Called once per requested dependency. `None` means the dependency
    /// produced no value at all.
    async fn task_dependency_ready(
        &mut self,
        _task: &ExecutableTask,
        _dependency_id: TaskId,
        _value: Option<BuildValueKind>,
        _dynamic: &dyn DynamicTaskExecutionDelegate,
        _execution: &dyn TaskExecutionDelegate,
    ) {
    }

    /// Do the work. Errors are reported through `output`, never returned.
    async fn perform_task_action(
        &mut self,
        task: &ExecutableTask,
        dynamic: &dyn DynamicTaskExecutionDelegate,
        execution: &dyn TaskExecutionDelegate,
        client: &dyn ClientDelegate,
        output: &dyn TaskOutputDelegate,
    ) -> CommandResult;
}

/// Identity of a dynamically requested task
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DynamicTaskKey {
    DriverPlanning(DriverPlanningTaskKey),
    DriverJob(DriverJobTaskKey),
    DriverExplicitDependencyJob(DriverExplicitDependencyJobTaskKey),
    CompilationCacheKeyQuery(CompilationCacheKeyQueryKey),
    CompilationOutputMaterialize(CompilationOutputMaterializeKey),
}

impl fmt::Display for DynamicTaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DriverPlanning(key) => write!(f, "planning:{}", key.payload.unique_id),
            Self::DriverJob(key) => write!(f, "job:{}:{}", key.identifier, key.job_key),
            Self::DriverExplicitDependencyJob(key) => {
                write!(f, "explicit-job:{}:{}", key.architecture, key.job_signature.short())
            }
            Self::CompilationCacheKeyQuery(key) => write!(f, "key-query:{}", key.cache_key),
            Self::CompilationOutputMaterialize(key) => {
                write!(f, "materialize:{}:{}", key.output_name, key.output_id)
            }
        }
    }
}

/// Builds the task and action behind a dynamic request
pub trait DynamicTaskSpec: Send + Sync {
    fn build_executable_task(
        &self,
        request: &DynamicTaskRequest,
        context: &OperationContext,
    ) -> Result<ExecutableTask>;

    fn create_task_action(
        &self,
        request: &DynamicTaskRequest,
        context: &OperationContext,
    ) -> Result<Box<dyn TaskAction>>;
}

/// The parts of a dynamic task every spec copies from the request
pub(crate) fn executable_task_for(request: &DynamicTaskRequest, identifier: String) -> ExecutableTask {
    let mut task = ExecutableTask::new(identifier)
        .with_working_directory(request.working_directory.clone())
        .with_environment(request.environment.clone());
    task.for_target = request.for_target.clone();
    task.show_environment = request.show_environment;
    task
}

type ActionDeserializer =
    fn(&mut Deserializer<'_>) -> std::result::Result<Box<dyn TaskAction>, SerializationError>;

fn deserializer_for<A>() -> ActionDeserializer
where
    A: TaskAction + Serializable + 'static,
{
    |deserializer| Ok(Box::new(A::deserialize(deserializer)?) as Box<dyn TaskAction>)
}

/// Maps tool identifiers to deserializers and dynamic task specs
#[derive(Default)]
pub struct TaskActionRegistry {
    deserializers: HashMap<&'static str, ActionDeserializer>,
    specs: HashMap<&'static str, Arc<dyn DynamicTaskSpec>>,
}

impl fmt::Debug for TaskActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut tools: Vec<_> = self.deserializers.keys().collect();
        tools.sort();
        f.debug_struct("TaskActionRegistry")
            .field("tools", &tools)
            .field("specs", &self.specs.len())
            .finish()
    }
}

impl TaskActionRegistry {
    /// An empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry knowing every action in this crate
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_action::<GenericCachingTaskAction>(GenericCachingTaskAction::TOOL_IDENTIFIER);
        for partition in DriverJobPartition::ALL {
            registry.register_deserializer(partition.tool_identifier(), |d| {
                Ok(Box::new(DriverJobSchedulingTaskAction::deserialize(d)?) as Box<dyn TaskAction>)
            });
        }
        registry.register_action::<DriverPlanningTaskAction>(DriverPlanningTaskAction::TOOL_IDENTIFIER);
        registry.register_action::<DriverJobTaskAction>(DriverJobTaskAction::TOOL_IDENTIFIER);
        registry.register_action::<CachedCompileTaskAction>(CachedCompileTaskAction::TOOL_IDENTIFIER);
        registry.register_action::<CompilationCacheKeyQueryTaskAction>(
            CompilationCacheKeyQueryTaskAction::TOOL_IDENTIFIER,
        );
        registry.register_action::<CompilationOutputMaterializeTaskAction>(
            CompilationOutputMaterializeTaskAction::TOOL_IDENTIFIER,
        );

        registry.register_spec(DriverPlanningTaskAction::TOOL_IDENTIFIER, Arc::new(DriverPlanningSpec));
        registry.register_spec(DriverJobTaskAction::TOOL_IDENTIFIER, Arc::new(DriverJobSpec));
        registry.register_spec(
            CompilationCacheKeyQueryTaskAction::TOOL_IDENTIFIER,
            Arc::new(CompilationCacheKeyQuerySpec),
        );
        registry.register_spec(
            CompilationOutputMaterializeTaskAction::TOOL_IDENTIFIER,
            Arc::new(CompilationOutputMaterializeSpec),
        );
        registry
    }

    pub fn register_action<A>(&mut self, tool_identifier: &'static str)
    where
        A: TaskAction + Serializable + 'static,
    {
        self.register_deserializer(tool_identifier, deserializer_for::<A>());
    }

    pub fn register_deserializer(&mut self, tool_identifier: &'static str, deserializer: ActionDeserializer) {
        self.deserializers.insert(tool_identifier, deserializer);
    }

    pub fn register_spec(&mut self, tool_identifier: &'static str, spec: Arc<dyn DynamicTaskSpec>) {
        self.specs.insert(tool_identifier, spec);
    }

    pub fn spec(&self, tool_identifier: &str) -> Result<&Arc<dyn DynamicTaskSpec>> {
        self.specs
            .get(tool_identifier)
            .ok_or_else(|| TaskError::UnknownTool(tool_identifier.to_string()))
    }

    /// Encode an action as `[tool_identifier, payload]`
    pub fn serialize_action(action: &dyn TaskAction) -> Vec<u8> {
        let mut serializer = Serializer::new();
        serializer.serialize_aggregate(2, |s| {
            s.serialize(&action.tool_identifier().to_string());
            action.serialize_payload(s);
        });
        serializer.into_bytes()
    }

    /// Rebuild an action written by [`TaskActionRegistry::serialize_action`]
    pub fn deserialize_action(&self, bytes: &[u8]) -> Result<Box<dyn TaskAction>> {
        let mut deserializer = Deserializer::new(bytes);
        deserializer.begin_aggregate(2)?;
        let tool: String = deserializer.deserialize()?;
        let deserialize = self
            .deserializers
            .get(tool.as_str())
            .ok_or_else(|| TaskError::UnknownTool(tool.clone()))?;
        let action = deserialize(&mut deserializer)?;
        if !deserializer.is_at_end() {
            return Err(SerializationError::TrailingBytes(deserializer.remaining()).into());
        }
        Ok(action)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anvil_cas::CasOptions;
    use std::path::PathBuf;

    #[test]
    fn test_round_trip_through_registry() {
        let registry = TaskActionRegistry::with_defaults();
        let action = GenericCachingTaskAction::new(
            PathBuf::from("/tmp/sandbox"),
            CasOptions::new("/tmp/cas"),
        )
        .with_debugging_remarks(true);

        let bytes = TaskActionRegistry::serialize_action(&action);
        let decoded = registry.deserialize_action(&bytes).unwrap();
        assert_eq!(decoded.tool_identifier(), GenericCachingTaskAction::TOOL_IDENTIFIER);
        assert_eq!(TaskActionRegistry::serialize_action(decoded.as_ref()), bytes);
    }

    #[test]
    fn test_scheduling_actions_round_trip() {
        let registry = TaskActionRegistry::with_defaults();
        for partition in DriverJobPartition::ALL {
            let action = DriverJobSchedulingTaskAction::new(partition);
            let bytes = TaskActionRegistry::serialize_action(&action);
            let decoded = registry.deserialize_action(&bytes).unwrap();
            assert_eq!(decoded.tool_identifier(), partition.tool_identifier());
        }
    }

    #[test]
    fn test_unknown_tool() {
        let registry = TaskActionRegistry::new();
        let action = DriverPlanningTaskAction::new();
        let bytes = TaskActionRegistry::serialize_action(&action);
        assert!(matches!(
            registry.deserialize_action(&bytes),
            Err(TaskError::UnknownTool(_))
        ));
        assert!(registry.spec("driver-planning").is_err());
    }

    #[test]
    fn test_default_specs() {
        let registry = TaskActionRegistry::with_defaults();
        assert!(registry.spec(DriverJobTaskAction::TOOL_IDENTIFIER).is_ok());
        assert!(registry
            .spec(CompilationOutputMaterializeTaskAction::TOOL_IDENTIFIER)
            .is_ok());
    }
}
