//! Compilation cache queries against a remote mirror
//!
//! A cached compile first checks the local store for its cache key. On a
//! local miss it asks the mirror whether the key exists, through a
//! key-query sub-task, and only then downloads the outputs it needs through
//! one materialization sub-task per output. Both kinds of sub-task are
//! network bound and scheduled with [`TaskPriority::Network`].
//!
//! A cache entry is a result object whose payload lists the output names and
//! whose references are the output trees, in the same order.
//!
//! Cache trouble never fails a compile unless strict errors are enabled: the
//! compile falls back to running the compiler.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use anvil_cas::{fetch_object_tree, CasError, CasFsNode, CasObject, CasOptions, ContentStore, DataId};
use anvil_core::serialization::{self, Deserializer, Serializable, Serializer};
use anvil_core::SerializationError;
use async_trait::async_trait;
use tracing::{debug, error, info, instrument, warn};

use crate::action::{executable_task_for, DynamicTaskKey, DynamicTaskSpec, TaskAction};
use crate::context::OperationContext;
use crate::delegates::{
    ClientDelegate, DynamicTaskExecutionDelegate, DynamicTaskRequest, TaskCounter,
    TaskExecutionDelegate, TaskOutputDelegate,
};
use crate::error::{Result, TaskError};
use crate::process;
use crate::task::{
    BuildValueKind, CommandResult, DynamicTaskReason, ExecutableTask, TaskId, TaskPriority,
};

/// Configuration of a compile whose outputs may come from the cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationCachePayload {
    /// Key the compiler computed for this compilation
    pub cache_key: DataId,
    /// Names the compiler gives its outputs, parallel to `output_paths`
    pub output_names: Vec<String>,
    pub output_paths: Vec<PathBuf>,
    pub cas_options: CasOptions,
}

impl CompilationCachePayload {
    pub fn new(cache_key: DataId, cas_options: CasOptions) -> Self {
        Self {
            cache_key,
            output_names: Vec::new(),
            output_paths: Vec::new(),
            cas_options,
        }
    }

    /// Builder: add a named output
    pub fn with_output(mut self, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        self.output_names.push(name.into());
        self.output_paths.push(path.into());
        self
    }
}

/// Outputs of one cached compilation, by name
#[derive(Debug, Clone, PartialEq, Eq)]
struct CompilationResult {
    outputs: Vec<(String, DataId)>,
}

impl CompilationResult {
    fn to_object(&self) -> CasObject {
        let names: Vec<String> = self.outputs.iter().map(|(name, _)| name.clone()).collect();
        CasObject::new(
            serialization::to_bytes(&names),
            self.outputs.iter().map(|(_, id)| id.clone()).collect(),
        )
    }

    fn from_object(object: &CasObject) -> Result<Self> {
        let names: Vec<String> = serialization::from_bytes(object.data.as_bytes())?;
        if names.len() != object.refs.len() {
            return Err(TaskError::other(format!(
                "compilation result lists {} outputs but references {}",
                names.len(),
                object.refs.len()
            )));
        }
        Ok(Self {
            outputs: names.into_iter().zip(object.refs.iter().cloned()).collect(),
        })
    }

    /// Output ids in the order of the payload's output paths
    fn ordered_for(&self, payload: &CompilationCachePayload) -> Result<Vec<DataId>> {
        if self.outputs.len() != payload.output_names.len() {
            return Err(TaskError::OutputCountMismatch {
                found: self.outputs.len(),
                expected: payload.output_names.len(),
            });
        }
        payload
            .output_names
            .iter()
            .map(|name| {
                self.outputs
                    .iter()
                    .find(|(candidate, _)| candidate == name)
                    .map(|(_, id)| id.clone())
                    .ok_or_else(|| TaskError::other(format!("cache entry has no output named '{name}'")))
            })
            .collect()
    }
}

/// The locally cached result for `key`, if any
async fn lookup_local(cas: &dyn ContentStore, key: &DataId) -> Result<Option<CompilationResult>> {
    let Some(value) = cas.lookup_cached_object(key).await? else {
        return Ok(None);
    };
    let object = cas.load_existing(&value).await?;
    Ok(Some(CompilationResult::from_object(&object)?))
}

/// Ask the mirror for `key` and record a hit in the local store.
///
/// Only the result object is downloaded; output trees are left to
/// materialization.
async fn query_remote_key(context: &OperationContext, key: &DataId) -> Result<bool> {
    let (Some(cas), Some(remote)) = (context.cas(), context.remote()) else {
        return Ok(false);
    };
    if cas.lookup_cached_object(key).await?.is_some() {
        return Ok(true);
    }
    let Some(value) = remote.query_key(key).await? else {
        debug!(key = %key, "cache key not found remotely");
        return Ok(false);
    };
    let object = remote
        .fetch_object(&value)
        .await?
        .ok_or_else(|| CasError::ObjectNotFound(value.clone()))?;
    cas.store(object).await?;
    cas.cache(&value, key).await?;
    info!(key = %key, value = %value, "found cache key remotely");
    Ok(true)
}

/// Report a cache failure. Returns whether the task has to fail.
fn report_cache_error(options: &CasOptions, output: &dyn TaskOutputDelegate, message: &str) -> bool {
    if options.enable_strict_cas_errors {
        output.error(message);
        true
    } else {
        output.warning(message);
        false
    }
}

fn is_missing_object(error: &TaskError) -> bool {
    matches!(error, TaskError::Cas(CasError::ObjectNotFound(_)))
}

/// Identity of a key-query sub-task
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompilationCacheKeyQueryKey {
    pub cache_key: DataId,
    pub cas_options: CasOptions,
}

impl Serializable for CompilationCacheKeyQueryKey {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.serialize_aggregate(2, |s| {
            s.serialize(&self.cache_key);
            s.serialize(&self.cas_options);
        });
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> std::result::Result<Self, SerializationError> {
        deserializer.begin_aggregate(2)?;
        Ok(Self {
            cache_key: deserializer.deserialize()?,
            cas_options: deserializer.deserialize()?,
        })
    }
}

/// Identity of a materialization sub-task
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CompilationOutputMaterializeKey {
    pub output_name: String,
    pub output_id: DataId,
    pub cas_options: CasOptions,
}

impl Serializable for CompilationOutputMaterializeKey {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.serialize_aggregate(3, |s| {
            s.serialize(&self.output_name);
            s.serialize(&self.output_id);
            s.serialize(&self.cas_options);
        });
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> std::result::Result<Self, SerializationError> {
        deserializer.begin_aggregate(3)?;
        Ok(Self {
            output_name: deserializer.deserialize()?,
            output_id: deserializer.deserialize()?,
            cas_options: deserializer.deserialize()?,
        })
    }
}

/// Looks a cache key up in the remote mirror
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationCacheKeyQueryTaskAction {
    key: CompilationCacheKeyQueryKey,
}

impl CompilationCacheKeyQueryTaskAction {
    pub const TOOL_IDENTIFIER: &'static str = "compilation-cache-key-query";

    pub fn new(key: CompilationCacheKeyQueryKey) -> Self {
        Self { key }
    }
}

#[async_trait]
impl TaskAction for CompilationCacheKeyQueryTaskAction {
    fn tool_identifier(&self) -> &'static str {
        Self::TOOL_IDENTIFIER
    }

    fn serialize_payload(&self, serializer: &mut Serializer) {
        self.serialize(serializer);
    }

    #[instrument(skip_all, fields(key = %self.key.cache_key))]
    async fn perform_task_action(
        &mut self,
        _task: &ExecutableTask,
        dynamic: &dyn DynamicTaskExecutionDelegate,
        _execution: &dyn TaskExecutionDelegate,
        _client: &dyn ClientDelegate,
        output: &dyn TaskOutputDelegate,
    ) -> CommandResult {
        if dynamic.cancellation().is_cancelled() {
            return CommandResult::Cancelled;
        }
        let options = &self.key.cas_options;
        match query_remote_key(dynamic.operation_context(), &self.key.cache_key).await {
            Ok(found) => {
                if !found && options.enable_diagnostic_remarks {
                    output.note(&format!("cache key {} not found in the remote cache", self.key.cache_key));
                }
                CommandResult::Succeeded
            }
            Err(e) if is_missing_object(&e) => {
                if options.enable_diagnostic_remarks {
                    output.note(&e.to_string());
                }
                CommandResult::Succeeded
            }
            Err(e) => {
                let message = format!("cache key query failed for {}: {e}", self.key.cache_key);
                if report_cache_error(options, output, &message) {
                    CommandResult::Failed
                } else {
                    CommandResult::Succeeded
                }
            }
        }
    }
}

impl Serializable for CompilationCacheKeyQueryTaskAction {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.serialize_aggregate(1, |s| s.serialize(&self.key));
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> std::result::Result<Self, SerializationError> {
        deserializer.begin_aggregate(1)?;
        Ok(Self::new(deserializer.deserialize()?))
    }
}

/// Downloads one output tree into the local store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilationOutputMaterializeTaskAction {
    key: CompilationOutputMaterializeKey,
}

impl CompilationOutputMaterializeTaskAction {
    pub const TOOL_IDENTIFIER: &'static str = "compilation-output-materialize";

    pub fn new(key: CompilationOutputMaterializeKey) -> Self {
        Self { key }
    }

    async fn materialize(&self, context: &OperationContext) -> Result<()> {
        let cas = context
            .cas()
            .ok_or_else(|| TaskError::other("caching is enabled, but no CAS was provided"))?;
        if cas.contains_tree(&self.key.output_id).await? {
            return Ok(());
        }
        let remote = context
            .remote()
            .ok_or_else(|| TaskError::other("output is not available locally and no remote cache is configured"))?;
        fetch_object_tree(remote.as_ref(), cas.as_ref(), &self.key.output_id).await?;
        Ok(())
    }
}

#[async_trait]
impl TaskAction for CompilationOutputMaterializeTaskAction {
    fn tool_identifier(&self) -> &'static str {
        Self::TOOL_IDENTIFIER
    }

    fn serialize_payload(&self, serializer: &mut Serializer) {
        self.serialize(serializer);
    }

    #[instrument(skip_all, fields(output = %self.key.output_name, id = %self.key.output_id))]
    async fn perform_task_action(
        &mut self,
        _task: &ExecutableTask,
        dynamic: &dyn DynamicTaskExecutionDelegate,
        _execution: &dyn TaskExecutionDelegate,
        _client: &dyn ClientDelegate,
        output: &dyn TaskOutputDelegate,
    ) -> CommandResult {
        let cancellation = dynamic.cancellation();
        let result = tokio::select! {
            _ = cancellation.cancelled() => return CommandResult::Cancelled,
            result = self.materialize(dynamic.operation_context()) => result,
        };
        let options = &self.key.cas_options;
        match result {
            Ok(()) => CommandResult::Succeeded,
            Err(e) if is_missing_object(&e) => {
                if options.enable_diagnostic_remarks {
                    output.note(&format!("cannot materialize '{}': {e}", self.key.output_name));
                }
                CommandResult::Succeeded
            }
            Err(e) => {
                let message = format!("failed to materialize '{}': {e}", self.key.output_name);
                if report_cache_error(options, output, &message) {
                    CommandResult::Failed
                } else {
                    CommandResult::Succeeded
                }
            }
        }
    }
}

impl Serializable for CompilationOutputMaterializeTaskAction {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.serialize_aggregate(1, |s| s.serialize(&self.key));
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> std::result::Result<Self, SerializationError> {
        deserializer.begin_aggregate(1)?;
        Ok(Self::new(deserializer.deserialize()?))
    }
}

/// Builds key-query tasks
#[derive(Debug, Default, Clone, Copy)]
pub struct CompilationCacheKeyQuerySpec;

impl DynamicTaskSpec for CompilationCacheKeyQuerySpec {
    fn build_executable_task(
        &self,
        request: &DynamicTaskRequest,
        _context: &OperationContext,
    ) -> Result<ExecutableTask> {
        let DynamicTaskKey::CompilationCacheKeyQuery(key) = &request.task_key else {
            return Err(TaskError::UnexpectedTaskKey(request.tool_identifier.clone()));
        };
        let cache_key = key.cache_key.to_string();
        Ok(
            executable_task_for(request, format!("compilation-cache-key-query:{cache_key}"))
                .with_rule_info(["CompilationCacheKeyQuery".to_string(), cache_key]),
        )
    }

    fn create_task_action(
        &self,
        request: &DynamicTaskRequest,
        _context: &OperationContext,
    ) -> Result<Box<dyn TaskAction>> {
        match &request.task_key {
            DynamicTaskKey::CompilationCacheKeyQuery(key) => {
                Ok(Box::new(CompilationCacheKeyQueryTaskAction::new(key.clone())))
            }
            _ => Err(TaskError::UnexpectedTaskKey(request.tool_identifier.clone())),
        }
    }
}

/// Builds materialization tasks
#[derive(Debug, Default, Clone, Copy)]
pub struct CompilationOutputMaterializeSpec;

impl DynamicTaskSpec for CompilationOutputMaterializeSpec {
    fn build_executable_task(
        &self,
        request: &DynamicTaskRequest,
        _context: &OperationContext,
    ) -> Result<ExecutableTask> {
        let DynamicTaskKey::CompilationOutputMaterialize(key) = &request.task_key else {
            return Err(TaskError::UnexpectedTaskKey(request.tool_identifier.clone()));
        };
        Ok(executable_task_for(
            request,
            format!("compilation-output-materialize:{}:{}", key.output_name, key.output_id),
        )
        .with_rule_info([
            "CompilationOutputMaterialize".to_string(),
            key.output_name.clone(),
            key.output_id.to_string(),
        ]))
    }

    fn create_task_action(
        &self,
        request: &DynamicTaskRequest,
        _context: &OperationContext,
    ) -> Result<Box<dyn TaskAction>> {
        match &request.task_key {
            DynamicTaskKey::CompilationOutputMaterialize(key) => {
                Ok(Box::new(CompilationOutputMaterializeTaskAction::new(key.clone())))
            }
            _ => Err(TaskError::UnexpectedTaskKey(request.tool_identifier.clone())),
        }
    }
}

/// Task id of the key query; output downloads use `1 + index`
const KEY_QUERY_ID: TaskId = 0;

#[derive(Debug, Default)]
enum CacheState {
    #[default]
    Initial,
    WaitingForKeyQuery,
    WaitingForOutputDownloads {
        open: BTreeSet<TaskId>,
        result: CompilationResult,
        degraded: bool,
    },
    /// `hit` is the result to replay; `None` compiles
    Done { hit: Option<CompilationResult> },
    ExecutionError(String),
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::WaitingForKeyQuery => write!(f, "waiting for key query"),
            Self::WaitingForOutputDownloads { open, .. } => {
                write!(f, "waiting for {} output downloads", open.len())
            }
            Self::Done { hit: Some(_) } => write!(f, "done (hit)"),
            Self::Done { hit: None } => write!(f, "done (miss)"),
            Self::ExecutionError(message) => write!(f, "execution error: {message}"),
        }
    }
}

/// A compile that replays its outputs from the compilation cache when it can
#[derive(Debug, Default)]
pub struct CachedCompileTaskAction {
    state: CacheState,
}

impl CachedCompileTaskAction {
    pub const TOOL_IDENTIFIER: &'static str = "cached-compile";

    pub fn new() -> Self {
        Self::default()
    }

    fn payload(task: &ExecutableTask) -> Result<&CompilationCachePayload> {
        task.compilation_cache_payload()
            .ok_or(TaskError::InvalidPayload("cached compile"))
    }

    /// Request downloads for the outputs of `result` that are not local yet
    async fn request_materialization(
        &self,
        task: &ExecutableTask,
        payload: &CompilationCachePayload,
        result: CompilationResult,
        dynamic: &dyn DynamicTaskExecutionDelegate,
    ) -> Result<CacheState> {
        let cas = dynamic
            .operation_context()
            .cas()
            .ok_or_else(|| TaskError::other("caching is enabled, but no CAS was provided"))?;
        // Fail early on an entry that does not fit this compile
        result.ordered_for(payload)?;

        let mut open = BTreeSet::new();
        for (index, (name, id)) in result.outputs.iter().enumerate() {
            if cas.contains_tree(id).await? {
                continue;
            }
            let task_id = 1 + index as TaskId;
            dynamic.request_dynamic_task(DynamicTaskRequest {
                tool_identifier: CompilationOutputMaterializeTaskAction::TOOL_IDENTIFIER.to_string(),
                task_key: DynamicTaskKey::CompilationOutputMaterialize(CompilationOutputMaterializeKey {
                    output_name: name.clone(),
                    output_id: id.clone(),
                    cas_options: payload.cas_options.clone(),
                }),
                task_id,
                single_use: false,
                working_directory: task.working_directory.clone(),
                environment: task.environment.clone(),
                for_target: task.for_target.clone(),
                priority: TaskPriority::Network,
                show_environment: task.show_environment,
                reason: Some(DynamicTaskReason::WasCompilationCachingMaterialization),
                detached: true,
            });
            open.insert(task_id);
        }

        debug!(task = %task.identifier, downloads = open.len(), "compilation cache hit");
        Ok(if open.is_empty() {
            CacheState::Done { hit: Some(result) }
        } else {
            CacheState::WaitingForOutputDownloads {
                open,
                result,
                degraded: false,
            }
        })
    }

    fn request_key_query(
        &self,
        task: &ExecutableTask,
        payload: &CompilationCachePayload,
        dynamic: &dyn DynamicTaskExecutionDelegate,
    ) {
        dynamic.request_dynamic_task(DynamicTaskRequest {
            tool_identifier: CompilationCacheKeyQueryTaskAction::TOOL_IDENTIFIER.to_string(),
            task_key: DynamicTaskKey::CompilationCacheKeyQuery(CompilationCacheKeyQueryKey {
                cache_key: payload.cache_key.clone(),
                cas_options: payload.cas_options.clone(),
            }),
            task_id: KEY_QUERY_ID,
            single_use: false,
            working_directory: task.working_directory.clone(),
            environment: task.environment.clone(),
            for_target: task.for_target.clone(),
            priority: TaskPriority::Network,
            show_environment: task.show_environment,
            reason: Some(DynamicTaskReason::WasCompilationCachingQuery),
            detached: payload.cas_options.enable_detached_key_queries,
        });
    }

    async fn setup(&self, task: &ExecutableTask, dynamic: &dyn DynamicTaskExecutionDelegate) -> Result<CacheState> {
        let payload = Self::payload(task)?;
        let context = dynamic.operation_context();
        let cas = context
            .cas()
            .ok_or_else(|| TaskError::other("caching is enabled, but no CAS was provided"))?;

        if let Some(result) = lookup_local(cas.as_ref(), &payload.cache_key).await? {
            return self.request_materialization(task, payload, result, dynamic).await;
        }
        if context.remote().is_none() || !payload.cas_options.has_remote_cache() {
            return Ok(CacheState::Done { hit: None });
        }
        if !payload.cas_options.enable_integrated_cache_queries {
            self.request_key_query(task, payload, dynamic);
            return Ok(CacheState::WaitingForKeyQuery);
        }

        // Integrated queries ask the mirror from within the compile
        match query_remote_key(context, &payload.cache_key).await {
            Ok(true) => self.after_key_query(task, payload, dynamic).await,
            Ok(false) => Ok(CacheState::Done { hit: None }),
            Err(e) if payload.cas_options.enable_strict_cas_errors => Err(e),
            Err(e) => {
                warn!(task = %task.identifier, error = %e, "integrated cache key query failed");
                Ok(CacheState::Done { hit: None })
            }
        }
    }

    async fn after_key_query(
        &self,
        task: &ExecutableTask,
        payload: &CompilationCachePayload,
        dynamic: &dyn DynamicTaskExecutionDelegate,
    ) -> Result<CacheState> {
        let cas = dynamic
            .operation_context()
            .cas()
            .ok_or_else(|| TaskError::other("caching is enabled, but no CAS was provided"))?;
        match lookup_local(cas.as_ref(), &payload.cache_key).await? {
            Some(result) => self.request_materialization(task, payload, result, dynamic).await,
            None => Ok(CacheState::Done { hit: None }),
        }
    }

    async fn replay(
        &self,
        payload: &CompilationCachePayload,
        result: &CompilationResult,
        cas: &dyn ContentStore,
    ) -> Result<()> {
        let ids = result.ordered_for(payload)?;
        for (id, path) in ids.iter().zip(&payload.output_paths) {
            CasFsNode::export(id, cas, path).await?;
        }
        Ok(())
    }

    async fn store_result(
        &self,
        payload: &CompilationCachePayload,
        context: &OperationContext,
        cas: &dyn ContentStore,
    ) -> Result<()> {
        let mut outputs = Vec::with_capacity(payload.output_paths.len());
        for (name, path) in payload.output_names.iter().zip(&payload.output_paths) {
            outputs.push((name.clone(), CasFsNode::import(path, cas).await?));
        }
        let value = cas.store(CompilationResult { outputs }.to_object()).await?;
        cas.cache(&value, &payload.cache_key).await?;
        if let Some(remote) = context.remote() {
            remote.upload(&payload.cache_key, &value, cas).await?;
        }
        Ok(())
    }

    async fn compile(
        &self,
        task: &ExecutableTask,
        payload: &CompilationCachePayload,
        dynamic: &dyn DynamicTaskExecutionDelegate,
        client: &dyn ClientDelegate,
        output: &dyn TaskOutputDelegate,
    ) -> CommandResult {
        if dynamic.cancellation().is_cancelled() {
            return CommandResult::Cancelled;
        }
        output.increment_task_counter(TaskCounter::CompilationCacheMisses);
        if payload.cas_options.enable_diagnostic_remarks {
            output.note(&format!("compilation cache miss for key {}", payload.cache_key));
        }

        let result = match process::run_tool(
            &task.command_line_strings(),
            &task.environment,
            &task.working_directory,
            dynamic,
            client,
            output,
        )
        .await
        {
            Ok(result) => result,
            Err(e) => {
                output.error(&e.to_string());
                return CommandResult::Failed;
            }
        };
        if !result.is_success() {
            return result;
        }

        let context = dynamic.operation_context();
        let Some(cas) = context.cas() else {
            return result;
        };
        if let Err(e) = self.store_result(payload, context, cas.as_ref()).await {
            let message = format!("failed to store compilation outputs: {e}");
            if report_cache_error(&payload.cas_options, output, &message) {
                return CommandResult::Failed;
            }
        }
        result
    }
}

#[async_trait]
impl TaskAction for CachedCompileTaskAction {
    fn tool_identifier(&self) -> &'static str {
        Self::TOOL_IDENTIFIER
    }

    fn serialize_payload(&self, serializer: &mut Serializer) {
        self.serialize(serializer);
    }

    async fn task_setup(
        &mut self,
        task: &ExecutableTask,
        _execution: &dyn TaskExecutionDelegate,
        dynamic: &dyn DynamicTaskExecutionDelegate,
    ) {
        self.state = match self.setup(task, dynamic).await {
            Ok(state) => state,
            Err(e) => {
                error!(task = %task.identifier, error = %e, "compilation cache setup failed");
                CacheState::ExecutionError(e.to_string())
            }
        };
    }

    async fn task_dependency_ready(
        &mut self,
        task: &ExecutableTask,
        dependency_id: TaskId,
        value: Option<BuildValueKind>,
        dynamic: &dyn DynamicTaskExecutionDelegate,
        _execution: &dyn TaskExecutionDelegate,
    ) {
        let payload = match Self::payload(task) {
            Ok(payload) => payload,
            Err(e) => {
                self.state = CacheState::ExecutionError(e.to_string());
                return;
            }
        };
        let strict = payload.cas_options.enable_strict_cas_errors;
        let failed = value.map_or(true, |value| value.is_failed());

        self.state = match std::mem::take(&mut self.state) {
            CacheState::WaitingForKeyQuery if dependency_id == KEY_QUERY_ID => {
                if failed && strict {
                    CacheState::ExecutionError("compilation cache key query failed".to_string())
                } else if failed {
                    CacheState::Done { hit: None }
                } else {
                    match self.after_key_query(task, payload, dynamic).await {
                        Ok(state) => state,
                        Err(e) => CacheState::ExecutionError(e.to_string()),
                    }
                }
            }
            CacheState::WaitingForOutputDownloads {
                mut open,
                result,
                mut degraded,
            } if open.contains(&dependency_id) => {
                open.remove(&dependency_id);
                degraded |= failed;
                if failed && strict {
                    CacheState::ExecutionError("compilation output materialization failed".to_string())
                } else if !open.is_empty() {
                    CacheState::WaitingForOutputDownloads {
                        open,
                        result,
                        degraded,
                    }
                } else if degraded {
                    CacheState::Done { hit: None }
                } else {
                    CacheState::Done { hit: Some(result) }
                }
            }
            CacheState::ExecutionError(message) => CacheState::ExecutionError(message),
            state => {
                let message = format!(
                    "unexpected dependency {dependency_id} in state: {state}"
                );
                error!(task = %task.identifier, "{}", message);
                CacheState::ExecutionError(message)
            }
        };
    }

    #[instrument(skip_all, fields(task = %task.identifier))]
    async fn perform_task_action(
        &mut self,
        task: &ExecutableTask,
        dynamic: &dyn DynamicTaskExecutionDelegate,
        _execution: &dyn TaskExecutionDelegate,
        client: &dyn ClientDelegate,
        output: &dyn TaskOutputDelegate,
    ) -> CommandResult {
        let hit = match std::mem::take(&mut self.state) {
            CacheState::ExecutionError(message) => {
                output.error(&message);
                return CommandResult::Failed;
            }
            CacheState::Done { hit } => hit,
            state => {
                output.error(&format!("Finished compilation in unexpected state: {state}"));
                return CommandResult::Failed;
            }
        };
        let payload = match Self::payload(task) {
            Ok(payload) => payload,
            Err(e) => {
                output.error(&e.to_string());
                return CommandResult::Failed;
            }
        };

        if let (Some(result), Some(cas)) = (hit, dynamic.operation_context().cas()) {
            match self.replay(payload, &result, cas.as_ref()).await {
                Ok(()) => {
                    output.increment_task_counter(TaskCounter::CompilationCacheHits);
                    if payload.cas_options.enable_diagnostic_remarks {
                        output.remark(&format!("replayed compilation cache hit for key {}", payload.cache_key));
                    }
                    return CommandResult::Succeeded;
                }
                Err(e) if is_missing_object(&e) => {
                    if payload.cas_options.enable_diagnostic_remarks {
                        output.note(&e.to_string());
                    }
                }
                Err(e) => {
                    let message = format!("failed to replay compilation cache hit: {e}");
                    if report_cache_error(&payload.cas_options, output, &message) {
                        return CommandResult::Failed;
                    }
                }
            }
        }

        self.compile(task, payload, dynamic, client, output).await
    }
}

impl Serializable for CachedCompileTaskAction {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.serialize_aggregate(0, |_| {});
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> std::result::Result<Self, SerializationError> {
        deserializer.begin_aggregate(0)?;
        Ok(Self::new())
    }
}
