//! In-process host scheduler
//!
//! Runs one task action to completion on the current tokio runtime:
//! `task_setup`, then one `task_dependency_ready` call per requested input
//! node or dynamic sub-task, then `perform_task_action`. Sub-tasks are built
//! through the [`TaskActionRegistry`] and run the same way, recursively.
//!
//! Callbacks for one action are delivered one at a time through a channel,
//! so actions never see concurrent calls. Requests with equal keys share a
//! single execution; single-use results are forgotten once they are
//! delivered, so a later request runs the task again. Only `perform_task_action`
//! takes an execution lane; detached and network-bound sub-tasks skip the
//! lanes entirely.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anvil_cas::PruneReport;
use anvil_core::config::{PreferencesConfig, SchedulerConfig};
use anvil_core::Signature;
use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::action::{DynamicTaskKey, TaskAction, TaskActionRegistry};
use crate::context::OperationContext;
use crate::delegates::{
    ActivityId, ActivityStatus, ClientDelegate, DynamicTaskExecutionDelegate, DynamicTaskRequest,
    LocalClientDelegate, TaskExecutionDelegate, TaskOutputDelegate,
};
use crate::fs::{FsProxy, LocalFs};
use crate::output::TracingOutputDelegate;
use crate::task::{
    BuildCommand, BuildValueKind, CommandResult, ConfiguredTarget, EnvironmentBindings,
    ExecutableTask, ExecutionNode, TaskId, TaskPriority,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

type DependencyValue = Option<BuildValueKind>;
type SharedExecution = Shared<BoxFuture<'static, DependencyValue>>;

/// Execution delegate for builds on the local machine
#[derive(Debug, Default)]
pub struct LocalExecutionDelegate {
    build_command: BuildCommand,
    preferences: PreferencesConfig,
    environment: EnvironmentBindings,
}

impl LocalExecutionDelegate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: set the build command
    pub fn with_build_command(mut self, build_command: BuildCommand) -> Self {
        self.build_command = build_command;
        self
    }

    /// Builder: set user preferences
    pub fn with_preferences(mut self, preferences: PreferencesConfig) -> Self {
        self.preferences = preferences;
        self
    }

    /// Builder: set the build environment
    pub fn with_environment(mut self, environment: EnvironmentBindings) -> Self {
        self.environment = environment;
        self
    }
}

impl TaskExecutionDelegate for LocalExecutionDelegate {
    fn fs(&self) -> &dyn FsProxy {
        &LocalFs
    }

    fn build_command(&self) -> BuildCommand {
        self.build_command
    }

    fn user_preferences(&self) -> &PreferencesConfig {
        &self.preferences
    }

    fn environment(&self) -> &EnvironmentBindings {
        &self.environment
    }
}

/// Outcome of [`LocalScheduler::run`]
#[derive(Debug)]
pub struct RunReport {
    pub result: CommandResult,
    /// Nodes actions reported through `discovered_dependency_node`
    pub discovered_dependencies: Vec<ExecutionNode>,
    /// Dynamic sub-tasks that actually executed, after deduplication
    pub dynamic_tasks: usize,
    /// Content store prunes started during the run
    pub prune_reports: Vec<PruneReport>,
}

/// Runs task actions and their dynamic sub-tasks in process
pub struct LocalScheduler {
    context: Arc<OperationContext>,
    registry: Arc<TaskActionRegistry>,
    execution: Arc<dyn TaskExecutionDelegate>,
    client: Arc<dyn ClientDelegate>,
    concurrency: usize,
    allows_external_tool_execution: bool,
    cancellation: CancellationToken,
}

impl std::fmt::Debug for LocalScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalScheduler")
            .field("registry", &self.registry)
            .field("concurrency", &self.concurrency)
            .field("allows_external_tool_execution", &self.allows_external_tool_execution)
            .finish()
    }
}

impl LocalScheduler {
    /// A scheduler with the default registry and a client that always defers
    pub fn new(context: OperationContext, execution: Arc<dyn TaskExecutionDelegate>) -> Self {
        Self {
            context: Arc::new(context),
            registry: Arc::new(TaskActionRegistry::with_defaults()),
            execution,
            client: Arc::new(LocalClientDelegate),
            concurrency: SchedulerConfig::default().concurrency,
            allows_external_tool_execution: false,
            cancellation: CancellationToken::new(),
        }
    }

    /// Builder: set the registry used for dynamic sub-tasks
    pub fn with_registry(mut self, registry: TaskActionRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    /// Builder: set the client delegate
    pub fn with_client(mut self, client: Arc<dyn ClientDelegate>) -> Self {
        self.client = client;
        self
    }

    /// Builder: set the number of execution lanes (at least one)
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Builder: let the client run tools before local spawning
    pub fn with_external_tool_execution(mut self, enabled: bool) -> Self {
        self.allows_external_tool_execution = enabled;
        self
    }

    /// Builder: share a cancellation signal with the caller
    pub fn with_cancellation(mut self, cancellation: CancellationToken) -> Self {
        self.cancellation = cancellation;
        self
    }

    pub fn context(&self) -> &OperationContext {
        &self.context
    }

    /// Cancelling this token cancels every outstanding action of every run
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    /// Run `action` for `task`, including every sub-task it requests
    #[instrument(skip_all, fields(task = %task.identifier, tool = action.tool_identifier()))]
    pub async fn run(
        &self,
        task: ExecutableTask,
        action: Box<dyn TaskAction>,
        output: &dyn TaskOutputDelegate,
    ) -> RunReport {
        let state = Arc::new(RunState {
            context: Arc::clone(&self.context),
            registry: Arc::clone(&self.registry),
            execution: Arc::clone(&self.execution),
            client: Arc::clone(&self.client),
            lanes: Semaphore::new(self.concurrency),
            allows_external_tool_execution: self.allows_external_tool_execution,
            cancellation: self.cancellation.clone(),
            executions: Mutex::new(HashMap::new()),
            discovered: Mutex::new(Vec::new()),
            next_activity: AtomicU64::new(0),
            dynamic_tasks: AtomicUsize::new(0),
        });

        let result = run_action(Arc::clone(&state), task, action, output, false).await;
        let prune_reports = self.context.pruner().wait_for_completion().await;
        for report in &prune_reports {
            for note in &report.notes {
                output.note(note);
            }
            if let Some(error) = &report.error {
                output.warning(&format!("pruning {} failed: {error}", report.cas_path.display()));
            }
        }
        lock(&state.executions).clear();
        let discovered_dependencies = std::mem::take(&mut *lock(&state.discovered));
        let dynamic_tasks = state.dynamic_tasks.load(Ordering::SeqCst);
        info!(result = ?result, dynamic_tasks, "run finished");

        RunReport {
            result,
            discovered_dependencies,
            dynamic_tasks,
            prune_reports,
        }
    }
}

/// State shared by every action of one run
struct RunState {
    context: Arc<OperationContext>,
    registry: Arc<TaskActionRegistry>,
    execution: Arc<dyn TaskExecutionDelegate>,
    client: Arc<dyn ClientDelegate>,
    lanes: Semaphore,
    allows_external_tool_execution: bool,
    cancellation: CancellationToken,
    executions: Mutex<HashMap<DynamicTaskKey, SharedExecution>>,
    discovered: Mutex<Vec<ExecutionNode>>,
    next_activity: AtomicU64,
    dynamic_tasks: AtomicUsize,
}

/// The dynamic execution delegate handed to one action
struct ActionDelegate {
    state: Arc<RunState>,
    task: String,
    working_directory: PathBuf,
    sender: mpsc::UnboundedSender<(TaskId, DependencyValue)>,
    requested: AtomicUsize,
}

impl ActionDelegate {
    fn requested(&self) -> usize {
        self.requested.load(Ordering::SeqCst)
    }

    /// Equal keys share one execution; a single-use entry is dropped once it completes
    fn execution_for(&self, request: DynamicTaskRequest) -> SharedExecution {
        let mut executions = lock(&self.state.executions);
        if let Some(existing) = executions.get(&request.task_key) {
            debug!(task = %self.task, key = %request.task_key, "sharing dynamic task");
            return existing.clone();
        }
        let key = request.task_key.clone();
        let execution = if request.single_use {
            let state = Arc::clone(&self.state);
            let key = key.clone();
            async move {
                let value = execute_dynamic(Arc::clone(&state), request).await;
                lock(&state.executions).remove(&key);
                value
            }
            .boxed()
            .shared()
        } else {
            execute_dynamic(Arc::clone(&self.state), request).boxed().shared()
        };
        executions.insert(key, execution.clone());
        execution
    }
}

#[async_trait]
impl DynamicTaskExecutionDelegate for ActionDelegate {
    fn request_input_node(&self, node: ExecutionNode, id: TaskId) {
        self.requested.fetch_add(1, Ordering::SeqCst);
        let state = Arc::clone(&self.state);
        let sender = self.sender.clone();
        let working_directory = self.working_directory.clone();
        tokio::spawn(async move {
            let value = match node {
                ExecutionNode::Path(path) => {
                    if state.execution.fs().exists(&working_directory.join(&path)).await {
                        BuildValueKind::ExistingInput
                    } else {
                        debug!(path = %path.display(), "missing input");
                        BuildValueKind::MissingInput
                    }
                }
                ExecutionNode::Virtual(_) => BuildValueKind::VirtualInput,
            };
            let _ = sender.send((id, Some(value)));
        });
    }

    fn request_dynamic_task(&self, request: DynamicTaskRequest) {
        self.requested.fetch_add(1, Ordering::SeqCst);
        debug!(
            task = %self.task,
            key = %request.task_key,
            id = request.task_id,
            reason = ?request.reason,
            "dynamic task requested"
        );
        let id = request.task_id;
        let execution = self.execution_for(request);
        let sender = self.sender.clone();
        tokio::spawn(async move {
            let value = execution.await;
            let _ = sender.send((id, value));
        });
    }

    fn discovered_dependency_node(&self, node: ExecutionNode) {
        lock(&self.state.discovered).push(node);
    }

    fn operation_context(&self) -> &OperationContext {
        &self.state.context
    }

    fn allows_external_tool_execution(&self) -> bool {
        self.state.allows_external_tool_execution
    }

    fn cancellation(&self) -> CancellationToken {
        self.state.cancellation.clone()
    }

    fn begin_activity(
        &self,
        rule_info: &str,
        execution_description: &str,
        signature: &Signature,
        target: Option<&ConfiguredTarget>,
    ) -> ActivityId {
        let activity = ActivityId(self.state.next_activity.fetch_add(1, Ordering::SeqCst));
        info!(
            activity = activity.0,
            rule_info,
            signature = %signature.short(),
            target = ?target,
            "{}",
            execution_description
        );
        activity
    }

    fn emit_activity_output(&self, activity: ActivityId, bytes: &[u8]) {
        for line in String::from_utf8_lossy(bytes).lines() {
            debug!(activity = activity.0, "{}", line);
        }
    }

    fn end_activity(&self, activity: ActivityId, status: ActivityStatus) {
        debug!(activity = activity.0, status = ?status, "activity ended");
    }
}

/// Build and run the sub-task behind `request`
async fn execute_dynamic(state: Arc<RunState>, request: DynamicTaskRequest) -> DependencyValue {
    let spec = match state.registry.spec(&request.tool_identifier) {
        Ok(spec) => Arc::clone(spec),
        Err(e) => {
            warn!(key = %request.task_key, error = %e, "cannot run dynamic task");
            return None;
        }
    };
    let built = spec
        .build_executable_task(&request, &state.context)
        .and_then(|task| Ok((task, spec.create_task_action(&request, &state.context)?)));
    let (task, action) = match built {
        Ok(built) => built,
        Err(e) => {
            warn!(key = %request.task_key, error = %e, "failed to construct dynamic task");
            return Some(BuildValueKind::FailedCommand);
        }
    };

    state.dynamic_tasks.fetch_add(1, Ordering::SeqCst);
    let detached = request.detached || request.priority == TaskPriority::Network;
    let output = TracingOutputDelegate::new(task.identifier.clone());
    let result = run_action(state, task, action, &output, detached).await;
    Some(BuildValueKind::from(result))
}

/// Drive one action through setup, its callbacks and perform
async fn run_action(
    state: Arc<RunState>,
    task: ExecutableTask,
    mut action: Box<dyn TaskAction>,
    output: &dyn TaskOutputDelegate,
    detached: bool,
) -> CommandResult {
    let (sender, mut receiver) = mpsc::unbounded_channel();
    let delegate = ActionDelegate {
        state: Arc::clone(&state),
        task: task.identifier.clone(),
        working_directory: task.working_directory.clone(),
        sender,
        requested: AtomicUsize::new(0),
    };
    let execution = Arc::clone(&state.execution);

    action.task_setup(&task, execution.as_ref(), &delegate).await;

    let mut delivered = 0;
    while delivered < delegate.requested() {
        let next = tokio::select! {
            next = receiver.recv() => next,
            _ = state.cancellation.cancelled() => return CommandResult::Cancelled,
        };
        let Some((id, value)) = next else {
            break;
        };
        delivered += 1;
        action
            .task_dependency_ready(&task, id, value, &delegate, execution.as_ref())
            .await;
    }

    if state.cancellation.is_cancelled() {
        return CommandResult::Cancelled;
    }

    let _lane = if detached {
        None
    } else {
        tokio::select! {
            permit = state.lanes.acquire() => permit.ok(),
            _ = state.cancellation.cancelled() => return CommandResult::Cancelled,
        }
    };

    let client = Arc::clone(&state.client);
    let result = action
        .perform_task_action(&task, &delegate, execution.as_ref(), client.as_ref(), output)
        .await;
    debug!(task = %task.identifier, result = ?result, dependencies = delivered, "task finished");
    result
}
