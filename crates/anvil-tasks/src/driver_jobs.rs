//! Dynamic scheduling of compiler driver jobs
//!
//! A driver task runs in three phases. It waits for its execution inputs,
//! requests a planning task, then requests the planned jobs as dynamic tasks
//! until every job it tracks has reported back. Finishing a job may reveal
//! further jobs, which are requested and tracked as well.
//!
//! Three scheduling actions share the state machine and differ only in which
//! jobs they pick from the plan, see [`DriverJobPartition`].
//!
//! Task ids: `0..N` are execution inputs, `N` is the planning task and job
//! ids start at `N + 1`. Target job `i` maps to `N + 1 + 2i` and explicit
//! job `i` to `N + 2 + 2i`, so ids stay distinct as discovered jobs are
//! appended to the plan.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anvil_cas::CasOptions;
use anvil_core::serialization::{Deserializer, Serializable, Serializer};
use anvil_core::{SerializationError, Signature, SignatureBuilder};
use async_trait::async_trait;
use tracing::{debug, error, info, instrument};

use crate::action::{executable_task_for, DynamicTaskKey, DynamicTaskSpec, TaskAction};
use crate::context::OperationContext;
use crate::delegates::{
    with_activity, ClientDelegate, Diagnostic, DiagnosticBehavior, DynamicTaskExecutionDelegate,
    DynamicTaskRequest, TaskExecutionDelegate, TaskOutputDelegate,
};
use crate::error::{Result, TaskError};
use crate::fs::FsProxy;
use crate::planned_build::{
    DriverJob, DriverJobKind, DriverPayload, JobKey, PlannedBuild, PlannedDriverJob,
};
use crate::process;
use crate::task::{
    BuildCommand, BuildValueKind, CommandResult, DependencyData, DynamicTaskReason, ExecutableTask,
    ExecutionNode, TaskId, TaskPayload, TaskPriority,
};

/// Identity of the planning task of one driver invocation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DriverPlanningTaskKey {
    pub payload: DriverPayload,
}

/// Identity of one planned driver job
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DriverJobTaskKey {
    /// Unique id of the planned build the job belongs to
    pub identifier: String,
    pub variant: String,
    pub architecture: String,
    pub job_key: JobKey,
    pub job_signature: Signature,
    pub compiler_location: PathBuf,
    pub cas_options: Option<CasOptions>,
}

impl DriverJobTaskKey {
    pub fn new(payload: &DriverPayload, planned: &PlannedDriverJob) -> Self {
        Self {
            identifier: payload.unique_id.clone(),
            variant: payload.variant.clone(),
            architecture: payload.architecture.clone(),
            job_key: planned.key,
            job_signature: planned.job.signature(),
            compiler_location: payload.compiler_location.clone(),
            cas_options: payload.cas_options.clone(),
        }
    }

    /// The key of another job of the same planned build
    pub fn sibling(&self, planned: &PlannedDriverJob) -> Self {
        Self {
            job_key: planned.key,
            job_signature: planned.job.signature(),
            ..self.clone()
        }
    }
}

impl Serializable for DriverJobTaskKey {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.serialize_aggregate(7, |s| {
            s.serialize(&self.identifier);
            s.serialize(&self.variant);
            s.serialize(&self.architecture);
            s.serialize(&self.job_key);
            s.serialize(&self.job_signature);
            s.serialize(&self.compiler_location);
            s.serialize(&self.cas_options);
        });
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> std::result::Result<Self, SerializationError> {
        deserializer.begin_aggregate(7)?;
        Ok(Self {
            identifier: deserializer.deserialize()?,
            variant: deserializer.deserialize()?,
            architecture: deserializer.deserialize()?,
            job_key: deserializer.deserialize()?,
            job_signature: deserializer.deserialize()?,
            compiler_location: deserializer.deserialize()?,
            cas_options: deserializer.deserialize()?,
        })
    }
}

/// Signature a per-file compile is reported under when its batch was skipped
pub fn per_file_subtask_signature(variant: &str, architecture: &str, input: &Path) -> Signature {
    let mut builder = SignatureBuilder::new();
    builder
        .add_str(DriverJobKind::Compile.rule_info_type())
        .add_str(variant)
        .add_str(architecture)
        .add_path(input);
    builder.finish()
}

/// Identity of a module build, shared by every target that imports the module
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DriverExplicitDependencyJobTaskKey {
    pub architecture: String,
    pub job_signature: Signature,
    pub compiler_location: PathBuf,
    pub cas_options: Option<CasOptions>,
}

impl Serializable for DriverExplicitDependencyJobTaskKey {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.serialize_aggregate(4, |s| {
            s.serialize(&self.architecture);
            s.serialize(&self.job_signature);
            s.serialize(&self.compiler_location);
            s.serialize(&self.cas_options);
        });
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> std::result::Result<Self, SerializationError> {
        deserializer.begin_aggregate(4)?;
        Ok(Self {
            architecture: deserializer.deserialize()?,
            job_signature: deserializer.deserialize()?,
            compiler_location: deserializer.deserialize()?,
            cas_options: deserializer.deserialize()?,
        })
    }
}

/// The key a driver job is requested under
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DriverJobIdentity {
    Target(DriverJobTaskKey),
    ExplicitDependency(DriverExplicitDependencyJobTaskKey),
}

impl DriverJobIdentity {
    /// Key for a job of the build planned for `payload`
    pub fn new(payload: &DriverPayload, planned: &PlannedDriverJob) -> Self {
        if planned.job.is_explicit_dependency_build() {
            Self::ExplicitDependency(DriverExplicitDependencyJobTaskKey {
                architecture: payload.architecture.clone(),
                job_signature: planned.job.signature(),
                compiler_location: payload.compiler_location.clone(),
                cas_options: payload.cas_options.clone(),
            })
        } else {
            Self::Target(DriverJobTaskKey::new(payload, planned))
        }
    }

    /// Key for a job this one waits for; module builds only wait for module builds
    pub fn dependency(&self, planned: &PlannedDriverJob) -> Option<Self> {
        let explicit = planned.job.is_explicit_dependency_build();
        match self {
            Self::Target(key) if explicit => Some(Self::ExplicitDependency(DriverExplicitDependencyJobTaskKey {
                architecture: key.architecture.clone(),
                job_signature: planned.job.signature(),
                compiler_location: key.compiler_location.clone(),
                cas_options: key.cas_options.clone(),
            })),
            Self::Target(key) => Some(Self::Target(key.sibling(planned))),
            Self::ExplicitDependency(key) if explicit => Some(Self::ExplicitDependency(
                DriverExplicitDependencyJobTaskKey {
                    job_signature: planned.job.signature(),
                    ..key.clone()
                },
            )),
            Self::ExplicitDependency(_) => None,
        }
    }

    pub fn job_signature(&self) -> &Signature {
        match self {
            Self::Target(key) => &key.job_signature,
            Self::ExplicitDependency(key) => &key.job_signature,
        }
    }

    pub fn is_explicit_dependency(&self) -> bool {
        matches!(self, Self::ExplicitDependency(_))
    }

    /// The planned job behind this key and the build it belongs to
    pub fn resolve(&self, context: &OperationContext) -> Result<(Arc<PlannedBuild>, PlannedDriverJob)> {
        let graph = context.module_dependency_graph();
        match self {
            Self::Target(key) => {
                let build = graph.query_planned_build(&key.identifier)?;
                let planned = build
                    .planned_job(key.job_key)
                    .ok_or_else(|| TaskError::MissingDriverJob {
                        identifier: key.identifier.clone(),
                        key: key.job_key.to_string(),
                    })?;
                Ok((build, planned))
            }
            Self::ExplicitDependency(key) => graph.query_explicit_dependency_job(&key.job_signature),
        }
    }

    fn task_identifier(&self) -> String {
        match self {
            Self::Target(key) => format!("driver-job:{}:{}", key.identifier, key.job_key),
            Self::ExplicitDependency(key) => {
                format!("driver-explicit-job:{}:{}", key.architecture, key.job_signature)
            }
        }
    }

    fn rule_info(&self, job: &DriverJob) -> Vec<String> {
        match self {
            Self::Target(key) => job.rule_info(&key.variant, &key.architecture),
            Self::ExplicitDependency(key) => vec![
                format!("ExplicitDependency{}", job.kind.rule_info_type()),
                key.architecture.clone(),
                job.outputs
                    .first()
                    .map(|output| output.display().to_string())
                    .unwrap_or_else(|| "<unknown>".to_string()),
            ],
        }
    }

    fn from_task_key(key: &DynamicTaskKey) -> Option<Self> {
        match key {
            DynamicTaskKey::DriverJob(key) => Some(Self::Target(key.clone())),
            DynamicTaskKey::DriverExplicitDependencyJob(key) => Some(Self::ExplicitDependency(key.clone())),
            _ => None,
        }
    }

    fn into_task_key(self) -> DynamicTaskKey {
        match self {
            Self::Target(key) => DynamicTaskKey::DriverJob(key),
            Self::ExplicitDependency(key) => DynamicTaskKey::DriverExplicitDependencyJob(key),
        }
    }
}

impl Serializable for DriverJobIdentity {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.serialize_aggregate(2, |s| match self {
            Self::Target(key) => {
                s.serialize(&0u8);
                s.serialize(key);
            }
            Self::ExplicitDependency(key) => {
                s.serialize(&1u8);
                s.serialize(key);
            }
        });
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> std::result::Result<Self, SerializationError> {
        deserializer.begin_aggregate(2)?;
        match deserializer.deserialize::<u8>()? {
            0 => Ok(Self::Target(deserializer.deserialize()?)),
            1 => Ok(Self::ExplicitDependency(deserializer.deserialize()?)),
            tag => Err(SerializationError::UnsupportedVariant {
                type_name: "DriverJobIdentity",
                tag: tag as u64,
            }),
        }
    }
}

/// Request a driver job; each request runs the job unless an equal one is still running
fn request_job(
    dynamic: &dyn DynamicTaskExecutionDelegate,
    task: &ExecutableTask,
    identity: DriverJobIdentity,
    planned: &PlannedDriverJob,
    task_id: TaskId,
) {
    // Module builds are shared and not attributed to the requesting target
    let for_target = if identity.is_explicit_dependency() {
        None
    } else {
        task.for_target.clone()
    };
    dynamic.request_dynamic_task(DynamicTaskRequest {
        tool_identifier: DriverJobTaskAction::TOOL_IDENTIFIER.to_string(),
        task_key: identity.into_task_key(),
        task_id,
        single_use: true,
        working_directory: planned
            .job
            .working_directory
            .clone()
            .unwrap_or_else(|| task.working_directory.clone()),
        environment: task.environment.clone(),
        for_target,
        priority: planned.job.priority(),
        show_environment: task.show_environment,
        reason: Some(DynamicTaskReason::WasScheduledByDriver),
        detached: false,
    });
}

/// Which jobs of a planned build a scheduling action is responsible for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DriverJobPartition {
    /// Jobs other targets' compilation waits on
    CompilationRequirements,
    /// Compiles, then verification and everything after compilation
    Compilation,
    /// Modules the target imports
    ExplicitModules,
}

impl DriverJobPartition {
    pub const ALL: [Self; 3] = [
        Self::CompilationRequirements,
        Self::Compilation,
        Self::ExplicitModules,
    ];

    pub fn tool_identifier(self) -> &'static str {
        match self {
            Self::CompilationRequirements => "driver-compilation-requirements",
            Self::Compilation => "driver-compilation",
            Self::ExplicitModules => "driver-explicit-modules",
        }
    }

    /// Jobs whose completion this action awaits before the secondary jobs
    pub fn primary_jobs(self, build: &PlannedBuild) -> Vec<PlannedDriverJob> {
        match self {
            Self::CompilationRequirements => build.compilation_requirement_jobs(),
            Self::Compilation => build.compilation_jobs(),
            Self::ExplicitModules => build.explicit_module_jobs(),
        }
    }

    /// Jobs that must run but are awaited elsewhere
    pub fn untracked_primary_jobs(self, build: &PlannedBuild) -> Vec<PlannedDriverJob> {
        match self {
            Self::Compilation => build.compilation_requirement_jobs(),
            Self::CompilationRequirements | Self::ExplicitModules => Vec::new(),
        }
    }

    pub fn secondary_jobs(self, build: &PlannedBuild) -> Vec<PlannedDriverJob> {
        match self {
            Self::Compilation => {
                let mut jobs = build.verification_jobs();
                jobs.extend(build.after_compilation_jobs());
                jobs
            }
            Self::CompilationRequirements | Self::ExplicitModules => Vec::new(),
        }
    }

    /// Only the last action of a driver invocation reports skipped jobs
    pub fn should_report_skipped_jobs(self) -> bool {
        self == Self::Compilation
    }

    /// Explicit module jobs never reveal follow-up jobs
    pub fn discovers_jobs(self) -> bool {
        self != Self::ExplicitModules
    }
}

impl Serializable for DriverJobPartition {
    fn serialize(&self, serializer: &mut Serializer) {
        let tag: u8 = match self {
            Self::CompilationRequirements => 0,
            Self::Compilation => 1,
            Self::ExplicitModules => 2,
        };
        serializer.serialize(&tag);
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> std::result::Result<Self, SerializationError> {
        match deserializer.deserialize::<u8>()? {
            0 => Ok(Self::CompilationRequirements),
            1 => Ok(Self::Compilation),
            2 => Ok(Self::ExplicitModules),
            tag => Err(SerializationError::UnsupportedVariant {
                type_name: "DriverJobPartition",
                tag: tag as u64,
            }),
        }
    }
}

/// Maps job keys to task ids and back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct JobIds {
    base: TaskId,
}

impl JobIds {
    fn new(execution_input_count: usize) -> Self {
        Self {
            base: execution_input_count as TaskId + 1,
        }
    }

    fn planning(&self) -> TaskId {
        self.base - 1
    }

    fn id(&self, key: JobKey) -> TaskId {
        match key {
            JobKey::Target(index) => self.base + 2 * index as TaskId,
            JobKey::ExplicitDependency(index) => self.base + 2 * index as TaskId + 1,
        }
    }

    fn key(&self, id: TaskId) -> Option<JobKey> {
        let offset = id.checked_sub(self.base)?;
        let index = (offset / 2) as usize;
        Some(if offset % 2 == 0 {
            JobKey::Target(index)
        } else {
            JobKey::ExplicitDependency(index)
        })
    }
}

#[derive(Debug, Default)]
enum SchedulingState {
    #[default]
    Initial,
    WaitingForExecutionInputs {
        open: BTreeSet<TaskId>,
        ids: JobIds,
    },
    Planning {
        ids: JobIds,
    },
    RequestingDriverJobs {
        primary: BTreeSet<TaskId>,
        secondary: BTreeSet<TaskId>,
        discovered: BTreeSet<TaskId>,
        ids: JobIds,
    },
    FailedDependencies,
    ExecutionError(String),
}

impl fmt::Display for SchedulingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initial => write!(f, "initial"),
            Self::WaitingForExecutionInputs { open, .. } => {
                write!(f, "waiting for {} execution inputs", open.len())
            }
            Self::Planning { .. } => write!(f, "planning"),
            Self::RequestingDriverJobs {
                primary,
                secondary,
                discovered,
                ..
            } => write!(
                f,
                "requesting driver jobs ({} primary, {} secondary, {} discovered outstanding)",
                primary.len(),
                secondary.len(),
                discovered.len()
            ),
            Self::FailedDependencies => write!(f, "failed dependencies"),
            Self::ExecutionError(message) => write!(f, "execution error: {message}"),
        }
    }
}

/// Outstanding job ids while requesting driver jobs
#[derive(Debug, Default)]
struct TrackedJobs {
    primary: BTreeSet<TaskId>,
    secondary: BTreeSet<TaskId>,
    discovered: BTreeSet<TaskId>,
}

/// Schedules the jobs of one driver invocation that fall in its partition
#[derive(Debug)]
pub struct DriverJobSchedulingTaskAction {
    partition: DriverJobPartition,
    state: SchedulingState,
}

impl DriverJobSchedulingTaskAction {
    pub fn new(partition: DriverJobPartition) -> Self {
        Self {
            partition,
            state: SchedulingState::Initial,
        }
    }

    pub fn partition(&self) -> DriverJobPartition {
        self.partition
    }

    fn fail(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!(tool = self.partition.tool_identifier(), "{}", message);
        self.state = SchedulingState::ExecutionError(message);
    }

    fn request_planning(
        &self,
        task: &ExecutableTask,
        payload: &DriverPayload,
        ids: JobIds,
        dynamic: &dyn DynamicTaskExecutionDelegate,
    ) {
        debug!(task = %task.identifier, id = ids.planning(), "requesting driver planning");
        dynamic.request_dynamic_task(DynamicTaskRequest {
            tool_identifier: DriverPlanningTaskAction::TOOL_IDENTIFIER.to_string(),
            task_key: DynamicTaskKey::DriverPlanning(DriverPlanningTaskKey {
                payload: payload.clone(),
            }),
            task_id: ids.planning(),
            single_use: true,
            working_directory: task.working_directory.clone(),
            environment: task.environment.clone(),
            for_target: task.for_target.clone(),
            priority: TaskPriority::UnblocksDownstreamTasks,
            show_environment: task.show_environment,
            reason: Some(DynamicTaskReason::WasScheduledByDriver),
            detached: false,
        });
    }

    fn schedule_jobs(
        &self,
        task: &ExecutableTask,
        payload: &DriverPayload,
        ids: JobIds,
        jobs: &[PlannedDriverJob],
        dynamic: &dyn DynamicTaskExecutionDelegate,
    ) -> Vec<TaskId> {
        jobs.iter()
            .map(|planned| {
                let task_id = ids.id(planned.key);
                request_job(dynamic, task, DriverJobIdentity::new(payload, planned), planned, task_id);
                task_id
            })
            .collect()
    }

    fn schedule_discovered_jobs(
        &self,
        task: &ExecutableTask,
        payload: &DriverPayload,
        build: &PlannedBuild,
        ids: JobIds,
        finished_id: TaskId,
        dynamic: &dyn DynamicTaskExecutionDelegate,
    ) -> Result<Vec<TaskId>> {
        let Some(finished) = ids.key(finished_id).and_then(|key| build.planned_target_job(key)) else {
            return Ok(Vec::new());
        };

        let mut signature = SignatureBuilder::new();
        signature
            .add_str(&task.identifier)
            .add_str("driverjobdiscoveryactivity")
            .add_number(finished_id);
        let rule_info = format!(
            "DriverJobDiscovery {} {} {}",
            payload.variant,
            payload.architecture,
            finished.description()
        );
        let description = format!("Discovering tasks after '{}'", finished.description());

        with_activity(
            dynamic,
            &rule_info,
            &description,
            &signature.finish(),
            task.for_target.as_ref(),
            |_| {
                let discovered = build.discovered_jobs_after_finishing(finished.key);
                Ok(self.schedule_jobs(task, payload, ids, &discovered, dynamic))
            },
        )
    }

    fn advance(
        &self,
        task: &ExecutableTask,
        payload: &DriverPayload,
        ids: JobIds,
        finished_id: TaskId,
        tracked: &mut TrackedJobs,
        dynamic: &dyn DynamicTaskExecutionDelegate,
    ) -> Result<()> {
        let graph = dynamic.operation_context().module_dependency_graph();
        if tracked.primary.remove(&finished_id) {
            if !self.partition.discovers_jobs() {
                return Ok(());
            }
            let build = graph.query_planned_build(&payload.unique_id)?;
            let discovered =
                self.schedule_discovered_jobs(task, payload, &build, ids, finished_id, dynamic)?;
            tracked.discovered.extend(discovered);
            if tracked.primary.is_empty() {
                let secondary = self.partition.secondary_jobs(&build);
                tracked
                    .secondary
                    .extend(self.schedule_jobs(task, payload, ids, &secondary, dynamic));
            }
        } else if tracked.secondary.remove(&finished_id) || tracked.discovered.remove(&finished_id) {
            let build = graph.query_planned_build(&payload.unique_id)?;
            let discovered =
                self.schedule_discovered_jobs(task, payload, &build, ids, finished_id, dynamic)?;
            tracked.discovered.extend(discovered);
        }
        Ok(())
    }

    fn start_jobs(
        &self,
        task: &ExecutableTask,
        payload: &DriverPayload,
        ids: JobIds,
        dynamic: &dyn DynamicTaskExecutionDelegate,
    ) -> Result<TrackedJobs> {
        let build = dynamic
            .operation_context()
            .module_dependency_graph()
            .query_planned_build(&payload.unique_id)?;
        let primary = self.partition.primary_jobs(&build);
        let mut tracked = TrackedJobs::default();
        if primary.is_empty() {
            let secondary = self.partition.secondary_jobs(&build);
            tracked.secondary = self.schedule_jobs(task, payload, ids, &secondary, dynamic).into_iter().collect();
        } else {
            tracked.primary = self.schedule_jobs(task, payload, ids, &primary, dynamic).into_iter().collect();
            let untracked = self.partition.untracked_primary_jobs(&build);
            self.schedule_jobs(task, payload, ids, &untracked, dynamic);
        }
        info!(
            task = %task.identifier,
            primary = tracked.primary.len(),
            secondary = tracked.secondary.len(),
            "requested driver jobs"
        );
        Ok(tracked)
    }

    fn report_skipped_jobs(
        &self,
        task: &ExecutableTask,
        payload: &DriverPayload,
        build: &PlannedBuild,
        output: &dyn TaskOutputDelegate,
    ) {
        for job in build.skipped_jobs() {
            match (&task.for_target, job.display_inputs.as_slice()) {
                (Some(target), [input]) if job.kind == DriverJobKind::Compile => {
                    let signature =
                        per_file_subtask_signature(&payload.variant, &payload.architecture, input);
                    output.previously_batched_subtask_up_to_date(&signature, target);
                }
                _ => output.subtask_up_to_date(
                    &job.rule_info(&payload.variant, &payload.architecture),
                    &job.signature(),
                ),
            }
        }
    }

    async fn verify_scanner_dependencies(
        &self,
        task: &ExecutableTask,
        planning_dependencies: &[String],
        fs: &dyn FsProxy,
        output: &dyn TaskOutputDelegate,
    ) -> Result<()> {
        let Some(DependencyData::MakefileIgnoringSubsequentOutputs(path)) = &task.dependency_data else {
            return Ok(());
        };
        let contents = fs.read(path).await?;
        let contents = String::from_utf8_lossy(&contents);
        let first_line = contents.split('\n').next().unwrap_or_default();
        let make_inputs: BTreeSet<&str> = first_line
            .split_once(':')
            .map(|(_, inputs)| inputs)
            .unwrap_or_default()
            .split(' ')
            .map(str::trim)
            .filter(|input| !input.is_empty())
            .collect();
        let scanner_inputs: BTreeSet<&str> = planning_dependencies.iter().map(String::as_str).collect();

        for missed in make_inputs.difference(&scanner_inputs) {
            output.emit_diagnostic(
                Diagnostic::new(
                    DiagnosticBehavior::Error,
                    format!(
                        "Dependency scanner failed to report input '{}' present in '{}'",
                        missed,
                        path.display()
                    ),
                )
                .with_location(path.clone()),
            );
        }
        Ok(())
    }

    async fn complete(
        &self,
        state: SchedulingState,
        task: &ExecutableTask,
        dynamic: &dyn DynamicTaskExecutionDelegate,
        execution: &dyn TaskExecutionDelegate,
        output: &dyn TaskOutputDelegate,
    ) -> Result<()> {
        let payload = task
            .driver_payload()
            .ok_or(TaskError::InvalidPayload("driver job scheduling"))?;
        let graph = dynamic.operation_context().module_dependency_graph();
        let build = graph.query_planned_build(&payload.unique_id)?;

        let (primary, secondary, discovered, ids) = match state {
            SchedulingState::RequestingDriverJobs {
                primary,
                secondary,
                discovered,
                ids,
            } => (primary, secondary, discovered, ids),
            state => {
                return Err(TaskError::protocol(format!(
                    "Finished job execution in unexpected state: {state}"
                )))
            }
        };
        if !(primary.is_empty() && secondary.is_empty() && discovered.is_empty()) {
            let jobs: Vec<String> = primary
                .iter()
                .chain(&secondary)
                .chain(&discovered)
                .filter_map(|id| ids.key(*id))
                .filter_map(|key| build.planned_job(key))
                .map(|planned| format!("{} ({})", planned.description(), planned.key))
                .collect();
            return Err(TaskError::protocol(format!(
                "Some planned jobs weren't tracked accordingly: [{}]",
                jobs.join(", ")
            )));
        }

        if self.partition.should_report_skipped_jobs() {
            self.report_skipped_jobs(task, payload, &build, output);
        }

        let planning_dependencies = graph.query_planning_dependencies(&payload.unique_id)?;
        if execution.user_preferences().enable_debug_activity_logs {
            output.emit_output(
                format!(
                    "Discovered dependency nodes:\n{}\n",
                    planning_dependencies.join("\n")
                )
                .as_bytes(),
            );
        }

        if payload.verify_scanner_dependencies || execution.user_preferences().verify_scanner_dependencies {
            self.verify_scanner_dependencies(task, &planning_dependencies, execution.fs(), output)
                .await?;
        }

        // Prefix match: the root and the planner's paths are both normalized
        let filtering_root = payload
            .dependency_filtering_root
            .as_ref()
            .map(|root| root.display().to_string());
        for dependency in planning_dependencies {
            let filtered = filtering_root
                .as_deref()
                .is_some_and(|root| dependency.starts_with(root));
            if !filtered {
                dynamic.discovered_dependency_node(ExecutionNode::path(dependency));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl TaskAction for DriverJobSchedulingTaskAction {
    fn tool_identifier(&self) -> &'static str {
        self.partition.tool_identifier()
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
        self.state = SchedulingState::Initial;
        let Some(inputs) = &task.execution_inputs else {
            return;
        };

        let ids = JobIds::new(inputs.len());
        for (index, node) in inputs.iter().enumerate() {
            dynamic.request_input_node(node.clone(), index as TaskId);
        }
        if !inputs.is_empty() {
            self.state = SchedulingState::WaitingForExecutionInputs {
                open: (0..inputs.len() as TaskId).collect(),
                ids,
            };
            return;
        }

        match task.driver_payload() {
            Some(payload) => {
                self.request_planning(task, payload, ids, dynamic);
                self.state = SchedulingState::Planning { ids };
            }
            None => self.fail(TaskError::InvalidPayload("driver job scheduling").to_string()),
        }
    }

    async fn task_dependency_ready(
        &mut self,
        task: &ExecutableTask,
        dependency_id: TaskId,
        value: Option<BuildValueKind>,
        dynamic: &dyn DynamicTaskExecutionDelegate,
        execution: &dyn TaskExecutionDelegate,
    ) {
        let Some(value) = value else {
            self.state = SchedulingState::FailedDependencies;
            return;
        };
        if value.is_failed() {
            let tolerated = execution.build_command() == BuildCommand::PrepareForIndexing
                && matches!(self.state, SchedulingState::WaitingForExecutionInputs { .. });
            if !tolerated {
                debug!(task = %task.identifier, id = dependency_id, value = ?value, "dependency failed");
                self.state = SchedulingState::FailedDependencies;
                return;
            }
        }

        let Some(payload) = task.driver_payload() else {
            self.fail(TaskError::InvalidPayload("driver job scheduling").to_string());
            return;
        };

        match std::mem::take(&mut self.state) {
            SchedulingState::Initial => {
                self.fail("task_dependency_ready unexpectedly called in initial state");
            }
            SchedulingState::WaitingForExecutionInputs { mut open, ids } => {
                open.remove(&dependency_id);
                if open.is_empty() {
                    self.request_planning(task, payload, ids, dynamic);
                    self.state = SchedulingState::Planning { ids };
                } else {
                    self.state = SchedulingState::WaitingForExecutionInputs { open, ids };
                }
            }
            SchedulingState::Planning { ids } => {
                if value == BuildValueKind::SkippedCommand {
                    // Planning did not run, e.g. in a partial build that never started it
                    self.state = SchedulingState::FailedDependencies;
                } else if dependency_id != ids.planning() {
                    self.state = SchedulingState::Planning { ids };
                } else {
                    match self.start_jobs(task, payload, ids, dynamic) {
                        Ok(tracked) => {
                            self.state = SchedulingState::RequestingDriverJobs {
                                primary: tracked.primary,
                                secondary: tracked.secondary,
                                discovered: tracked.discovered,
                                ids,
                            };
                        }
                        Err(e) => self.fail(e.to_string()),
                    }
                }
            }
            SchedulingState::RequestingDriverJobs {
                primary,
                secondary,
                discovered,
                ids,
            } => {
                let mut tracked = TrackedJobs {
                    primary,
                    secondary,
                    discovered,
                };
                match self.advance(task, payload, ids, dependency_id, &mut tracked, dynamic) {
                    Ok(()) => {
                        self.state = SchedulingState::RequestingDriverJobs {
                            primary: tracked.primary,
                            secondary: tracked.secondary,
                            discovered: tracked.discovered,
                            ids,
                        };
                    }
                    Err(e) => self.fail(e.to_string()),
                }
            }
            terminal @ (SchedulingState::FailedDependencies | SchedulingState::ExecutionError(_)) => {
                self.state = terminal;
            }
        }
    }

    #[instrument(skip_all, fields(task = %task.identifier, tool = self.partition.tool_identifier()))]
    async fn perform_task_action(
        &mut self,
        task: &ExecutableTask,
        dynamic: &dyn DynamicTaskExecutionDelegate,
        execution: &dyn TaskExecutionDelegate,
        _client: &dyn ClientDelegate,
        output: &dyn TaskOutputDelegate,
    ) -> CommandResult {
        let state = std::mem::take(&mut self.state);
        match state {
            SchedulingState::ExecutionError(message) => {
                output.error(&message);
                CommandResult::Failed
            }
            SchedulingState::FailedDependencies => CommandResult::Cancelled,
            state => match self.complete(state, task, dynamic, execution, output).await {
                Ok(()) => CommandResult::Succeeded,
                Err(e) => {
                    error!(error = %e, "driver job scheduling failed");
                    output.error(&e.to_string());
                    CommandResult::Failed
                }
            },
        }
    }
}

impl Serializable for DriverJobSchedulingTaskAction {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.serialize_aggregate(1, |s| s.serialize(&self.partition));
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> std::result::Result<Self, SerializationError> {
        deserializer.begin_aggregate(1)?;
        Ok(Self::new(deserializer.deserialize()?))
    }
}

/// Plans a driver invocation and registers the result with the operation
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DriverPlanningTaskAction;

impl DriverPlanningTaskAction {
    pub const TOOL_IDENTIFIER: &'static str = "driver-planning";

    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TaskAction for DriverPlanningTaskAction {
    fn tool_identifier(&self) -> &'static str {
        Self::TOOL_IDENTIFIER
    }

    fn serialize_payload(&self, serializer: &mut Serializer) {
        self.serialize(serializer);
    }

    #[instrument(skip_all, fields(task = %task.identifier))]
    async fn perform_task_action(
        &mut self,
        task: &ExecutableTask,
        dynamic: &dyn DynamicTaskExecutionDelegate,
        execution: &dyn TaskExecutionDelegate,
        _client: &dyn ClientDelegate,
        output: &dyn TaskOutputDelegate,
    ) -> CommandResult {
        let Some(payload) = task.driver_payload() else {
            output.error(&TaskError::InvalidPayload("driver planning").to_string());
            return CommandResult::Failed;
        };
        let context = dynamic.operation_context();
        match context
            .planner()
            .plan(payload, &task.working_directory, execution.fs())
            .await
        {
            Ok(plan) => {
                let build = context
                    .module_dependency_graph()
                    .register(payload.unique_id.clone(), plan);
                info!(id = %payload.unique_id, jobs = build.target_build_job_count(), "planned driver build");
                CommandResult::Succeeded
            }
            Err(e) => {
                output.error(&format!("failed to plan '{}': {e}", payload.unique_id));
                CommandResult::Failed
            }
        }
    }
}

impl Serializable for DriverPlanningTaskAction {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.serialize_aggregate(0, |_| {});
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> std::result::Result<Self, SerializationError> {
        deserializer.begin_aggregate(0)?;
        Ok(Self)
    }
}

/// Builds planning tasks
#[derive(Debug, Default, Clone, Copy)]
pub struct DriverPlanningSpec;

impl DynamicTaskSpec for DriverPlanningSpec {
    fn build_executable_task(
        &self,
        request: &DynamicTaskRequest,
        _context: &OperationContext,
    ) -> Result<ExecutableTask> {
        let DynamicTaskKey::DriverPlanning(key) = &request.task_key else {
            return Err(TaskError::UnexpectedTaskKey(request.tool_identifier.clone()));
        };
        let payload = &key.payload;
        Ok(
            executable_task_for(request, format!("driver-planning:{}", payload.unique_id))
                .with_rule_info([
                    "DriverPlanning",
                    payload.variant.as_str(),
                    payload.architecture.as_str(),
                    payload.unique_id.as_str(),
                ])
                .with_payload(TaskPayload::Driver(payload.clone())),
        )
    }

    fn create_task_action(
        &self,
        _request: &DynamicTaskRequest,
        _context: &OperationContext,
    ) -> Result<Box<dyn TaskAction>> {
        Ok(Box::new(DriverPlanningTaskAction::new()))
    }
}

#[derive(Debug, Default)]
enum JobState {
    #[default]
    Initial,
    WaitingForDependencies(BTreeSet<TaskId>),
    FailedDependencies,
    ExecutionError(String),
}

/// Runs one planned driver job once the jobs it consumes have finished
#[derive(Debug)]
pub struct DriverJobTaskAction {
    identity: DriverJobIdentity,
    state: JobState,
}

impl DriverJobTaskAction {
    pub const TOOL_IDENTIFIER: &'static str = "driver-job";

    pub fn new(identity: DriverJobIdentity) -> Self {
        Self {
            identity,
            state: JobState::Initial,
        }
    }

    pub fn identity(&self) -> &DriverJobIdentity {
        &self.identity
    }

    fn request_dependencies(
        &self,
        task: &ExecutableTask,
        dynamic: &dyn DynamicTaskExecutionDelegate,
    ) -> Result<BTreeSet<TaskId>> {
        let (build, planned) = self.identity.resolve(dynamic.operation_context())?;

        let mut requested = BTreeSet::new();
        for (index, dependency) in planned.dependencies.iter().enumerate() {
            let Some(dependency) = build.planned_job(*dependency) else {
                continue;
            };
            let Some(identity) = self.identity.dependency(&dependency) else {
                debug!(task = %task.identifier, job = %dependency.key, "module build does not wait for target jobs");
                continue;
            };
            let task_id = index as TaskId;
            request_job(dynamic, task, identity, &dependency, task_id);
            requested.insert(task_id);
        }
        Ok(requested)
    }
}

#[async_trait]
impl TaskAction for DriverJobTaskAction {
    fn tool_identifier(&self) -> &'static str {
        Self::TOOL_IDENTIFIER
    }

    fn serialize_payload(&self, serializer: &mut Serializer) {
        self.serialize(serializer);
    }

    fn compute_initial_signature(&self) -> Option<Signature> {
        Some(self.identity.job_signature().clone())
    }

    async fn task_setup(
        &mut self,
        task: &ExecutableTask,
        _execution: &dyn TaskExecutionDelegate,
        dynamic: &dyn DynamicTaskExecutionDelegate,
    ) {
        self.state = match self.request_dependencies(task, dynamic) {
            Ok(requested) => JobState::WaitingForDependencies(requested),
            Err(e) => JobState::ExecutionError(e.to_string()),
        };
    }

    async fn task_dependency_ready(
        &mut self,
        _task: &ExecutableTask,
        dependency_id: TaskId,
        value: Option<BuildValueKind>,
        _dynamic: &dyn DynamicTaskExecutionDelegate,
        _execution: &dyn TaskExecutionDelegate,
    ) {
        self.state = match (std::mem::take(&mut self.state), value) {
            (JobState::WaitingForDependencies(mut open), Some(value)) if !value.is_failed() => {
                open.remove(&dependency_id);
                JobState::WaitingForDependencies(open)
            }
            (JobState::WaitingForDependencies(_), _) => JobState::FailedDependencies,
            (JobState::Initial, _) => JobState::ExecutionError(
                "task_dependency_ready unexpectedly called in initial state".to_string(),
            ),
            (terminal, _) => terminal,
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
        match std::mem::take(&mut self.state) {
            JobState::ExecutionError(message) => {
                output.error(&message);
                return CommandResult::Failed;
            }
            JobState::FailedDependencies => return CommandResult::Cancelled,
            JobState::WaitingForDependencies(open) if !open.is_empty() => {
                output.error(&format!("driver job finished with {} dependencies outstanding", open.len()));
                return CommandResult::Failed;
            }
            JobState::Initial | JobState::WaitingForDependencies(_) => {}
        }

        match process::run_tool(
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
                CommandResult::Failed
            }
        }
    }
}

impl Serializable for DriverJobTaskAction {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.serialize_aggregate(1, |s| s.serialize(&self.identity));
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> std::result::Result<Self, SerializationError> {
        deserializer.begin_aggregate(1)?;
        Ok(Self::new(deserializer.deserialize()?))
    }
}

/// Builds tasks for planned driver jobs
#[derive(Debug, Default, Clone, Copy)]
pub struct DriverJobSpec;

impl DriverJobSpec {
    fn identity(request: &DynamicTaskRequest) -> Result<DriverJobIdentity> {
        DriverJobIdentity::from_task_key(&request.task_key)
            .ok_or_else(|| TaskError::UnexpectedTaskKey(request.tool_identifier.clone()))
    }
}

impl DynamicTaskSpec for DriverJobSpec {
    fn build_executable_task(
        &self,
        request: &DynamicTaskRequest,
        context: &OperationContext,
    ) -> Result<ExecutableTask> {
        let identity = Self::identity(request)?;
        let (_, planned) = identity.resolve(context)?;

        Ok(executable_task_for(request, identity.task_identifier())
            .with_rule_info(identity.rule_info(&planned.job))
            .with_command_line(planned.job.command_line.iter().map(String::as_str))
            .with_inputs(planned.job.inputs.clone())
            .with_outputs(planned.job.outputs.clone()))
    }

    fn create_task_action(
        &self,
        request: &DynamicTaskRequest,
        _context: &OperationContext,
    ) -> Result<Box<dyn TaskAction>> {
        Ok(Box::new(DriverJobTaskAction::new(Self::identity(request)?)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegates::LocalClientDelegate;
    use crate::output::{CollectingOutputDelegate, OutputEvent};
    use crate::planned_build::tests::sample_jobs;
    use crate::planned_build::DriverJob;
    use crate::planning::DriverPlan;
    use crate::task::ConfiguredTarget;
    use crate::testing::{RecordingDynamicDelegate, TestExecutionDelegate};
    use anvil_core::config::PreferencesConfig;
    use std::collections::{BTreeMap, VecDeque};
    use std::sync::Arc;
    use tempfile::TempDir;

    const INPUTS: usize = 2;

    struct Harness {
        dynamic: RecordingDynamicDelegate,
        execution: TestExecutionDelegate,
        task: ExecutableTask,
        build: Arc<PlannedBuild>,
    }

    impl Harness {
        fn new(build: PlannedBuild, dependencies: Vec<&str>) -> Self {
            Self::with_payload(build, dependencies, DriverPayload::new("App", "plan.json"))
        }

        fn with_payload(build: PlannedBuild, dependencies: Vec<&str>, payload: DriverPayload) -> Self {
            let dynamic = RecordingDynamicDelegate::new(OperationContext::new());
            let build = dynamic.operation_context().module_dependency_graph().register(
                "App",
                DriverPlan {
                    build,
                    dependencies: dependencies.into_iter().map(String::from).collect(),
                },
            );
            let task = ExecutableTask::new("driver App")
                .with_working_directory("/work")
                .with_execution_inputs(
                    (0..INPUTS)
                        .map(|i| ExecutionNode::path(format!("/src/input{i}.swift")))
                        .collect(),
                )
                .with_target(ConfiguredTarget::new("App", "target-guid"))
                .with_payload(TaskPayload::Driver(payload));
            Self {
                dynamic,
                execution: TestExecutionDelegate::new(),
                task,
                build,
            }
        }

        fn ids(&self) -> JobIds {
            JobIds::new(INPUTS)
        }

        async fn setup(&self, action: &mut DriverJobSchedulingTaskAction) {
            action.task_setup(&self.task, &self.execution, &self.dynamic).await;
        }

        async fn deliver(&self, action: &mut DriverJobSchedulingTaskAction, id: TaskId, value: Option<BuildValueKind>) {
            action
                .task_dependency_ready(&self.task, id, value, &self.dynamic, &self.execution)
                .await;
        }

        async fn deliver_inputs(&self, action: &mut DriverJobSchedulingTaskAction) {
            for id in 0..INPUTS as TaskId {
                self.deliver(action, id, Some(BuildValueKind::ExistingInput)).await;
            }
        }

        /// Completes every requested task, picking the next one with `pick`
        async fn run_to_completion(
            &self,
            action: &mut DriverJobSchedulingTaskAction,
            mut pick: impl FnMut(usize) -> usize,
        ) -> Vec<DynamicTaskRequest> {
            let mut completed = Vec::new();
            let mut pending: VecDeque<DynamicTaskRequest> = VecDeque::new();
            loop {
                pending.extend(self.dynamic.take_dynamic_requests());
                if pending.is_empty() {
                    break;
                }
                let index = pick(pending.len()) % pending.len();
                let Some(request) = pending.remove(index) else {
                    break;
                };
                self.deliver(action, request.task_id, Some(BuildValueKind::SuccessfulCommand))
                    .await;
                completed.push(request);
            }
            completed
        }

        async fn perform(&self, action: &mut DriverJobSchedulingTaskAction) -> (CommandResult, CollectingOutputDelegate) {
            let output = CollectingOutputDelegate::new();
            let result = action
                .perform_task_action(&self.task, &self.dynamic, &self.execution, &LocalClientDelegate, &output)
                .await;
            (result, output)
        }
    }

    fn job_keys(requests: &[DynamicTaskRequest]) -> BTreeSet<JobKey> {
        requests
            .iter()
            .filter_map(|r| match &r.task_key {
                DynamicTaskKey::DriverJob(key) => Some(key.job_key),
                _ => None,
            })
            .collect()
    }

    /// Small deterministic generator so shuffles are reproducible
    struct Lcg(u64);

    impl Lcg {
        fn next(&mut self) -> usize {
            self.0 = self.0.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (self.0 >> 33) as usize
        }
    }

    #[test]
    fn test_job_ids_are_injective() {
        let ids = JobIds::new(3);
        assert_eq!(ids.planning(), 3);
        let mut seen = BTreeSet::new();
        for index in 0..50 {
            for key in [JobKey::Target(index), JobKey::ExplicitDependency(index)] {
                let id = ids.id(key);
                assert!(id > ids.planning());
                assert!(seen.insert(id));
                assert_eq!(ids.key(id), Some(key));
            }
        }
        assert_eq!(ids.key(2), None);
    }

    #[tokio::test]
    async fn test_inputs_then_planning_then_jobs() {
        let harness = Harness::new(PlannedBuild::new(sample_jobs(), true), vec!["/src/a.swift"]);
        let mut action = DriverJobSchedulingTaskAction::new(DriverJobPartition::Compilation);
        harness.setup(&mut action).await;

        let inputs = harness.dynamic.input_requests();
        assert_eq!(inputs.iter().map(|(_, id)| *id).collect::<Vec<_>>(), vec![0, 1]);
        assert!(harness.dynamic.dynamic_requests().is_empty());

        harness.deliver_inputs(&mut action).await;
        let planning = harness.dynamic.take_dynamic_requests();
        assert_eq!(planning.len(), 1);
        assert_eq!(planning[0].task_id, harness.ids().planning());
        assert_eq!(planning[0].tool_identifier, DriverPlanningTaskAction::TOOL_IDENTIFIER);
        assert!(planning[0].single_use);

        // Other ids are ignored while planning
        harness.deliver(&mut action, 99, Some(BuildValueKind::SuccessfulCommand)).await;
        assert!(harness.dynamic.dynamic_requests().is_empty());

        harness
            .deliver(&mut action, harness.ids().planning(), Some(BuildValueKind::SuccessfulCommand))
            .await;
        let jobs = harness.dynamic.dynamic_requests();
        // Compile a.swift is primary, emit module is untracked primary
        assert_eq!(job_keys(&jobs), BTreeSet::from([JobKey::Target(0), JobKey::Target(1)]));
        assert!(jobs.iter().all(|r| r.tool_identifier == DriverJobTaskAction::TOOL_IDENTIFIER));
        assert!(jobs.iter().all(|r| r.for_target.is_some()));
        assert!(jobs.iter().all(|r| r.single_use));

        let completed = harness.run_to_completion(&mut action, |_| 0).await;
        let all = job_keys(&completed);
        assert!(all.contains(&JobKey::Target(2)));
        assert!(all.contains(&JobKey::Target(3)));

        let (result, output) = harness.perform(&mut action).await;
        assert_eq!(result, CommandResult::Succeeded, "{:?}", output.errors());
        assert_eq!(
            harness.dynamic.discovered_nodes(),
            vec![ExecutionNode::path("/src/a.swift")]
        );
    }

    #[tokio::test]
    async fn test_untracked_callbacks_are_ignored() {
        let harness = Harness::new(PlannedBuild::new(sample_jobs(), true), vec![]);
        let mut action = DriverJobSchedulingTaskAction::new(DriverJobPartition::Compilation);
        harness.setup(&mut action).await;
        harness.deliver_inputs(&mut action).await;
        harness.dynamic.take_dynamic_requests();
        harness
            .deliver(&mut action, harness.ids().planning(), Some(BuildValueKind::SuccessfulCommand))
            .await;
        harness.dynamic.take_dynamic_requests();

        // Emit module (target 0) is requested but not tracked
        let emit_module = harness.ids().id(JobKey::Target(0));
        harness
            .deliver(&mut action, emit_module, Some(BuildValueKind::SuccessfulCommand))
            .await;
        assert!(harness.dynamic.take_dynamic_requests().is_empty());
        assert!(matches!(action.state, SchedulingState::RequestingDriverJobs { ref primary, .. } if primary.len() == 1));
    }

    #[tokio::test]
    async fn test_completeness_over_generated_plans() {
        let kinds = [
            DriverJobKind::Compile,
            DriverJobKind::Compile,
            DriverJobKind::EmitModule,
            DriverJobKind::VerifyModuleInterface,
            DriverJobKind::Link,
            DriverJobKind::ExplicitModule,
        ];
        for seed in 0..40u64 {
            let mut rng = Lcg(seed);
            let count = 1 + rng.next() % 8;
            let jobs: Vec<DriverJob> = (0..count)
                .map(|i| {
                    DriverJob::new(kinds[rng.next() % kinds.len()], format!("job{i}"))
                        .with_outputs([format!("/build/{seed}/{i}.o")])
                })
                .collect();
            let eager = rng.next() % 2 == 0;
            let mut build = PlannedBuild::new(jobs, eager);
            let target_count = build.target_build_job_count();
            let mut discoveries = 0;
            if target_count > 0 {
                for _ in 0..rng.next() % 4 {
                    let after = rng.next() % (target_count + discoveries);
                    build = build.with_discovered_jobs(
                        after,
                        vec![DriverJob::new(DriverJobKind::Compile, format!("found{discoveries}"))],
                    );
                    discoveries += 1;
                }
            }

            let harness = Harness::new(build, vec![]);
            let mut action = DriverJobSchedulingTaskAction::new(DriverJobPartition::Compilation);
            harness.setup(&mut action).await;
            harness.deliver_inputs(&mut action).await;
            let mut shuffle = Lcg(seed ^ 0x5eed);
            harness.run_to_completion(&mut action, |_| shuffle.next()).await;

            let (result, output) = harness.perform(&mut action).await;
            assert_eq!(result, CommandResult::Succeeded, "seed {seed}: {:?}", output.errors());
            assert!(
                matches!(action.state, SchedulingState::Initial),
                "state is reset after perform"
            );
        }
    }

    #[tokio::test]
    async fn test_callback_order_does_not_matter() {
        let discovered = vec![DriverJob::new(DriverJobKind::Compile, "b.swift")];
        let mut outcomes = Vec::new();
        for seed in 0..6u64 {
            let build = PlannedBuild::new(sample_jobs(), false).with_discovered_jobs(1, discovered.clone());
            let harness = Harness::new(build, vec![]);
            let mut action = DriverJobSchedulingTaskAction::new(DriverJobPartition::CompilationRequirements);
            harness.setup(&mut action).await;
            harness.deliver_inputs(&mut action).await;
            let mut shuffle = Lcg(seed);
            let completed = harness
                .run_to_completion(&mut action, |len| if seed == 0 { len - 1 } else { shuffle.next() })
                .await;
            let requested: BTreeMap<TaskId, String> = completed
                .iter()
                .map(|r| (r.task_id, r.task_key.to_string()))
                .collect();
            let (result, _) = harness.perform(&mut action).await;
            outcomes.push((result, requested));
        }
        assert_eq!(outcomes[0].0, CommandResult::Succeeded);
        assert!(outcomes.iter().all(|outcome| *outcome == outcomes[0]));
        // Planning, emit module, compile a.swift and the discovered b.swift
        assert_eq!(outcomes[0].1.len(), 4);
    }

    #[tokio::test]
    async fn test_missing_callback_fails_loudly() {
        let harness = Harness::new(PlannedBuild::new(sample_jobs(), true), vec![]);
        let mut action = DriverJobSchedulingTaskAction::new(DriverJobPartition::Compilation);
        harness.setup(&mut action).await;
        harness.deliver_inputs(&mut action).await;
        harness.dynamic.take_dynamic_requests();
        harness
            .deliver(&mut action, harness.ids().planning(), Some(BuildValueKind::SuccessfulCommand))
            .await;

        let (result, output) = harness.perform(&mut action).await;
        assert_eq!(result, CommandResult::Failed);
        let errors = output.errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("Some planned jobs weren't tracked accordingly: [a.swift"));
    }

    #[tokio::test]
    async fn test_perform_in_unexpected_state() {
        let harness = Harness::new(PlannedBuild::new(sample_jobs(), true), vec![]);
        let mut action = DriverJobSchedulingTaskAction::new(DriverJobPartition::Compilation);
        harness.setup(&mut action).await;

        let (result, output) = harness.perform(&mut action).await;
        assert_eq!(result, CommandResult::Failed);
        assert!(output.errors()[0].starts_with("Finished job execution in unexpected state"));
    }

    #[tokio::test]
    async fn test_failed_job_cancels() {
        let harness = Harness::new(PlannedBuild::new(sample_jobs(), true), vec![]);
        let mut action = DriverJobSchedulingTaskAction::new(DriverJobPartition::Compilation);
        harness.setup(&mut action).await;
        harness.deliver_inputs(&mut action).await;
        harness
            .deliver(&mut action, harness.ids().planning(), Some(BuildValueKind::SuccessfulCommand))
            .await;
        harness.dynamic.take_dynamic_requests();

        let compile = harness.ids().id(JobKey::Target(1));
        harness
            .deliver(&mut action, compile, Some(BuildValueKind::FailedCommand))
            .await;
        // Later callbacks do not revive the action
        harness
            .deliver(&mut action, compile, Some(BuildValueKind::SuccessfulCommand))
            .await;
        assert!(harness.dynamic.take_dynamic_requests().is_empty());

        let (result, output) = harness.perform(&mut action).await;
        assert_eq!(result, CommandResult::Cancelled);
        assert!(output.errors().is_empty());
    }

    #[tokio::test]
    async fn test_missing_value_cancels() {
        let harness = Harness::new(PlannedBuild::new(sample_jobs(), true), vec![]);
        let mut action = DriverJobSchedulingTaskAction::new(DriverJobPartition::Compilation);
        harness.setup(&mut action).await;
        harness.deliver(&mut action, 0, None).await;
        assert_eq!(harness.perform(&mut action).await.0, CommandResult::Cancelled);
    }

    #[tokio::test]
    async fn test_skipped_planning_cancels() {
        let harness = Harness::new(PlannedBuild::new(sample_jobs(), true), vec![]);
        let mut action = DriverJobSchedulingTaskAction::new(DriverJobPartition::Compilation);
        harness.setup(&mut action).await;
        harness.deliver_inputs(&mut action).await;
        harness
            .deliver(&mut action, harness.ids().planning(), Some(BuildValueKind::SkippedCommand))
            .await;
        assert_eq!(harness.perform(&mut action).await.0, CommandResult::Cancelled);
    }

    #[tokio::test]
    async fn test_indexing_tolerates_failed_inputs() {
        let mut harness = Harness::new(PlannedBuild::new(sample_jobs(), true), vec![]);
        harness.execution = TestExecutionDelegate::new().with_build_command(BuildCommand::PrepareForIndexing);
        let mut action = DriverJobSchedulingTaskAction::new(DriverJobPartition::Compilation);
        harness.setup(&mut action).await;
        harness.deliver(&mut action, 0, Some(BuildValueKind::MissingInput)).await;
        harness.deliver(&mut action, 1, Some(BuildValueKind::ExistingInput)).await;
        assert_eq!(harness.dynamic.dynamic_requests().len(), 1);

        harness.run_to_completion(&mut action, |_| 0).await;
        assert_eq!(harness.perform(&mut action).await.0, CommandResult::Succeeded);

        // The same failure cancels a regular build
        let harness = Harness::new(PlannedBuild::new(sample_jobs(), true), vec![]);
        let mut action = DriverJobSchedulingTaskAction::new(DriverJobPartition::Compilation);
        harness.setup(&mut action).await;
        harness.deliver(&mut action, 0, Some(BuildValueKind::MissingInput)).await;
        harness.deliver(&mut action, 1, Some(BuildValueKind::ExistingInput)).await;
        assert!(harness.dynamic.take_dynamic_requests().is_empty());
        assert_eq!(harness.perform(&mut action).await.0, CommandResult::Cancelled);
    }

    #[tokio::test]
    async fn test_explicit_modules_are_not_attributed() {
        let harness = Harness::new(PlannedBuild::new(sample_jobs(), false), vec![]);
        let mut action = DriverJobSchedulingTaskAction::new(DriverJobPartition::ExplicitModules);
        harness.setup(&mut action).await;
        harness.deliver_inputs(&mut action).await;
        let completed = harness.run_to_completion(&mut action, |_| 0).await;

        let jobs: Vec<_> = completed
            .iter()
            .filter(|r| r.tool_identifier == DriverJobTaskAction::TOOL_IDENTIFIER)
            .collect();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].task_id, harness.ids().id(JobKey::ExplicitDependency(0)));
        assert!(jobs[0].for_target.is_none());
        // Another target importing the same module requests the same task
        let module = &harness.build.explicit_module_jobs()[0];
        let other = DriverJobIdentity::new(&DriverPayload::new("Tests", "tests.json"), module);
        assert_eq!(jobs[0].task_key, other.into_task_key());
        assert_eq!(jobs[0].priority, TaskPriority::UnblocksDownstreamTasks);
        assert!(harness.dynamic.activities().is_empty());
        assert_eq!(harness.perform(&mut action).await.0, CommandResult::Succeeded);
    }

    #[tokio::test]
    async fn test_discovery_runs_in_activity() {
        let build = PlannedBuild::new(sample_jobs(), true)
            .with_discovered_jobs(1, vec![DriverJob::new(DriverJobKind::Compile, "b.swift")]);
        let harness = Harness::new(build, vec![]);
        let mut action = DriverJobSchedulingTaskAction::new(DriverJobPartition::Compilation);
        harness.setup(&mut action).await;
        harness.deliver_inputs(&mut action).await;
        let completed = harness.run_to_completion(&mut action, |_| 0).await;
        assert!(job_keys(&completed).contains(&JobKey::Target(4)));

        let activities = harness.dynamic.activities();
        let compile = activities
            .iter()
            .find(|a| a.execution_description == "Discovering tasks after 'a.swift'")
            .unwrap();
        assert_eq!(
            compile.rule_info,
            format!("DriverJobDiscovery normal {} a.swift", std::env::consts::ARCH)
        );
        assert!(activities
            .iter()
            .all(|a| a.status == Some(crate::delegates::ActivityStatus::Succeeded)));
        assert_eq!(harness.perform(&mut action).await.0, CommandResult::Succeeded);
    }

    #[tokio::test]
    async fn test_skipped_jobs_are_reported() {
        let skipped = vec![
            DriverJob::new(DriverJobKind::Compile, "c.swift").with_display_inputs(["/src/c.swift"]),
            DriverJob::new(DriverJobKind::Compile, "batch").with_display_inputs(["/src/d.swift", "/src/e.swift"]),
            DriverJob::new(DriverJobKind::EmitModule, "App.swiftmodule"),
        ];
        let build = PlannedBuild::new(sample_jobs(), true).with_skipped_jobs(skipped);
        let harness = Harness::new(build, vec![]);
        let mut action = DriverJobSchedulingTaskAction::new(DriverJobPartition::Compilation);
        harness.setup(&mut action).await;
        harness.deliver_inputs(&mut action).await;
        harness.run_to_completion(&mut action, |_| 0).await;
        let (result, output) = harness.perform(&mut action).await;
        assert_eq!(result, CommandResult::Succeeded);

        let arch = std::env::consts::ARCH;
        let events = output.events();
        assert!(events.contains(&OutputEvent::PreviouslyBatchedSubtaskUpToDate {
            signature: per_file_subtask_signature("normal", arch, Path::new("/src/c.swift")),
            target: ConfiguredTarget::new("App", "target-guid"),
        }));
        let up_to_date: Vec<_> = events
            .iter()
            .filter_map(|e| match e {
                OutputEvent::SubtaskUpToDate { rule_info, .. } => Some(rule_info.clone()),
                _ => None,
            })
            .collect();
        let descriptions: Vec<&str> = up_to_date.iter().map(|r| r[3].as_str()).collect();
        assert_eq!(descriptions, vec!["batch", "App.swiftmodule"]);
        assert_eq!(up_to_date[1][0], "EmitModule");
        assert_eq!(up_to_date[1][2], arch);
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn test_dependency_filtering_and_debug_output() {
        let payload = DriverPayload::new("App", "plan.json").with_dependency_filtering_root("/sdk");
        let mut harness = Harness::with_payload(
            PlannedBuild::new(Vec::new(), true),
            vec!["/sdk/usr/include/module.modulemap", "/src/a.swift"],
            payload,
        );
        harness.execution = TestExecutionDelegate::new().with_preferences(PreferencesConfig {
            enable_debug_activity_logs: true,
            ..Default::default()
        });
        let mut action = DriverJobSchedulingTaskAction::new(DriverJobPartition::CompilationRequirements);
        harness.setup(&mut action).await;
        harness.deliver_inputs(&mut action).await;
        harness.run_to_completion(&mut action, |_| 0).await;

        let (result, output) = harness.perform(&mut action).await;
        assert_eq!(result, CommandResult::Succeeded);
        assert_eq!(
            harness.dynamic.discovered_nodes(),
            vec![ExecutionNode::path("/src/a.swift")]
        );
        assert_eq!(
            String::from_utf8(output.output()).unwrap(),
            "Discovered dependency nodes:\n/sdk/usr/include/module.modulemap\n/src/a.swift\n"
        );
    }

    #[tokio::test]
    async fn test_scanner_verification() {
        let temp = TempDir::new().unwrap();
        let depfile = temp.path().join("a.d");
        std::fs::write(
            &depfile,
            "/build/a.o : /src/a.swift /src/b.swift  /src/c.swift\n/build/a.swiftdeps : /src/z.swift\n",
        )
        .unwrap();

        let payload = DriverPayload::new("App", "plan.json").with_scanner_verification(true);
        let mut harness = Harness::with_payload(PlannedBuild::new(Vec::new(), true), vec!["/src/a.swift"], payload);
        harness.task = harness
            .task
            .clone()
            .with_dependency_data(DependencyData::MakefileIgnoringSubsequentOutputs(depfile.clone()));
        let mut action = DriverJobSchedulingTaskAction::new(DriverJobPartition::Compilation);
        harness.setup(&mut action).await;
        harness.deliver_inputs(&mut action).await;
        harness.run_to_completion(&mut action, |_| 0).await;

        let (result, output) = harness.perform(&mut action).await;
        assert_eq!(result, CommandResult::Succeeded);
        assert_eq!(
            output.errors(),
            vec![
                format!("Dependency scanner failed to report input '/src/b.swift' present in '{}'", depfile.display()),
                format!("Dependency scanner failed to report input '/src/c.swift' present in '{}'", depfile.display()),
            ]
        );
        assert!(output.diagnostics().iter().all(|d| d.location.as_deref() == Some(depfile.as_path())));
    }

    #[tokio::test]
    async fn test_empty_execution_inputs_plan_immediately() {
        let harness = Harness::new(PlannedBuild::new(sample_jobs(), true), vec![]);
        let task = harness.task.clone().with_execution_inputs(Vec::new());
        let mut action = DriverJobSchedulingTaskAction::new(DriverJobPartition::Compilation);
        action.task_setup(&task, &harness.execution, &harness.dynamic).await;
        let requests = harness.dynamic.take_dynamic_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].task_id, 0);
    }

    #[tokio::test]
    async fn test_invalid_payload() {
        let harness = Harness::new(PlannedBuild::new(sample_jobs(), true), vec![]);
        let task = ExecutableTask::new("no payload").with_execution_inputs(vec![ExecutionNode::path("/src/a.swift")]);
        let mut action = DriverJobSchedulingTaskAction::new(DriverJobPartition::Compilation);
        action.task_setup(&task, &harness.execution, &harness.dynamic).await;
        action
            .task_dependency_ready(&task, 0, Some(BuildValueKind::ExistingInput), &harness.dynamic, &harness.execution)
            .await;
        let output = CollectingOutputDelegate::new();
        let result = action
            .perform_task_action(&task, &harness.dynamic, &harness.execution, &LocalClientDelegate, &output)
            .await;
        assert_eq!(result, CommandResult::Failed);
        assert_eq!(output.errors(), vec!["invalid payload for driver job scheduling"]);
    }

    #[tokio::test]
    async fn test_planning_action_registers_build() {
        let temp = TempDir::new().unwrap();
        std::fs::write(
            temp.path().join("plan.json"),
            r#"{"jobs": [{"kind": "compile", "description": "a.swift", "command_line": ["true"]}], "dependencies": ["/src/a.swift"]}"#,
        )
        .unwrap();
        let dynamic = RecordingDynamicDelegate::new(OperationContext::new());
        let request = DynamicTaskRequest {
            tool_identifier: DriverPlanningTaskAction::TOOL_IDENTIFIER.to_string(),
            task_key: DynamicTaskKey::DriverPlanning(DriverPlanningTaskKey {
                payload: DriverPayload::new("App", "plan.json"),
            }),
            task_id: 0,
            single_use: true,
            working_directory: temp.path().to_path_buf(),
            environment: Default::default(),
            for_target: None,
            priority: TaskPriority::UnblocksDownstreamTasks,
            show_environment: false,
            reason: None,
            detached: false,
        };
        let task = DriverPlanningSpec
            .build_executable_task(&request, dynamic.operation_context())
            .unwrap();
        assert_eq!(task.rule_info[0], "DriverPlanning");

        let mut action = DriverPlanningSpec
            .create_task_action(&request, dynamic.operation_context())
            .unwrap();
        let output = CollectingOutputDelegate::new();
        let result = action
            .perform_task_action(&task, &dynamic, &TestExecutionDelegate::new(), &LocalClientDelegate, &output)
            .await;
        assert_eq!(result, CommandResult::Succeeded, "{:?}", output.errors());

        let graph = dynamic.operation_context().module_dependency_graph();
        assert_eq!(graph.query_planned_build("App").unwrap().target_build_job_count(), 1);
        assert_eq!(graph.query_planning_dependencies("App").unwrap().len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_job_action_requests_producers_then_runs() {
        let jobs = vec![
            DriverJob::new(DriverJobKind::Compile, "a.swift")
                .with_command_line(["/bin/sh", "-c", "echo compiled"])
                .with_outputs(["/build/a.o"]),
            DriverJob::new(DriverJobKind::Link, "App")
                .with_command_line(["/bin/sh", "-c", "echo linked"])
                .with_inputs(["/build/a.o"]),
        ];
        let harness = Harness::new(PlannedBuild::new(jobs, true), vec![]);
        let link = harness.build.after_compilation_jobs()[0].clone();
        let payload = harness.task.driver_payload().unwrap().clone();
        let request = DynamicTaskRequest {
            tool_identifier: DriverJobTaskAction::TOOL_IDENTIFIER.to_string(),
            task_key: DriverJobIdentity::new(&payload, &link).into_task_key(),
            task_id: 0,
            single_use: true,
            working_directory: PathBuf::from("/"),
            environment: Default::default(),
            for_target: None,
            priority: TaskPriority::Unspecified,
            show_environment: false,
            reason: Some(DynamicTaskReason::WasScheduledByDriver),
            detached: false,
        };
        let context = harness.dynamic.operation_context();
        let task = DriverJobSpec.build_executable_task(&request, context).unwrap();
        assert_eq!(task.rule_info[0], "Link");
        let mut action = DriverJobSpec.create_task_action(&request, context).unwrap();

        action.task_setup(&task, &harness.execution, &harness.dynamic).await;
        let requested = harness.dynamic.take_dynamic_requests();
        assert_eq!(requested.len(), 1);
        assert_eq!(job_keys(&requested), BTreeSet::from([JobKey::Target(0)]));
        action
            .task_dependency_ready(&task, 0, Some(BuildValueKind::SuccessfulCommand), &harness.dynamic, &harness.execution)
            .await;

        let output = CollectingOutputDelegate::new();
        let result = action
            .perform_task_action(&task, &harness.dynamic, &harness.execution, &LocalClientDelegate, &output)
            .await;
        assert_eq!(result, CommandResult::Succeeded);
        assert_eq!(output.output(), b"linked\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_explicit_module_job_waits_for_module_builds() {
        let jobs = vec![
            DriverJob::new(DriverJobKind::ExplicitModule, "SwiftShims")
                .with_command_line(["/bin/sh", "-c", "echo shims"])
                .with_outputs(["/build/SwiftShims.pcm"]),
            DriverJob::new(DriverJobKind::ExplicitModule, "Foundation")
                .with_command_line(["/bin/sh", "-c", "echo foundation"])
                .with_inputs(["/build/SwiftShims.pcm"])
                .with_outputs(["/build/Foundation.pcm"]),
        ];
        let harness = Harness::new(PlannedBuild::new(jobs, false), vec![]);
        let shims = harness.build.explicit_module_jobs()[0].clone();
        let foundation = harness.build.explicit_module_jobs()[1].clone();
        let payload = harness.task.driver_payload().unwrap().clone();
        let request = DynamicTaskRequest {
            tool_identifier: DriverJobTaskAction::TOOL_IDENTIFIER.to_string(),
            task_key: DriverJobIdentity::new(&payload, &foundation).into_task_key(),
            task_id: 0,
            single_use: true,
            working_directory: PathBuf::from("/"),
            environment: Default::default(),
            for_target: None,
            priority: TaskPriority::UnblocksDownstreamTasks,
            show_environment: false,
            reason: Some(DynamicTaskReason::WasScheduledByDriver),
            detached: false,
        };
        let context = harness.dynamic.operation_context();
        let task = DriverJobSpec.build_executable_task(&request, context).unwrap();
        assert_eq!(
            task.rule_info,
            vec![
                "ExplicitDependencyExplicitModule".to_string(),
                payload.architecture.clone(),
                "/build/Foundation.pcm".to_string(),
            ]
        );
        assert!(!task.identifier.contains("App"));
        let mut action = DriverJobSpec.create_task_action(&request, context).unwrap();

        action.task_setup(&task, &harness.execution, &harness.dynamic).await;
        let requested = harness.dynamic.take_dynamic_requests();
        assert_eq!(requested.len(), 1);
        assert_eq!(
            requested[0].task_key,
            DriverJobIdentity::new(&payload, &shims).into_task_key()
        );
        assert!(requested[0].for_target.is_none());
        assert!(requested[0].single_use);
        action
            .task_dependency_ready(&task, 0, Some(BuildValueKind::SuccessfulCommand), &harness.dynamic, &harness.execution)
            .await;

        let output = CollectingOutputDelegate::new();
        let result = action
            .perform_task_action(&task, &harness.dynamic, &harness.execution, &LocalClientDelegate, &output)
            .await;
        assert_eq!(result, CommandResult::Succeeded, "{:?}", output.errors());
        assert_eq!(output.output(), b"foundation\n");
    }

    #[test]
    fn test_job_identity_round_trip() {
        let build = PlannedBuild::new(sample_jobs(), false);
        let payload = DriverPayload::new("App", "plan.json");
        for planned in [build.explicit_module_jobs()[0].clone(), build.after_compilation_jobs()[0].clone()] {
            let identity = DriverJobIdentity::new(&payload, &planned);
            let bytes = anvil_core::serialization::to_bytes(&DriverJobTaskAction::new(identity.clone()));
            let decoded: DriverJobTaskAction = anvil_core::serialization::from_bytes(&bytes).unwrap();
            assert_eq!(decoded.identity(), &identity);
        }
    }

    #[test]
    fn test_partition_round_trip() {
        for partition in DriverJobPartition::ALL {
            let bytes = anvil_core::serialization::to_bytes(&DriverJobSchedulingTaskAction::new(partition));
            let decoded: DriverJobSchedulingTaskAction = anvil_core::serialization::from_bytes(&bytes).unwrap();
            assert_eq!(decoded.partition(), partition);
        }
    }
}
