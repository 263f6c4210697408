//! Anvil Tasks - task actions and the executors behind them
//!
//! This crate provides the task action contract and its delegates, the
//! dynamic driver-job scheduling state machine, the generic
//! content-addressable caching executor, the remote compilation cache
//! query/materialize choreography, and an in-process host scheduler.

pub mod action;
pub mod compilation_cache;
pub mod context;
pub mod delegates;
pub mod driver_jobs;
pub mod error;
pub mod fs;
pub mod generic_caching;
pub mod output;
pub mod planned_build;
pub mod planning;
pub mod process;
pub mod scheduler;
pub mod task;

#[cfg(test)]
mod testing;

pub use action::{DynamicTaskKey, DynamicTaskSpec, TaskAction, TaskActionRegistry};
pub use compilation_cache::{
    CachedCompileTaskAction, CompilationCacheKeyQueryTaskAction, CompilationCachePayload,
    CompilationOutputMaterializeTaskAction,
};
pub use context::OperationContext;
pub use delegates::{
    ClientDelegate, Diagnostic, DiagnosticBehavior, DynamicTaskExecutionDelegate,
    DynamicTaskRequest, LocalClientDelegate, TaskCounter, TaskExecutionDelegate,
    TaskOutputDelegate,
};
pub use driver_jobs::{
    DriverJobIdentity, DriverJobPartition, DriverJobSchedulingTaskAction, DriverJobTaskAction,
    DriverPlanningTaskAction,
};
pub use error::{Result, TaskError};
pub use fs::{FsProxy, LocalFs};
pub use generic_caching::GenericCachingTaskAction;
pub use output::{CollectingOutputDelegate, OutputEvent, TracingOutputDelegate};
pub use planned_build::{DriverJob, DriverJobKind, DriverPayload, JobKey, PlannedBuild};
pub use planning::{DriverPlan, DriverPlanner, JsonDriverPlanner, ModuleDependencyGraph};
pub use scheduler::{LocalExecutionDelegate, LocalScheduler, RunReport};
pub use task::{
    BuildCommand, BuildValueKind, CommandLineArgument, CommandResult, ConfiguredTarget,
    EnvironmentBindings, ExecutableTask, ExecutionNode, TaskId, TaskPayload, TaskPriority,
};
