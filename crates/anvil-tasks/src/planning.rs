//! Driver planning and the registry of planned builds

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use anvil_core::Signature;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::error::{Result, TaskError};
use crate::fs::FsProxy;
use crate::planned_build::{DriverJob, DriverPayload, JobKey, PlannedBuild, PlannedDriverJob};

/// Result of planning one driver invocation
#[derive(Debug)]
pub struct DriverPlan {
    pub build: PlannedBuild,
    /// Files the planner read; reported as discovered dependencies
    pub dependencies: Vec<String>,
}

/// Turns a driver payload into a job graph
#[async_trait]
pub trait DriverPlanner: Send + Sync + std::fmt::Debug {
    async fn plan(
        &self,
        payload: &DriverPayload,
        working_directory: &Path,
        fs: &dyn FsProxy,
    ) -> Result<DriverPlan>;
}

#[derive(Debug, Deserialize)]
struct PlanFile {
    jobs: Vec<DriverJob>,
    #[serde(default)]
    discovered: Vec<DiscoveredJobs>,
    #[serde(default)]
    skipped: Vec<DriverJob>,
    #[serde(default)]
    dependencies: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DiscoveredJobs {
    after: usize,
    jobs: Vec<DriverJob>,
}

/// Reads a job graph a driver wrote as JSON to the payload's plan path
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonDriverPlanner;

#[async_trait]
impl DriverPlanner for JsonDriverPlanner {
    #[instrument(skip_all, fields(id = %payload.unique_id))]
    async fn plan(
        &self,
        payload: &DriverPayload,
        working_directory: &Path,
        fs: &dyn FsProxy,
    ) -> Result<DriverPlan> {
        let path = working_directory.join(&payload.plan_path);
        if !fs.exists(&path).await {
            return Err(TaskError::MissingInput(path));
        }
        let contents = fs.read(&path).await?;
        let file: PlanFile = serde_json::from_slice(&contents)?;
        debug!(jobs = file.jobs.len(), "read driver plan");

        let mut build =
            PlannedBuild::new(file.jobs, payload.eager_compilation).with_skipped_jobs(file.skipped);
        for discovered in file.discovered {
            build = build.with_discovered_jobs(discovered.after, discovered.jobs);
        }

        let mut dependencies = file.dependencies;
        dependencies.push(path.display().to_string());
        Ok(DriverPlan {
            build,
            dependencies,
        })
    }
}

#[derive(Debug)]
struct GraphEntry {
    build: Arc<PlannedBuild>,
    dependencies: Vec<String>,
}

#[derive(Debug, Default)]
struct GraphState {
    entries: HashMap<String, GraphEntry>,
    /// Module builds by job signature, pointing at the first build that planned them
    explicit_jobs: HashMap<Signature, (String, JobKey)>,
}

/// Planned builds of the current operation, keyed by driver unique id
#[derive(Debug, Default)]
pub struct ModuleDependencyGraph {
    state: Mutex<GraphState>,
}

impl ModuleDependencyGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GraphState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a plan, replacing any earlier plan for the same id
    pub fn register(&self, unique_id: impl Into<String>, plan: DriverPlan) -> Arc<PlannedBuild> {
        let unique_id = unique_id.into();
        let build = Arc::new(plan.build);
        let mut state = self.lock();
        state.explicit_jobs.retain(|_, (owner, _)| *owner != unique_id);
        for planned in build.explicit_module_jobs() {
            state
                .explicit_jobs
                .entry(planned.job.signature())
                .or_insert_with(|| (unique_id.clone(), planned.key));
        }
        state.entries.insert(
            unique_id,
            GraphEntry {
                build: build.clone(),
                dependencies: plan.dependencies,
            },
        );
        build
    }

    pub fn query_planned_build(&self, unique_id: &str) -> Result<Arc<PlannedBuild>> {
        self.lock()
            .entries
            .get(unique_id)
            .map(|entry| entry.build.clone())
            .ok_or_else(|| TaskError::MissingPlannedBuild(unique_id.to_string()))
    }

    pub fn query_planning_dependencies(&self, unique_id: &str) -> Result<Vec<String>> {
        self.lock()
            .entries
            .get(unique_id)
            .map(|entry| entry.dependencies.clone())
            .ok_or_else(|| TaskError::MissingPlannedBuild(unique_id.to_string()))
    }

    /// The module build with `signature`, whichever target planned it first
    pub fn query_explicit_dependency_job(
        &self,
        signature: &Signature,
    ) -> Result<(Arc<PlannedBuild>, PlannedDriverJob)> {
        let state = self.lock();
        let missing = || TaskError::MissingDriverJob {
            identifier: "<explicit dependencies>".to_string(),
            key: signature.to_string(),
        };
        let (owner, key) = state.explicit_jobs.get(signature).ok_or_else(missing)?;
        let build = state
            .entries
            .get(owner)
            .map(|entry| entry.build.clone())
            .ok_or_else(|| TaskError::MissingPlannedBuild(owner.clone()))?;
        let planned = build.planned_job(*key).ok_or_else(missing)?;
        Ok((build, planned))
    }
}
