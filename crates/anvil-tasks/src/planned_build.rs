//! Planned driver builds
//!
//! A compiler driver turns one macro invocation into many jobs. The plan
//! groups target jobs into ranges that successive scheduling actions pick
//! from:
//!
//! | range                     | jobs |
//! |---------------------------|------|
//! | compilation requirements  | precompiled headers, module emission, and compiles unless compilation is eager |
//! | compilation               | compiles, when compilation is eager |
//! | verification              | interface verification |
//! | after compilation         | everything else (linking, merging) |
//!
//! Explicit module jobs live in a separate index space. Finishing a target
//! job may reveal further jobs; those are appended as new target jobs.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::Range;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};

use anvil_cas::CasOptions;
use anvil_core::serialization::{Deserializer, Serializable, Serializer};
use anvil_core::{SerializationError, Signature, SignatureBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::task::TaskPriority;

/// Configuration of a driver invocation, carried by the tasks that schedule its jobs
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DriverPayload {
    /// Identifies the planned build in the module dependency graph
    pub unique_id: String,
    pub variant: String,
    pub architecture: String,
    pub compiler_location: PathBuf,
    /// Input the planner reads
    pub plan_path: PathBuf,
    /// Compile jobs do not gate downstream compilation requirements
    pub eager_compilation: bool,
    pub verify_scanner_dependencies: bool,
    /// Planning dependencies under this prefix are not reported as discovered nodes
    pub dependency_filtering_root: Option<PathBuf>,
    pub cas_options: Option<CasOptions>,
}

impl DriverPayload {
    pub fn new(unique_id: impl Into<String>, plan_path: impl Into<PathBuf>) -> Self {
        Self {
            unique_id: unique_id.into(),
            variant: "normal".to_string(),
            architecture: std::env::consts::ARCH.to_string(),
            compiler_location: PathBuf::new(),
            plan_path: plan_path.into(),
            eager_compilation: false,
            verify_scanner_dependencies: false,
            dependency_filtering_root: None,
            cas_options: None,
        }
    }

    /// Builder: set eager compilation
    pub fn with_eager_compilation(mut self, eager: bool) -> Self {
        self.eager_compilation = eager;
        self
    }

    /// Builder: set the dependency filtering root
    pub fn with_dependency_filtering_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.dependency_filtering_root = Some(root.into());
        self
    }

    /// Builder: enable dependency scanner verification
    pub fn with_scanner_verification(mut self, enabled: bool) -> Self {
        self.verify_scanner_dependencies = enabled;
        self
    }
}

impl Serializable for DriverPayload {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.serialize_aggregate(9, |s| {
            s.serialize(&self.unique_id);
            s.serialize(&self.variant);
            s.serialize(&self.architecture);
            s.serialize(&self.compiler_location);
            s.serialize(&self.plan_path);
            s.serialize(&self.eager_compilation);
            s.serialize(&self.verify_scanner_dependencies);
            s.serialize(&self.dependency_filtering_root);
            s.serialize(&self.cas_options);
        });
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> Result<Self, SerializationError> {
        deserializer.begin_aggregate(9)?;
        Ok(Self {
            unique_id: deserializer.deserialize()?,
            variant: deserializer.deserialize()?,
            architecture: deserializer.deserialize()?,
            compiler_location: deserializer.deserialize()?,
            plan_path: deserializer.deserialize()?,
            eager_compilation: deserializer.deserialize()?,
            verify_scanner_dependencies: deserializer.deserialize()?,
            dependency_filtering_root: deserializer.deserialize()?,
            cas_options: deserializer.deserialize()?,
        })
    }
}

/// What a driver job does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverJobKind {
    EmitModule,
    GeneratePch,
    Compile,
    VerifyModuleInterface,
    /// Builds a module other targets import
    ExplicitModule,
    Link,
    Other,
}

impl DriverJobKind {
    /// First rule info component for jobs of this kind
    pub fn rule_info_type(&self) -> &'static str {
        match self {
            Self::EmitModule => "EmitModule",
            Self::GeneratePch => "GeneratePch",
            Self::Compile => "Compile",
            Self::VerifyModuleInterface => "VerifyModuleInterface",
            Self::ExplicitModule => "ExplicitModule",
            Self::Link => "Link",
            Self::Other => "DriverJob",
        }
    }
}

/// One job of a planned driver build
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverJob {
    pub kind: DriverJobKind,
    pub description: String,
    pub command_line: Vec<String>,
    #[serde(default)]
    pub inputs: Vec<PathBuf>,
    #[serde(default)]
    pub outputs: Vec<PathBuf>,
    /// Inputs shown to the user; for a per-file compile, the source file
    #[serde(default)]
    pub display_inputs: Vec<PathBuf>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
}

impl DriverJob {
    pub fn new(kind: DriverJobKind, description: impl Into<String>) -> Self {
        Self {
            kind,
            description: description.into(),
            command_line: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            display_inputs: Vec::new(),
            working_directory: None,
        }
    }

    /// Builder: set the command line
    pub fn with_command_line<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command_line = args.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set inputs
    pub fn with_inputs<I, P>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set outputs
    pub fn with_outputs<I, P>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set display inputs
    pub fn with_display_inputs<I, P>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.display_inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_explicit_dependency_build(&self) -> bool {
        self.kind == DriverJobKind::ExplicitModule
    }

    /// Jobs that gate other work run ahead of the rest
    pub fn priority(&self) -> TaskPriority {
        match self.kind {
            DriverJobKind::ExplicitModule | DriverJobKind::EmitModule | DriverJobKind::GeneratePch => {
                TaskPriority::UnblocksDownstreamTasks
            }
            _ => TaskPriority::Unspecified,
        }
    }

    /// Fingerprint of everything that affects what the job produces
    pub fn signature(&self) -> Signature {
        let mut builder = SignatureBuilder::new();
        builder.add_str(self.kind.rule_info_type());
        builder.add_number(self.command_line.len() as u64);
        for arg in &self.command_line {
            builder.add_str(arg);
        }
        for input in &self.inputs {
            builder.add_path(input);
        }
        for output in &self.outputs {
            builder.add_path(output);
        }
        builder.finish()
    }

    pub fn rule_info(&self, variant: &str, architecture: &str) -> Vec<String> {
        vec![
            self.kind.rule_info_type().to_string(),
            variant.to_string(),
            architecture.to_string(),
            self.description.clone(),
        ]
    }
}

/// Position of a job in a planned build
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum JobKey {
    Target(usize),
    ExplicitDependency(usize),
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Target(index) => write!(f, "target:{index}"),
            Self::ExplicitDependency(index) => write!(f, "explicit:{index}"),
        }
    }
}

impl Serializable for JobKey {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.serialize_aggregate(2, |s| match self {
            Self::Target(index) => {
                s.serialize(&0u8);
                s.serialize(index);
            }
            Self::ExplicitDependency(index) => {
                s.serialize(&1u8);
                s.serialize(index);
            }
        });
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> Result<Self, SerializationError> {
        deserializer.begin_aggregate(2)?;
        let tag: u8 = deserializer.deserialize()?;
        match tag {
            0 => Ok(Self::Target(deserializer.deserialize()?)),
            1 => Ok(Self::ExplicitDependency(deserializer.deserialize()?)),
            tag => Err(SerializationError::UnsupportedVariant {
                type_name: "JobKey",
                tag: tag as u64,
            }),
        }
    }
}

/// A job with its position and the jobs it waits for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedDriverJob {
    pub key: JobKey,
    pub job: DriverJob,
    pub dependencies: Vec<JobKey>,
}

impl PlannedDriverJob {
    pub fn description(&self) -> &str {
        &self.job.description
    }
}

#[derive(Debug, Default)]
struct PlannedBuildState {
    target_jobs: Vec<PlannedDriverJob>,
    explicit_jobs: Vec<PlannedDriverJob>,
    compilation_requirements: Range<usize>,
    compilation: Range<usize>,
    verification: Range<usize>,
    after_compilation: Range<usize>,
    /// Jobs revealed once the target job at the given index finishes
    pending_discoveries: HashMap<usize, Vec<DriverJob>>,
    skipped_jobs: Vec<DriverJob>,
    producers: HashMap<PathBuf, JobKey>,
}

/// The job graph produced by planning one driver invocation
#[derive(Debug, Default)]
pub struct PlannedBuild {
    state: Mutex<PlannedBuildState>,
}

impl PlannedBuild {
    /// Categorize `jobs` into target ranges and explicit module jobs
    pub fn new(jobs: Vec<DriverJob>, eager_compilation: bool) -> Self {
        let mut explicit = Vec::new();
        let mut emit_module = Vec::new();
        let mut generate_pch = Vec::new();
        let mut compile = Vec::new();
        let mut verification = Vec::new();
        let mut rest = Vec::new();
        for job in jobs {
            match job.kind {
                DriverJobKind::ExplicitModule => explicit.push(job),
                DriverJobKind::EmitModule => emit_module.push(job),
                DriverJobKind::GeneratePch => generate_pch.push(job),
                DriverJobKind::Compile => compile.push(job),
                DriverJobKind::VerifyModuleInterface => verification.push(job),
                DriverJobKind::Link | DriverJobKind::Other => rest.push(job),
            }
        }

        let mut ordered = Vec::new();
        ordered.extend(generate_pch);
        ordered.extend(emit_module);
        if !eager_compilation {
            ordered.extend(compile.drain(..));
        }
        let compilation_requirements = 0..ordered.len();
        ordered.extend(compile);
        let compilation = compilation_requirements.end..ordered.len();
        ordered.extend(verification);
        let verification = compilation.end..ordered.len();
        ordered.extend(rest);
        let after_compilation = verification.end..ordered.len();

        let mut state = PlannedBuildState {
            compilation_requirements,
            compilation,
            verification,
            after_compilation,
            ..Default::default()
        };
        for (index, job) in explicit.into_iter().enumerate() {
            state.register_producer(JobKey::ExplicitDependency(index), &job);
            state.explicit_jobs.push(PlannedDriverJob {
                key: JobKey::ExplicitDependency(index),
                job,
                dependencies: Vec::new(),
            });
        }
        for (index, job) in ordered.into_iter().enumerate() {
            state.register_producer(JobKey::Target(index), &job);
            state.target_jobs.push(PlannedDriverJob {
                key: JobKey::Target(index),
                job,
                dependencies: Vec::new(),
            });
        }
        state.compute_dependencies();

        Self {
            state: Mutex::new(state),
        }
    }

    /// Builder: jobs revealed after the target job at `after` finishes
    pub fn with_discovered_jobs(self, after: usize, jobs: Vec<DriverJob>) -> Self {
        self.lock().pending_discoveries.entry(after).or_default().extend(jobs);
        self
    }

    /// Builder: jobs the driver decided need not run
    pub fn with_skipped_jobs(self, jobs: Vec<DriverJob>) -> Self {
        self.lock().skipped_jobs.extend(jobs);
        self
    }

    fn lock(&self) -> MutexGuard<'_, PlannedBuildState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn compilation_requirement_jobs(&self) -> Vec<PlannedDriverJob> {
        let state = self.lock();
        state.target_jobs[state.compilation_requirements.clone()].to_vec()
    }

    pub fn compilation_jobs(&self) -> Vec<PlannedDriverJob> {
        let state = self.lock();
        state.target_jobs[state.compilation.clone()].to_vec()
    }

    pub fn verification_jobs(&self) -> Vec<PlannedDriverJob> {
        let state = self.lock();
        state.target_jobs[state.verification.clone()].to_vec()
    }

    pub fn after_compilation_jobs(&self) -> Vec<PlannedDriverJob> {
        let state = self.lock();
        state.target_jobs[state.after_compilation.clone()].to_vec()
    }

    pub fn explicit_module_jobs(&self) -> Vec<PlannedDriverJob> {
        self.lock().explicit_jobs.clone()
    }

    /// Number of target jobs, including discovered ones
    pub fn target_build_job_count(&self) -> usize {
        self.lock().target_jobs.len()
    }

    pub fn planned_target_job(&self, key: JobKey) -> Option<PlannedDriverJob> {
        match key {
            JobKey::Target(index) => self.lock().target_jobs.get(index).cloned(),
            JobKey::ExplicitDependency(_) => None,
        }
    }

    pub fn planned_job(&self, key: JobKey) -> Option<PlannedDriverJob> {
        let state = self.lock();
        match key {
            JobKey::Target(index) => state.target_jobs.get(index).cloned(),
            JobKey::ExplicitDependency(index) => state.explicit_jobs.get(index).cloned(),
        }
    }

    /// Jobs unblocked by `finished`, appended as new target jobs.
    ///
    /// Each discovery is handed out once. After-compilation jobs are made to
    /// wait for the new jobs.
    pub fn discovered_jobs_after_finishing(&self, finished: JobKey) -> Vec<PlannedDriverJob> {
        let JobKey::Target(index) = finished else {
            return Vec::new();
        };
        let mut state = self.lock();
        let Some(jobs) = state.pending_discoveries.remove(&index) else {
            return Vec::new();
        };

        let mut discovered = Vec::with_capacity(jobs.len());
        for job in jobs {
            let key = JobKey::Target(state.target_jobs.len());
            state.register_producer(key, &job);
            state.target_jobs.push(PlannedDriverJob {
                key,
                job,
                dependencies: Vec::new(),
            });
            discovered.push(key);
        }
        for key in &discovered {
            let dependencies = state.dependencies_of(*key);
            if let JobKey::Target(i) = key {
                state.target_jobs[*i].dependencies = dependencies;
            }
        }
        for i in state.after_compilation.clone() {
            let job = &mut state.target_jobs[i];
            for key in &discovered {
                if !job.dependencies.contains(key) {
                    job.dependencies.push(*key);
                }
            }
        }
        debug!(after = %finished, count = discovered.len(), "discovered driver jobs");

        discovered
            .into_iter()
            .filter_map(|key| match key {
                JobKey::Target(i) => state.target_jobs.get(i).cloned(),
                JobKey::ExplicitDependency(_) => None,
            })
            .collect()
    }

    pub fn skipped_jobs(&self) -> Vec<DriverJob> {
        self.lock().skipped_jobs.clone()
    }
}

impl PlannedBuildState {
    fn register_producer(&mut self, key: JobKey, job: &DriverJob) {
        for output in &job.outputs {
            self.producers.insert(output.clone(), key);
        }
    }

    fn job(&self, key: JobKey) -> Option<&PlannedDriverJob> {
        match key {
            JobKey::Target(i) => self.target_jobs.get(i),
            JobKey::ExplicitDependency(i) => self.explicit_jobs.get(i),
        }
    }

    fn dependencies_of(&self, key: JobKey) -> Vec<JobKey> {
        let Some(planned) = self.job(key) else {
            return Vec::new();
        };
        let mut dependencies: BTreeSet<JobKey> = planned
            .job
            .inputs
            .iter()
            .filter_map(|input| self.producers.get(input).copied())
            .filter(|producer| *producer != key)
            .collect();

        if let JobKey::Target(index) = key {
            let gated_by_explicit = self.compilation_requirements.contains(&index)
                || self.compilation.contains(&index);
            if gated_by_explicit {
                dependencies.extend((0..self.explicit_jobs.len()).map(JobKey::ExplicitDependency));
            }
            if self.after_compilation.contains(&index) {
                dependencies.extend(
                    self.target_jobs
                        .iter()
                        .filter(|j| j.job.kind == DriverJobKind::Compile)
                        .map(|j| j.key),
                );
            }
        }
        dependencies.into_iter().collect()
    }

    fn compute_dependencies(&mut self) {
        let keys: Vec<JobKey> = self
            .explicit_jobs
            .iter()
            .chain(self.target_jobs.iter())
            .map(|j| j.key)
            .collect();
        for key in keys {
            let dependencies = self.dependencies_of(key);
            match key {
                JobKey::Target(i) => self.target_jobs[i].dependencies = dependencies,
                JobKey::ExplicitDependency(i) => self.explicit_jobs[i].dependencies = dependencies,
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_jobs() -> Vec<DriverJob> {
        vec![
            DriverJob::new(DriverJobKind::ExplicitModule, "Foundation")
                .with_outputs(["/build/Foundation.pcm"]),
            DriverJob::new(DriverJobKind::Compile, "a.swift")
                .with_inputs(["/src/a.swift"])
                .with_outputs(["/build/a.o"])
                .with_display_inputs(["/src/a.swift"]),
            DriverJob::new(DriverJobKind::EmitModule, "App.swiftmodule")
                .with_inputs(["/src/a.swift"])
                .with_outputs(["/build/App.swiftmodule", "/build/App.swiftinterface"]),
            DriverJob::new(DriverJobKind::Link, "App")
                .with_inputs(["/build/a.o"])
                .with_outputs(["/build/App"]),
            DriverJob::new(DriverJobKind::VerifyModuleInterface, "verify App")
                .with_inputs(["/build/App.swiftinterface"]),
        ]
    }

    #[test]
    fn test_categorization_lazy() {
        let build = PlannedBuild::new(sample_jobs(), false);
        let requirements = build.compilation_requirement_jobs();
        assert_eq!(requirements.len(), 2);
        assert_eq!(requirements[0].job.kind, DriverJobKind::EmitModule);
        assert_eq!(requirements[1].job.kind, DriverJobKind::Compile);
        assert!(build.compilation_jobs().is_empty());
        assert_eq!(build.verification_jobs().len(), 1);
        assert_eq!(build.after_compilation_jobs().len(), 1);
        assert_eq!(build.explicit_module_jobs().len(), 1);
        assert_eq!(build.target_build_job_count(), 4);
    }

    #[test]
    fn test_categorization_eager() {
        let build = PlannedBuild::new(sample_jobs(), true);
        assert_eq!(build.compilation_requirement_jobs().len(), 1);
        let compilation = build.compilation_jobs();
        assert_eq!(compilation.len(), 1);
        assert_eq!(compilation[0].key, JobKey::Target(1));
    }

    #[test]
    fn test_dependencies() {
        let build = PlannedBuild::new(sample_jobs(), true);
        let compile = &build.compilation_jobs()[0];
        assert_eq!(compile.dependencies, vec![JobKey::ExplicitDependency(0)]);

        let link = &build.after_compilation_jobs()[0];
        assert_eq!(link.dependencies, vec![compile.key]);

        let verify = &build.verification_jobs()[0];
        assert_eq!(verify.dependencies, vec![JobKey::Target(0)]);
    }

    #[test]
    fn test_discovery_is_handed_out_once() {
        let extra = DriverJob::new(DriverJobKind::Compile, "b.swift")
            .with_inputs(["/src/b.swift"])
            .with_outputs(["/build/b.o"]);
        let build = PlannedBuild::new(sample_jobs(), true).with_discovered_jobs(1, vec![extra]);

        assert!(build.discovered_jobs_after_finishing(JobKey::Target(0)).is_empty());
        let discovered = build.discovered_jobs_after_finishing(JobKey::Target(1));
        assert_eq!(discovered.len(), 1);
        assert_eq!(discovered[0].key, JobKey::Target(4));
        assert_eq!(build.target_build_job_count(), 5);
        assert!(build.discovered_jobs_after_finishing(JobKey::Target(1)).is_empty());

        let link = &build.after_compilation_jobs()[0];
        assert!(link.dependencies.contains(&JobKey::Target(4)));
    }

    #[test]
    fn test_explicit_jobs_discover_nothing() {
        let build = PlannedBuild::new(sample_jobs(), false);
        assert!(build
            .discovered_jobs_after_finishing(JobKey::ExplicitDependency(0))
            .is_empty());
        assert!(build.planned_target_job(JobKey::ExplicitDependency(0)).is_none());
        assert!(build.planned_job(JobKey::ExplicitDependency(0)).is_some());
    }

    #[test]
    fn test_priority() {
        let jobs = sample_jobs();
        assert_eq!(jobs[0].priority(), TaskPriority::UnblocksDownstreamTasks);
        assert_eq!(jobs[1].priority(), TaskPriority::Unspecified);
        assert_eq!(jobs[2].priority(), TaskPriority::UnblocksDownstreamTasks);
    }

    #[test]
    fn test_plan_from_json() {
        let json = r#"{"kind": "compile", "description": "a.swift", "command_line": ["swiftc", "-c"]}"#;
        let job: DriverJob = serde_json::from_str(json).unwrap();
        assert_eq!(job.kind, DriverJobKind::Compile);
        assert!(job.inputs.is_empty());
    }
}
