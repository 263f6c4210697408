//! Executable task descriptors and the values exchanged with the scheduler

use std::fmt;
use std::path::{Path, PathBuf};

use anvil_core::serialization::{Deserializer, Serializable, Serializer};
use anvil_core::{ByteString, SerializationError};
use serde::{Deserialize, Serialize};

use crate::compilation_cache::CompilationCachePayload;
use crate::planned_build::DriverPayload;

/// Identifier of a dependency requested by a running task action.
///
/// Ids are chosen by the requesting action and only need to be unique within
/// that action.
pub type TaskId = u64;

/// The target a task is attributed to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfiguredTarget {
    pub name: String,
    pub guid: String,
}

impl ConfiguredTarget {
    pub fn new(name: impl Into<String>, guid: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            guid: guid.into(),
        }
    }
}

impl fmt::Display for ConfiguredTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.guid)
    }
}

impl Serializable for ConfiguredTarget {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.serialize_aggregate(2, |s| {
            s.serialize(&self.name);
            s.serialize(&self.guid);
        });
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> Result<Self, SerializationError> {
        deserializer.begin_aggregate(2)?;
        Ok(Self {
            name: deserializer.deserialize()?,
            guid: deserializer.deserialize()?,
        })
    }
}

/// One command line token.
///
/// Paths are kept structurally so that rewriting them into a sandbox does
/// not change what the command means.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CommandLineArgument {
    Literal(ByteString),
    Path(PathBuf),
    /// The directory containing a path
    ParentPath(PathBuf),
}

impl CommandLineArgument {
    pub fn literal(value: &str) -> Self {
        Self::Literal(ByteString::from(value))
    }

    pub fn path(value: impl Into<PathBuf>) -> Self {
        Self::Path(value.into())
    }

    /// The token as it would be passed to a process, without remapping
    pub fn as_string(&self) -> String {
        match self {
            Self::Literal(bytes) => bytes.as_string(),
            Self::Path(path) => path.display().to_string(),
            Self::ParentPath(path) => path
                .parent()
                .unwrap_or(Path::new(""))
                .display()
                .to_string(),
        }
    }
}

impl fmt::Display for CommandLineArgument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl From<&str> for CommandLineArgument {
    fn from(value: &str) -> Self {
        Self::literal(value)
    }
}

impl Serializable for CommandLineArgument {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.serialize_aggregate(2, |s| match self {
            Self::Literal(bytes) => {
                s.serialize(&0u8);
                s.serialize(bytes);
            }
            Self::Path(path) => {
                s.serialize(&1u8);
                s.serialize(path);
            }
            Self::ParentPath(path) => {
                s.serialize(&2u8);
                s.serialize(path);
            }
        });
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> Result<Self, SerializationError> {
        deserializer.begin_aggregate(2)?;
        let tag: u8 = deserializer.deserialize()?;
        match tag {
            0 => Ok(Self::Literal(deserializer.deserialize()?)),
            1 => Ok(Self::Path(deserializer.deserialize()?)),
            2 => Ok(Self::ParentPath(deserializer.deserialize()?)),
            tag => Err(SerializationError::UnsupportedVariant {
                type_name: "CommandLineArgument",
                tag: tag as u64,
            }),
        }
    }
}

/// Ordered environment variable bindings; later bindings win
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EnvironmentBindings(Vec<(String, String)>);

impl EnvironmentBindings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bindings(&self) -> &[(String, String)] {
        &self.0
    }

    pub fn push(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.push((key.into(), value.into()));
    }

    /// Builder: add a binding
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Bindings with duplicates collapsed, sorted by name
    pub fn to_map(&self) -> std::collections::BTreeMap<String, String> {
        self.0.iter().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, String)> for EnvironmentBindings {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl Serializable for EnvironmentBindings {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.begin_aggregate(self.0.len());
        for (key, value) in &self.0 {
            serializer.serialize_aggregate(2, |s| {
                s.serialize(key);
                s.serialize(value);
            });
        }
        serializer.end_aggregate();
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> Result<Self, SerializationError> {
        let count = deserializer.read_aggregate_len()?;
        let mut bindings = Vec::with_capacity(count);
        for _ in 0..count {
            deserializer.begin_aggregate(2)?;
            bindings.push((deserializer.deserialize()?, deserializer.deserialize()?));
        }
        Ok(Self(bindings))
    }
}

/// A node the scheduler can produce or observe on behalf of a task
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ExecutionNode {
    /// A file or directory on disk
    Path(PathBuf),
    /// A gate with no file system presence, satisfied by the scheduler
    Virtual(String),
}

impl ExecutionNode {
    pub fn path(path: impl Into<PathBuf>) -> Self {
        Self::Path(path.into())
    }

    /// Textual identifier, matching what dependency files record
    pub fn identifier(&self) -> String {
        match self {
            Self::Path(path) => path.display().to_string(),
            Self::Virtual(name) => format!("<{name}>"),
        }
    }
}

impl fmt::Display for ExecutionNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.identifier())
    }
}

/// How a task's dependency file is to be read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencyData {
    /// A make-style file whose first rule lists the inputs
    MakefileIgnoringSubsequentOutputs(PathBuf),
}

/// Action-specific configuration carried by a task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskPayload {
    Driver(DriverPayload),
    CompilationCache(CompilationCachePayload),
}

/// Everything an action needs to know about the task it performs
#[derive(Debug, Clone, Default)]
pub struct ExecutableTask {
    pub identifier: String,
    pub rule_info: Vec<String>,
    pub command_line: Vec<CommandLineArgument>,
    pub working_directory: PathBuf,
    pub environment: EnvironmentBindings,
    pub input_paths: Vec<PathBuf>,
    pub output_paths: Vec<PathBuf>,
    /// Nodes that must exist before a dynamically scheduled action may plan
    pub execution_inputs: Option<Vec<ExecutionNode>>,
    pub for_target: Option<ConfiguredTarget>,
    pub show_environment: bool,
    pub payload: Option<TaskPayload>,
    pub dependency_data: Option<DependencyData>,
}

impl ExecutableTask {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            ..Default::default()
        }
    }

    /// Builder: set the command line
    pub fn with_command_line<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<CommandLineArgument>,
    {
        self.command_line = args.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set the rule info
    pub fn with_rule_info<I, S>(mut self, rule_info: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.rule_info = rule_info.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: set the working directory
    pub fn with_working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = dir.into();
        self
    }

    /// Builder: set the environment
    pub fn with_environment(mut self, environment: EnvironmentBindings) -> Self {
        self.environment = environment;
        self
    }

    /// Builder: set declared inputs
    pub fn with_inputs(mut self, inputs: Vec<PathBuf>) -> Self {
        self.input_paths = inputs;
        self
    }

    /// Builder: set declared outputs
    pub fn with_outputs(mut self, outputs: Vec<PathBuf>) -> Self {
        self.output_paths = outputs;
        self
    }

    /// Builder: set execution inputs
    pub fn with_execution_inputs(mut self, inputs: Vec<ExecutionNode>) -> Self {
        self.execution_inputs = Some(inputs);
        self
    }

    /// Builder: attribute to a target
    pub fn with_target(mut self, target: ConfiguredTarget) -> Self {
        self.for_target = Some(target);
        self
    }

    /// Builder: set the payload
    pub fn with_payload(mut self, payload: TaskPayload) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Builder: set the dependency file
    pub fn with_dependency_data(mut self, data: DependencyData) -> Self {
        self.dependency_data = Some(data);
        self
    }

    pub fn driver_payload(&self) -> Option<&DriverPayload> {
        match &self.payload {
            Some(TaskPayload::Driver(payload)) => Some(payload),
            _ => None,
        }
    }

    pub fn compilation_cache_payload(&self) -> Option<&CompilationCachePayload> {
        match &self.payload {
            Some(TaskPayload::CompilationCache(payload)) => Some(payload),
            _ => None,
        }
    }

    /// The command line as process arguments, without remapping
    pub fn command_line_strings(&self) -> Vec<String> {
        self.command_line.iter().map(|a| a.as_string()).collect()
    }
}

/// Outcome of performing a task action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CommandResult {
    Succeeded,
    Failed,
    Cancelled,
}

impl CommandResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded)
    }
}

impl fmt::Display for CommandResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// What the scheduler reports about a finished dependency
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildValueKind {
    /// An input node that exists
    ExistingInput,
    /// An input node that does not exist
    MissingInput,
    /// An input node that could not be produced
    FailedInput,
    /// A virtual node was satisfied
    VirtualInput,
    SuccessfulCommand,
    FailedCommand,
    PropagatedFailureCommand,
    CancelledCommand,
    /// The command was not run at all
    SkippedCommand,
}

impl BuildValueKind {
    /// Whether the value stands for a failure a dependent must react to
    pub fn is_failed(&self) -> bool {
        matches!(
            self,
            Self::MissingInput
                | Self::FailedInput
                | Self::FailedCommand
                | Self::PropagatedFailureCommand
                | Self::CancelledCommand
        )
    }
}

impl From<CommandResult> for BuildValueKind {
    fn from(result: CommandResult) -> Self {
        match result {
            CommandResult::Succeeded => Self::SuccessfulCommand,
            CommandResult::Failed => Self::FailedCommand,
            CommandResult::Cancelled => Self::CancelledCommand,
        }
    }
}

/// The kind of build the scheduler was asked for
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildCommand {
    #[default]
    Build,
    /// A partial build that only prepares what an indexer needs
    PrepareForIndexing,
}

/// Scheduling hint attached to a dynamic task request
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskPriority {
    #[default]
    Unspecified,
    /// Other work waits on this task
    UnblocksDownstreamTasks,
    /// The task is network bound rather than CPU bound
    Network,
}

/// Why a dynamic task was requested, for reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DynamicTaskReason {
    WasScheduledByDriver,
    WasCompilationCachingQuery,
    WasCompilationCachingMaterialization,
}
