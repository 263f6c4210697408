//! Content-addressed caching for arbitrary commands
//!
//! The cache key covers the structured command line, the environment, the
//! working directory, a format version and the content id of every declared
//! input. On a hit the captured output is replayed and the outputs are
//! exported from the store. On a miss the command runs in a private sandbox
//! tree holding copies of its inputs, and its outputs are imported and
//! associated with the key.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anvil_cas::{remove_existing, CasFsNode, CasObject, CasOptions, ContentStore, DataId};
use anvil_core::serialization::{self, Deserializer, Serializable, Serializer};
use anvil_core::{ByteString, SerializationError, Signature, SignatureBuilder};
use async_trait::async_trait;
use futures::future::{try_join_all, BoxFuture};
use futures::{stream, FutureExt, StreamExt, TryStreamExt};
use tracing::{debug, instrument, warn};

use crate::action::TaskAction;
use crate::delegates::{
    ClientDelegate, Diagnostic, DynamicTaskExecutionDelegate, TaskCounter, TaskExecutionDelegate,
    TaskOutputDelegate,
};
use crate::error::{Result, TaskError};
use crate::fs::{normalize_path, FsProxy};
use crate::output::CapturingOutputDelegate;
use crate::process;
use crate::task::{CommandLineArgument, CommandResult, EnvironmentBindings, ExecutableTask};

/// Bumping this invalidates every entry written by earlier versions
const CACHE_KEY_VERSION: u64 = 1;

/// Concurrent CAS imports and exports per task
const TRANSFER_PARALLELISM: usize = 10;

const TEMP_VARIABLES: [&str; 4] = ["TMPDIR", "TEMP", "TEMPDIR", "TMP"];

const SANDBOX_PROFILE: &str = r#"(version 1)
(allow default)
(deny network*)
(deny file-write*)
(allow file-write* (subpath "/dev/"))
(deny file-read* (subpath "/Users/"))
(allow file-read* (subpath (param "XCODE")))
(allow file-read* file-write* (subpath (param "USER_CACHE_DIR")))
(allow file-read* file-write* (subpath (param "DARWIN_USER_CACHE_DIR")))
(allow file-read* file-write* (subpath (param "DARWIN_USER_TEMP_DIR")))
(allow file-read* file-write* (subpath (param "USER_LOGS_DIR")))
(allow file-read* file-write* (subpath (param "USER_DEVELOPER_DIR")))
(allow file-read* file-write* (subpath (param "TASK_SANDBOX")))
(allow file-read* (regex #"/\.CFUserTextEncoding$" #"/nls\..*" #"/zoneinfo/.*"))
(allow file-read-metadata)
"#;

static SANDBOX_COUNTER: AtomicU64 = AtomicU64::new(0);

/// What a cache key is computed from
#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheKey {
    command_line: Vec<CommandLineArgument>,
    environment: EnvironmentBindings,
    working_directory: PathBuf,
    version: u64,
}

impl Serializable for CacheKey {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.serialize_aggregate(4, |s| {
            s.serialize(&self.command_line);
            s.serialize(&self.environment);
            s.serialize(&self.working_directory);
            s.serialize(&self.version);
        });
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> std::result::Result<Self, SerializationError> {
        deserializer.begin_aggregate(4)?;
        Ok(Self {
            command_line: deserializer.deserialize()?,
            environment: deserializer.deserialize()?,
            working_directory: deserializer.deserialize()?,
            version: deserializer.deserialize()?,
        })
    }
}

/// What a cache entry replays; outputs are the object's references
#[derive(Debug, Clone, PartialEq, Eq)]
struct CachedValue {
    process_output: ByteString,
    diagnostics: Vec<Diagnostic>,
}

impl CachedValue {
    fn encode(&self) -> Vec<u8> {
        let mut serializer = Serializer::new();
        serializer.serialize(&self.process_output);
        serializer.serialize(&self.diagnostics);
        serializer.into_bytes()
    }

    fn decode(bytes: &[u8]) -> std::result::Result<Self, SerializationError> {
        let mut deserializer = Deserializer::new(bytes);
        let value = Self {
            process_output: deserializer.deserialize()?,
            diagnostics: deserializer.deserialize()?,
        };
        if !deserializer.is_at_end() {
            return Err(SerializationError::TrailingBytes(deserializer.remaining()));
        }
        Ok(value)
    }
}

/// Where declared paths live inside one sandbox
#[derive(Debug)]
struct SandboxLayout {
    root: PathBuf,
    inputs: Vec<(PathBuf, PathBuf)>,
    outputs: Vec<(PathBuf, PathBuf)>,
}

impl SandboxLayout {
    fn new(root: PathBuf, task: &ExecutableTask) -> Self {
        let remap = |kind: &str, index: usize, path: &Path| {
            let name = path.file_name().map(PathBuf::from).unwrap_or_default();
            root.join(kind).join(index.to_string()).join(name)
        };
        let inputs = task
            .input_paths
            .iter()
            .enumerate()
            .map(|(i, path)| {
                let path = normalize_path(path);
                let remapped = remap("inputs", i, &path);
                (path, remapped)
            })
            .collect();
        let outputs = task
            .output_paths
            .iter()
            .enumerate()
            .map(|(i, path)| {
                let path = normalize_path(path);
                let remapped = remap("outputs", i, &path);
                (path, remapped)
            })
            .collect();
        Self {
            root,
            inputs,
            outputs,
        }
    }

    fn temp_directory(&self) -> PathBuf {
        self.root.join("temp")
    }

    /// Outputs win over inputs for a path declared as both
    fn remap(&self, path: &Path) -> PathBuf {
        let normalized = normalize_path(path);
        self.outputs
            .iter()
            .chain(self.inputs.iter())
            .find(|(original, _)| *original == normalized)
            .map(|(_, remapped)| remapped.clone())
            .unwrap_or_else(|| path.to_path_buf())
    }

    fn remap_command_line(&self, command_line: &[CommandLineArgument]) -> Vec<String> {
        command_line
            .iter()
            .map(|argument| match argument {
                CommandLineArgument::Literal(bytes) => bytes.as_string(),
                CommandLineArgument::Path(path) => self.remap(path).display().to_string(),
                CommandLineArgument::ParentPath(path) => self
                    .remap(path)
                    .parent()
                    .unwrap_or(Path::new(""))
                    .display()
                    .to_string(),
            })
            .collect()
    }

    fn remap_environment(&self, environment: &EnvironmentBindings) -> EnvironmentBindings {
        let temp = self.temp_directory().display().to_string();
        let mut remapped = environment.clone();
        for variable in TEMP_VARIABLES {
            remapped.push(variable, temp.clone());
        }
        remapped
    }
}

/// Runs a command through the content-addressed cache
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericCachingTaskAction {
    enable_cache_debugging_remarks: bool,
    enable_sandbox_enforcement: bool,
    sandbox_directory: PathBuf,
    extra_sandbox_subdirectories: Vec<PathBuf>,
    developer_directory: PathBuf,
    cas_options: CasOptions,
    cache_key_version: u64,
}

impl GenericCachingTaskAction {
    pub const TOOL_IDENTIFIER: &'static str = "generic-caching";

    pub fn new(sandbox_directory: impl Into<PathBuf>, cas_options: CasOptions) -> Self {
        Self {
            enable_cache_debugging_remarks: false,
            enable_sandbox_enforcement: false,
            sandbox_directory: sandbox_directory.into(),
            extra_sandbox_subdirectories: Vec::new(),
            developer_directory: PathBuf::new(),
            cas_options,
            cache_key_version: CACHE_KEY_VERSION,
        }
    }

    /// Builder: emit remarks about keys, hits and sandbox remapping
    pub fn with_debugging_remarks(mut self, enabled: bool) -> Self {
        self.enable_cache_debugging_remarks = enabled;
        self
    }

    /// Builder: wrap commands in the host sandbox where supported
    pub fn with_sandbox_enforcement(mut self, enabled: bool) -> Self {
        self.enable_sandbox_enforcement = enabled;
        self
    }

    /// Builder: directories to create inside every sandbox
    pub fn with_extra_subdirectories(mut self, subdirectories: Vec<PathBuf>) -> Self {
        self.extra_sandbox_subdirectories = subdirectories;
        self
    }

    /// Builder: developer directory the enforced sandbox may read
    pub fn with_developer_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.developer_directory = directory.into();
        self
    }

    #[cfg(test)]
    fn with_cache_key_version(mut self, version: u64) -> Self {
        self.cache_key_version = version;
        self
    }

    pub fn cas_options(&self) -> &CasOptions {
        &self.cas_options
    }

    fn remark(&self, output: &dyn TaskOutputDelegate, message: &str) {
        if self.enable_cache_debugging_remarks {
            output.remark(message);
        }
    }

    /// Store the key object for `task` and return its id
    async fn compute_cache_key(&self, task: &ExecutableTask, cas: &dyn ContentStore) -> Result<DataId> {
        let input_ids = import_all(&task.input_paths, cas).await?;
        let key = CacheKey {
            command_line: task.command_line.clone(),
            environment: task.environment.clone(),
            working_directory: task.working_directory.clone(),
            version: self.cache_key_version,
        };
        let object = CasObject::new(serialization::to_bytes(&key), input_ids);
        Ok(cas.store(object).await?)
    }

    async fn replay(
        &self,
        task: &ExecutableTask,
        value_id: &DataId,
        cas: &dyn ContentStore,
        output: &dyn TaskOutputDelegate,
    ) -> Result<()> {
        let object = cas.load_existing(value_id).await?;
        if object.refs.len() != task.output_paths.len() {
            return Err(TaskError::OutputCountMismatch {
                found: object.refs.len(),
                expected: task.output_paths.len(),
            });
        }
        let value = CachedValue::decode(object.data.as_bytes())?;

        output.emit_output(value.process_output.as_bytes());
        for diagnostic in value.diagnostics {
            output.emit_diagnostic(diagnostic);
        }

        let exports: Vec<BoxFuture<'_, anvil_cas::Result<()>>> = object
            .refs
            .iter()
            .zip(&task.output_paths)
            .map(|(id, path)| CasFsNode::export(id, cas, path).boxed())
            .collect();
        stream::iter(exports)
            .buffer_unordered(TRANSFER_PARALLELISM)
            .try_collect::<Vec<()>>()
            .await?;

        self.remark(output, &format!("replaying cache hit: {value_id}"));
        output.increment_task_counter(TaskCounter::CacheHits);
        Ok(())
    }

    async fn create_sandbox(&self, fs: &dyn FsProxy) -> Result<PathBuf> {
        fs.create_directory(&self.sandbox_directory, true).await?;
        let name = format!(
            "task-{}-{}-{}",
            std::process::id(),
            chrono::Utc::now().timestamp_micros(),
            SANDBOX_COUNTER.fetch_add(1, Ordering::Relaxed)
        );
        let root = self.sandbox_directory.join(name);
        fs.create_directory(&root, false).await?;
        Ok(root)
    }

    /// Arguments prefixed to the command when enforcement applies to this host
    async fn sandbox_arguments(&self, layout: &SandboxLayout, fs: &dyn FsProxy) -> Result<Vec<String>> {
        if !self.enable_sandbox_enforcement || !cfg!(target_os = "macos") {
            return Ok(Vec::new());
        }

        let profile = layout.root.join("sandbox.sb");
        fs.write(&profile, SANDBOX_PROFILE.as_bytes()).await?;

        let home = dirs::home_dir().unwrap_or_default();
        let temp = fs.realpath(&std::env::temp_dir()).await?;
        let darwin_cache = temp.parent().map(|p| p.join("C")).unwrap_or_else(|| temp.clone());
        let xcode = self
            .developer_directory
            .parent()
            .and_then(Path::parent)
            .unwrap_or(&self.developer_directory);

        let define = |name: &str, value: &Path| format!("{name}={}", value.display());
        let mut arguments = vec!["/usr/bin/sandbox-exec".to_string()];
        for definition in [
            define("TASK_SANDBOX", &layout.root),
            define("XCODE", xcode),
            define("USER_CACHE_DIR", &home.join("Library/Caches")),
            define("DARWIN_USER_CACHE_DIR", &darwin_cache),
            define("DARWIN_USER_TEMP_DIR", &temp),
            define("USER_LOGS_DIR", &home.join("Library/Logs")),
            define("USER_DEVELOPER_DIR", &home.join("Library/Developer")),
        ] {
            arguments.push("-D".to_string());
            arguments.push(definition);
        }
        arguments.push("-f".to_string());
        arguments.push(profile.display().to_string());
        Ok(arguments)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_sandboxed(
        &self,
        task: &ExecutableTask,
        key_id: &DataId,
        cas: &dyn ContentStore,
        dynamic: &dyn DynamicTaskExecutionDelegate,
        execution: &dyn TaskExecutionDelegate,
        client: &dyn ClientDelegate,
        output: &dyn TaskOutputDelegate,
    ) -> Result<CommandResult> {
        self.remark(output, "executing underlying task");
        output.increment_task_counter(TaskCounter::CacheMisses);

        let fs = execution.fs();
        let layout = SandboxLayout::new(self.create_sandbox(fs).await?, task);
        debug!(task = %task.identifier, sandbox = %layout.root.display(), "created sandbox");

        let mut command_line = layout.remap_command_line(&task.command_line);
        self.remark(
            output,
            &format!("original command line: {}", task.command_line_strings().join(" ")),
        );
        self.remark(output, &format!("remapped command line: {}", command_line.join(" ")));

        let environment = layout.remap_environment(&task.environment);
        self.remark(
            output,
            &format!(
                "remapped environment: {}",
                environment
                    .bindings()
                    .iter()
                    .map(|(k, v)| format!("{k}={v}"))
                    .collect::<Vec<_>>()
                    .join(" ")
            ),
        );

        let mut sandboxed = self.sandbox_arguments(&layout, fs).await?;
        if !sandboxed.is_empty() {
            sandboxed.append(&mut command_line);
            command_line = sandboxed;
        }

        try_join_all(layout.inputs.iter().map(|(original, remapped)| async move {
            self.remark(
                output,
                &format!("copying input {} to {}", original.display(), remapped.display()),
            );
            if let Some(parent) = remapped.parent() {
                fs.create_directory(parent, true).await?;
            }
            fs.copy(original, remapped).await
        }))
        .await?;

        let mut directories = vec![layout.temp_directory()];
        directories.extend(
            layout
                .outputs
                .iter()
                .filter_map(|(_, remapped)| remapped.parent().map(Path::to_path_buf)),
        );
        directories.extend(
            self.extra_sandbox_subdirectories
                .iter()
                .map(|subdirectory| layout.root.join(subdirectory)),
        );
        for directory in &directories {
            fs.create_directory(directory, true).await?;
        }

        self.remark(output, "running sandboxed command");
        let capturing = CapturingOutputDelegate::new(output);
        let working_directory = layout.remap(&task.working_directory);
        let result = process::run_tool(
            &command_line,
            &environment,
            &working_directory,
            dynamic,
            client,
            &capturing,
        )
        .await?;
        if !result.is_success() {
            return Ok(result);
        }

        for (original, remapped) in &layout.outputs {
            self.remark(
                output,
                &format!("copying output {} to {}", remapped.display(), original.display()),
            );
            remove_existing(original).await?;
            if let Some(parent) = original.parent() {
                fs.create_directory(parent, true).await?;
            }
            fs.copy(remapped, original).await?;
        }

        let value = CachedValue {
            process_output: capturing.captured_output(),
            diagnostics: capturing.captured_diagnostics(),
        };
        match self.store_result(task, key_id, value, cas).await {
            Ok(value_id) => self.remark(output, &format!("caching result: {value_id}")),
            Err(e) => {
                warn!(task = %task.identifier, error = %e, "failed to cache task outputs");
                output.warning(&format!("failed to cache task outputs: {e}"));
            }
        }
        Ok(CommandResult::Succeeded)
    }

    async fn store_result(
        &self,
        task: &ExecutableTask,
        key_id: &DataId,
        value: CachedValue,
        cas: &dyn ContentStore,
    ) -> Result<DataId> {
        let output_ids = import_all(&task.output_paths, cas).await?;
        let value_id = cas.store(CasObject::new(value.encode(), output_ids)).await?;
        cas.cache(&value_id, key_id).await?;
        Ok(value_id)
    }

    async fn perform_cached(
        &self,
        task: &ExecutableTask,
        cas: &dyn ContentStore,
        dynamic: &dyn DynamicTaskExecutionDelegate,
        execution: &dyn TaskExecutionDelegate,
        client: &dyn ClientDelegate,
        output: &dyn TaskOutputDelegate,
    ) -> Result<CommandResult> {
        let key_id = self.compute_cache_key(task, cas).await?;
        self.remark(output, &format!("cache key: {key_id}"));

        if let Some(value_id) = cas.lookup_cached_object(&key_id).await? {
            if cas.contains_tree(&value_id).await? {
                self.replay(task, &value_id, cas, output).await?;
                return Ok(CommandResult::Succeeded);
            }
            // Part of the entry was evicted; running again overwrites it
            warn!(task = %task.identifier, value = %value_id, "ignoring incomplete cache entry");
            self.remark(output, &format!("ignoring incomplete cache entry: {value_id}"));
        }
        if dynamic.cancellation().is_cancelled() {
            return Ok(CommandResult::Cancelled);
        }
        self.execute_sandboxed(task, &key_id, cas, dynamic, execution, client, output)
            .await
    }
}

async fn import_all(paths: &[PathBuf], cas: &dyn ContentStore) -> Result<Vec<DataId>> {
    let imports: Vec<BoxFuture<'_, anvil_cas::Result<DataId>>> = paths
        .iter()
        .map(|path| CasFsNode::import(path, cas).boxed())
        .collect();
    Ok(stream::iter(imports)
        .buffered(TRANSFER_PARALLELISM)
        .try_collect::<Vec<_>>()
        .await?)
}

#[async_trait]
impl TaskAction for GenericCachingTaskAction {
    fn tool_identifier(&self) -> &'static str {
        Self::TOOL_IDENTIFIER
    }

    fn serialize_payload(&self, serializer: &mut Serializer) {
        self.serialize(serializer);
    }

    /// Everything but the sandbox location, which differs between equivalent runs
    fn compute_initial_signature(&self) -> Option<Signature> {
        let mut builder = SignatureBuilder::new();
        builder
            .add_str(Self::TOOL_IDENTIFIER)
            .add_bool(self.enable_cache_debugging_remarks)
            .add_bool(self.enable_sandbox_enforcement)
            .add_number(self.extra_sandbox_subdirectories.len() as u64);
        for subdirectory in &self.extra_sandbox_subdirectories {
            builder.add_path(subdirectory);
        }
        builder
            .add_path(&self.developer_directory)
            .add_bytes(&serialization::to_bytes(&self.cas_options))
            .add_number(self.cache_key_version);
        Some(builder.finish())
    }

    #[instrument(skip_all, fields(task = %task.identifier))]
    async fn perform_task_action(
        &mut self,
        task: &ExecutableTask,
        dynamic: &dyn DynamicTaskExecutionDelegate,
        execution: &dyn TaskExecutionDelegate,
        client: &dyn ClientDelegate,
        output: &dyn TaskOutputDelegate,
    ) -> CommandResult {
        let Some(cas) = dynamic.operation_context().cas().cloned() else {
            output.error("caching is enabled, but no CAS was provided");
            return CommandResult::Failed;
        };

        let result = match self
            .perform_cached(task, cas.as_ref(), dynamic, execution, client, output)
            .await
        {
            Ok(result) => result,
            Err(TaskError::Cancelled) => CommandResult::Cancelled,
            Err(e) => {
                output.error(&e.to_string());
                CommandResult::Failed
            }
        };

        if cas.supports_pruning() {
            dynamic
                .operation_context()
                .pruner()
                .prune_cas(Arc::clone(&cas), &self.cas_options);
        }
        result
    }
}

impl Serializable for GenericCachingTaskAction {
    fn serialize(&self, serializer: &mut Serializer) {
        serializer.serialize_aggregate(7, |s| {
            s.serialize(&self.enable_cache_debugging_remarks);
            s.serialize(&self.enable_sandbox_enforcement);
            s.serialize(&self.sandbox_directory);
            s.serialize(&self.extra_sandbox_subdirectories);
            s.serialize(&self.developer_directory);
            s.serialize(&self.cas_options);
            s.serialize(&self.cache_key_version);
        });
    }

    fn deserialize(deserializer: &mut Deserializer<'_>) -> std::result::Result<Self, SerializationError> {
        deserializer.begin_aggregate(7)?;
        Ok(Self {
            enable_cache_debugging_remarks: deserializer.deserialize()?,
            enable_sandbox_enforcement: deserializer.deserialize()?,
            sandbox_directory: deserializer.deserialize()?,
            extra_sandbox_subdirectories: deserializer.deserialize()?,
            developer_directory: deserializer.deserialize()?,
            cas_options: deserializer.deserialize()?,
            cache_key_version: deserializer.deserialize()?,
        })
    }
}
