//! Test doubles for driving task actions without a scheduler

use std::sync::{Mutex, MutexGuard};

use anvil_core::Signature;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::context::OperationContext;
use crate::delegates::{ActivityId, ActivityStatus, DynamicTaskExecutionDelegate, DynamicTaskRequest};
use crate::task::{ConfiguredTarget, ExecutionNode, TaskId};

pub(crate) use crate::scheduler::LocalExecutionDelegate as TestExecutionDelegate;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// An activity as it was reported
#[derive(Debug, Clone)]
pub(crate) struct RecordedActivity {
    pub rule_info: String,
    pub execution_description: String,
    pub output: Vec<u8>,
    pub status: Option<ActivityStatus>,
}

/// Records every request instead of acting on it
#[derive(Debug, Default)]
pub(crate) struct RecordingDynamicDelegate {
    context: OperationContext,
    input_requests: Mutex<Vec<(ExecutionNode, TaskId)>>,
    dynamic_requests: Mutex<Vec<DynamicTaskRequest>>,
    discovered: Mutex<Vec<ExecutionNode>>,
    activities: Mutex<Vec<RecordedActivity>>,
    cancellation: CancellationToken,
}

impl RecordingDynamicDelegate {
    pub fn new(context: OperationContext) -> Self {
        Self {
            context,
            ..Default::default()
        }
    }

    pub fn input_requests(&self) -> Vec<(ExecutionNode, TaskId)> {
        lock(&self.input_requests).clone()
    }

    pub fn dynamic_requests(&self) -> Vec<DynamicTaskRequest> {
        lock(&self.dynamic_requests).clone()
    }

    /// Dynamic requests made since the last call
    pub fn take_dynamic_requests(&self) -> Vec<DynamicTaskRequest> {
        std::mem::take(&mut *lock(&self.dynamic_requests))
    }

    pub fn discovered_nodes(&self) -> Vec<ExecutionNode> {
        lock(&self.discovered).clone()
    }

    pub fn activities(&self) -> Vec<RecordedActivity> {
        lock(&self.activities).clone()
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }
}

#[async_trait]
impl DynamicTaskExecutionDelegate for RecordingDynamicDelegate {
    fn request_input_node(&self, node: ExecutionNode, id: TaskId) {
        lock(&self.input_requests).push((node, id));
    }

    fn request_dynamic_task(&self, request: DynamicTaskRequest) {
        lock(&self.dynamic_requests).push(request);
    }

    fn discovered_dependency_node(&self, node: ExecutionNode) {
        lock(&self.discovered).push(node);
    }

    fn operation_context(&self) -> &OperationContext {
        &self.context
    }

    fn allows_external_tool_execution(&self) -> bool {
        false
    }

    fn cancellation(&self) -> CancellationToken {
        self.cancellation.clone()
    }

    fn begin_activity(
        &self,
        rule_info: &str,
        execution_description: &str,
        _signature: &Signature,
        _target: Option<&ConfiguredTarget>,
    ) -> ActivityId {
        let mut activities = lock(&self.activities);
        activities.push(RecordedActivity {
            rule_info: rule_info.to_string(),
            execution_description: execution_description.to_string(),
            output: Vec::new(),
            status: None,
        });
        ActivityId(activities.len() as u64 - 1)
    }

    fn emit_activity_output(&self, activity: ActivityId, bytes: &[u8]) {
        if let Some(recorded) = lock(&self.activities).get_mut(activity.0 as usize) {
            recorded.output.extend_from_slice(bytes);
        }
    }

    fn end_activity(&self, activity: ActivityId, status: ActivityStatus) {
        if let Some(recorded) = lock(&self.activities).get_mut(activity.0 as usize) {
            recorded.status = Some(status);
        }
    }
}
