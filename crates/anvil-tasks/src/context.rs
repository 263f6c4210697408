//! Per-operation shared state
//!
//! One [`OperationContext`] is created per build operation and handed to
//! every action through the dynamic execution delegate. It owns the content
//! store handles, the pruner and the planned builds, so concurrent operations
//! in one process never share them by accident.

use std::sync::Arc;

use anvil_cas::{CasOptions, CasPruner, ContentStore, DirectoryRemoteCache, OnDiskCas, RemoteCache};
use tracing::debug;

use crate::error::Result;
use crate::planning::{DriverPlanner, JsonDriverPlanner, ModuleDependencyGraph};

#[derive(Debug)]
pub struct OperationContext {
    cas: Option<Arc<dyn ContentStore>>,
    remote: Option<Arc<dyn RemoteCache>>,
    pruner: Arc<CasPruner>,
    module_dependency_graph: ModuleDependencyGraph,
    planner: Arc<dyn DriverPlanner>,
}

impl Default for OperationContext {
    fn default() -> Self {
        Self {
            cas: None,
            remote: None,
            pruner: Arc::new(CasPruner::new()),
            module_dependency_graph: ModuleDependencyGraph::new(),
            planner: Arc::new(JsonDriverPlanner),
        }
    }
}

impl OperationContext {
    /// A context without a content store
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the on-disk store (and remote mirror, if any) described by `options`
    pub fn open(options: &CasOptions) -> Result<Self> {
        let mut context = Self::new().with_cas(Arc::new(OnDiskCas::open(&options.cas_path)?));
        if let Some(remote) = &options.remote_service_path {
            context = context.with_remote(Arc::new(DirectoryRemoteCache::open(remote)?));
        }
        debug!(cas = %options.cas_path.display(), remote = options.has_remote_cache(), "opened operation context");
        Ok(context)
    }

    /// Builder: set the content store
    pub fn with_cas(mut self, cas: Arc<dyn ContentStore>) -> Self {
        self.cas = Some(cas);
        self
    }

    /// Builder: set the remote mirror
    pub fn with_remote(mut self, remote: Arc<dyn RemoteCache>) -> Self {
        self.remote = Some(remote);
        self
    }

    /// Builder: set the driver planner
    pub fn with_planner(mut self, planner: Arc<dyn DriverPlanner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn cas(&self) -> Option<&Arc<dyn ContentStore>> {
        self.cas.as_ref()
    }

    pub fn remote(&self) -> Option<&Arc<dyn RemoteCache>> {
        self.remote.as_ref()
    }

    pub fn pruner(&self) -> &CasPruner {
        &self.pruner
    }

    pub fn module_dependency_graph(&self) -> &ModuleDependencyGraph {
        &self.module_dependency_graph
    }

    pub fn planner(&self) -> &Arc<dyn DriverPlanner> {
        &self.planner
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_has_no_cas() {
        let context = OperationContext::new();
        assert!(context.cas().is_none());
        assert!(context.remote().is_none());
    }

    #[test]
    fn test_open_with_remote() {
        let temp = TempDir::new().unwrap();
        let options = CasOptions::new(temp.path().join("cas")).with_remote(temp.path().join("remote"));
        let context = OperationContext::open(&options).unwrap();
        assert!(context.cas().is_some());
        assert!(context.remote().is_some());
        assert!(temp.path().join("remote/objects").is_dir());
    }
}
