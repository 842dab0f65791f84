//! Host client contract.
//!
//! A host client is the page (or test harness) that owns a runtime
//! instance. The runtime calls back into it on the main thread for
//! lifecycle milestones and for feature/permission requests.

use std::sync::Arc;

use crate::instance::InstanceId;
use crate::module::ModuleId;
use crate::script::ContextHandle;
use crate::test_status::TestReport;

/// Answer token for a permission request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PermissionTicket {
    pub instance: InstanceId,
    pub module: ModuleId,
    pub id: u64,
}

/// Notification sent from the runtime to the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// Background thread has completions waiting.
    Pending,
    /// Background thread went idle.
    Done,
    RegisterPrivilegedFeatures {
        features: Vec<String>,
    },
    RequestPermission {
        features: Vec<String>,
        ticket: PermissionTicket,
    },
}

/// Wakes the host's main loop. Called on the background thread right after
/// a `Pending` or `Done` code is queued; must not call into the runtime.
pub type HostWaker = Arc<dyn Fn(NodeEvent) + Send + Sync>;

/// Owner of a runtime instance.
pub trait HostClient {
    /// Feature and permission requests from content.
    fn handle_node_event(&self, instance: InstanceId, event: NodeEvent);

    /// The instance is gone; its id will not be reused.
    fn on_instance_destroyed(&self, _instance: InstanceId) {}

    /// The instance's unit of work was reported.
    fn on_work_done(&self, _report: &TestReport) {}

    /// Url of the page that owns the instance.
    fn url(&self) -> String {
        String::new()
    }

    /// Page context the instance attaches to. At most one instance exists
    /// per host context.
    fn host_context(&self) -> Option<ContextHandle> {
        None
    }
}
