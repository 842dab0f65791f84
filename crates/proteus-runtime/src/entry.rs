//! Native entry points installed on every instance's process object.

use std::fmt;

/// A host-callable native function, dispatched by
/// [`Runtime::invoke_entry_point`](crate::Runtime::invoke_entry_point).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryPoint {
    Binding,
    HasBinding,
    CreateExportsObject,
    Log,
    ReallyExit,
    AcquireLock,
    ReleaseLock,
    GetModuleUpdates,
    SetModuleUpdates,
    RegisterPermissionFeatures,
    RequestPermission,

    // process.test
    TestStart,
    TestCheck,
    TestFail,
    TestDeleteNode,
    TestCancelActivity,
    TestRef,
    TestUnref,
    TestWatcherStats,
    TestRunScript,
}

impl EntryPoint {
    pub const ALL: &'static [EntryPoint] = &[
        Self::Binding,
        Self::HasBinding,
        Self::CreateExportsObject,
        Self::Log,
        Self::ReallyExit,
        Self::AcquireLock,
        Self::ReleaseLock,
        Self::GetModuleUpdates,
        Self::SetModuleUpdates,
        Self::RegisterPermissionFeatures,
        Self::RequestPermission,
        Self::TestStart,
        Self::TestCheck,
        Self::TestFail,
        Self::TestDeleteNode,
        Self::TestCancelActivity,
        Self::TestRef,
        Self::TestUnref,
        Self::TestWatcherStats,
        Self::TestRunScript,
    ];

    /// Property name on the process object (or on `process.test`).
    pub fn name(self) -> &'static str {
        match self {
            Self::Binding => "binding",
            Self::HasBinding => "hasBinding",
            Self::CreateExportsObject => "createExportsObject",
            Self::Log => "log",
            Self::ReallyExit => "reallyExit",
            Self::AcquireLock => "acquireLock",
            Self::ReleaseLock => "releaseLock",
            Self::GetModuleUpdates => "getModuleUpdates",
            Self::SetModuleUpdates => "setModuleUpdates",
            Self::RegisterPermissionFeatures => "registerPermissionFeatures",
            Self::RequestPermission => "requestPermission",
            Self::TestStart => "start",
            Self::TestCheck => "check",
            Self::TestFail => "fail",
            Self::TestDeleteNode => "deleteNode",
            Self::TestCancelActivity => "cancelActivity",
            Self::TestRef => "ref",
            Self::TestUnref => "unref",
            Self::TestWatcherStats => "watcherStats",
            Self::TestRunScript => "runScript",
        }
    }

    /// Lives on the `process.test` object.
    pub fn is_test(self) -> bool {
        matches!(
            self,
            Self::TestStart
                | Self::TestCheck
                | Self::TestFail
                | Self::TestDeleteNode
                | Self::TestCancelActivity
                | Self::TestRef
                | Self::TestUnref
                | Self::TestWatcherStats
                | Self::TestRunScript
        )
    }

    pub fn from_name(name: &str, test: bool) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|entry| entry.is_test() == test && entry.name() == name)
    }
}

impl fmt::Display for EntryPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_test() {
            write!(f, "process.test.{}", self.name())
        } else {
            write!(f, "process.{}", self.name())
        }
    }
}
