//! Per-instance completion tracking.
//!
//! `Init -> Started -> Done -> Reported`, strictly forward. A reported unit
//! of work only moves again on a fresh `start`, so late completion signals
//! that race the report are ignored instead of reported twice.

use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info};

use crate::error::protocol_violation;
use crate::instance::InstanceId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TestState {
    Init,
    Started,
    Done,
    Reported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TestStatus {
    Failed,
    Passed,
    /// The engine died under the unit of work; set by the host.
    Crashed,
}

impl TestStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Failed => "**FAILED",
            Self::Passed => "PASSED",
            Self::Crashed => "**CRASHED",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final result of one unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TestReport {
    pub instance: InstanceId,
    pub label: String,
    pub status: TestStatus,
    pub elapsed: Duration,
}

impl TestReport {
    pub fn passed(&self) -> bool {
        self.status == TestStatus::Passed
    }

    pub(crate) fn log(&self) {
        if self.passed() {
            info!(instance = %self.instance, "{self}");
        } else {
            error!(instance = %self.instance, "{self}");
        }
    }
}

impl fmt::Display for TestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "|DESKTOP| Test {:>10}: {} ({})",
            self.status.as_str(),
            self.label,
            self.elapsed.as_millis()
        )
    }
}

/// Whether a signal changed the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Applied,
    Ignored,
}

impl Transition {
    pub fn applied(self) -> bool {
        self == Self::Applied
    }
}

#[derive(Debug)]
pub struct TestStatusTracker {
    instance: InstanceId,
    state: TestState,
    status: TestStatus,
    label: String,
    started: Instant,
}

impl TestStatusTracker {
    pub fn new(instance: InstanceId) -> Self {
        Self {
            instance,
            state: TestState::Init,
            status: TestStatus::Passed,
            label: String::new(),
            started: Instant::now(),
        }
    }

    pub fn state(&self) -> TestState {
        self.state
    }

    pub fn status(&self) -> TestStatus {
        self.status
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn set_label(&mut self, label: impl Into<String>) {
        self.label = label.into();
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Begin a unit of work. Allowed from every state; resets the outcome
    /// to passed and restarts the clock.
    pub fn start(&mut self, label: Option<&str>) -> Transition {
        if let Some(label) = label {
            self.label = label.to_string();
        }
        self.state = TestState::Started;
        self.status = TestStatus::Passed;
        self.started = Instant::now();
        error!(instance = %self.instance, "{}", self.started_line());
        Transition::Applied
    }

    /// Start line, aligned with the report line.
    fn started_line(&self) -> String {
        format!("|DESKTOP| Test {:>10}: {}", "STARTED", self.label)
    }

    /// Record an outcome. Ignored once reported.
    pub fn set_status(&mut self, status: TestStatus) -> Transition {
        if self.state == TestState::Reported {
            debug!(instance = %self.instance, %status, "status after report ignored");
            return Transition::Ignored;
        }
        self.status = status;
        Transition::Applied
    }

    /// Content finished the unit of work.
    pub fn mark_done(&mut self) -> Transition {
        match self.state {
            TestState::Init | TestState::Started => {
                self.state = TestState::Done;
                Transition::Applied
            }
            TestState::Done => {
                debug!(instance = %self.instance, "already done");
                Transition::Ignored
            }
            TestState::Reported => Transition::Ignored,
        }
    }

    /// Mark failed and done.
    pub fn fail(&mut self) -> Transition {
        self.set_status(TestStatus::Failed);
        self.mark_done()
    }

    /// Mark crashed and done.
    pub fn crash(&mut self) -> Transition {
        self.set_status(TestStatus::Crashed);
        self.mark_done()
    }

    /// Completion forced by the aggregator: only a started unit moves.
    pub fn force_done(&mut self) -> Transition {
        if self.state == TestState::Started {
            self.state = TestState::Done;
            Transition::Applied
        } else {
            Transition::Ignored
        }
    }

    /// Move `Done -> Reported` and produce the report, exactly once.
    pub fn take_report(&mut self) -> Option<TestReport> {
        match self.state {
            TestState::Done => {
                self.state = TestState::Reported;
                Some(TestReport {
                    instance: self.instance,
                    label: self.label.clone(),
                    status: self.status,
                    elapsed: self.elapsed(),
                })
            }
            TestState::Reported => {
                debug!(instance = %self.instance, "already reported");
                None
            }
            state => {
                protocol_violation(format_args!(
                    "report requested for {} in state {state:?}",
                    self.instance
                ));
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> TestStatusTracker {
        TestStatusTracker::new(InstanceId::new(1))
    }

    #[test]
    fn test_forward_path() {
        let mut t = tracker();
        assert_eq!(t.state(), TestState::Init);
        t.start(Some("suite"));
        assert_eq!(t.state(), TestState::Started);
        assert!(t.mark_done().applied());
        let report = t.take_report().unwrap();
        assert_eq!(report.status, TestStatus::Passed);
        assert_eq!(report.label, "suite");
        assert_eq!(t.state(), TestState::Reported);
    }

    #[test]
    fn test_reported_only_once_per_unit() {
        let mut t = tracker();
        t.start(None);
        t.mark_done();
        assert!(t.take_report().is_some());

        assert_eq!(t.mark_done(), Transition::Ignored);
        assert_eq!(t.fail(), Transition::Ignored);
        assert_eq!(t.force_done(), Transition::Ignored);
        assert!(t.take_report().is_none());
        assert_eq!(t.status(), TestStatus::Passed);

        t.start(None);
        t.fail();
        let report = t.take_report().unwrap();
        assert_eq!(report.status, TestStatus::Failed);
    }

    #[test]
    fn test_done_twice_is_ignored() {
        let mut t = tracker();
        t.start(None);
        assert_eq!(t.mark_done(), Transition::Applied);
        assert_eq!(t.mark_done(), Transition::Ignored);
        assert_eq!(t.state(), TestState::Done);
    }

    #[test]
    fn test_force_done_only_moves_started() {
        let mut t = tracker();
        assert_eq!(t.force_done(), Transition::Ignored);
        assert_eq!(t.state(), TestState::Init);
        t.start(None);
        assert_eq!(t.force_done(), Transition::Applied);
        assert_eq!(t.state(), TestState::Done);
    }

    #[test]
    fn test_start_resets_status() {
        let mut t = tracker();
        t.start(None);
        t.set_status(TestStatus::Crashed);
        t.start(None);
        assert_eq!(t.status(), TestStatus::Passed);
    }

    #[test]
    fn test_started_line_matches_report_format() {
        let mut t = tracker();
        t.start(Some("fs.read"));
        assert_eq!(t.started_line(), "|DESKTOP| Test    STARTED: fs.read");
    }

    #[test]
    fn test_crash_reports_crashed() {
        let mut t = tracker();
        t.start(Some("page"));
        assert!(t.crash().applied());
        let report = t.take_report().unwrap();
        assert_eq!(report.status, TestStatus::Crashed);
        assert_eq!(report.to_string().split(':').next(), Some("|DESKTOP| Test  **CRASHED"));
        assert_eq!(t.crash(), Transition::Ignored);
    }

    #[test]
    fn test_report_format() {
        let report = TestReport {
            instance: InstanceId::new(2),
            label: "fs.read".into(),
            status: TestStatus::Passed,
            elapsed: Duration::from_millis(12),
        };
        assert_eq!(report.to_string(), "|DESKTOP| Test     PASSED: fs.read (12)");
        let failed = TestReport {
            status: TestStatus::Failed,
            ..report
        };
        assert_eq!(failed.to_string(), "|DESKTOP| Test   **FAILED: fs.read (12)");
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "protocol violation")]
    fn test_report_before_done_is_fatal() {
        let mut t = tracker();
        t.start(None);
        t.take_report();
    }
}
