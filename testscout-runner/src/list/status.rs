// Copyright (c) The testscout Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test and run statuses, and the total order used to aggregate them.
//!
//! Both enums are ordered by ascending severity. An internal tree node takes
//! the maximum status over its children, so a single crashed test bubbles up
//! to the root, and a fully passing subtree reports `Passed`.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The outcome of the most recent execution of a test, ordered by ascending
/// severity.
///
/// `max` over this order is the aggregation function for internal tree nodes:
/// one `Failed` child outweighs any number of `Passed` ones.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum TestStatus {
    /// The test has never run since it was discovered.
    #[default]
    NotRun,

    /// The test was queued or running when the run was stopped.
    Stopped,

    /// The test reported itself as skipped or ignored.
    Skipped,

    /// The test ran to completion and passed.
    Passed,

    /// The test ran to completion and failed.
    Failed,

    /// The test started but never reported a result: the process crashed, was
    /// killed, or produced malformed output.
    Crashed,
}

impl TestStatus {
    /// Returns the name used in persisted state and log output.
    pub fn as_str(self) -> &'static str {
        match self {
            TestStatus::NotRun => "not-run",
            TestStatus::Stopped => "stopped",
            TestStatus::Skipped => "skipped",
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Crashed => "crashed",
        }
    }
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a test is currently queued or executing, ordered by ascending
/// severity.
///
/// Aggregated over internal nodes the same way as [`TestStatus`]: a parent is
/// `Running` as long as any descendant is.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum RunStatus {
    /// The test is not part of an active run.
    #[default]
    NotRunning,

    /// The test is part of an active run and waiting for its turn.
    Queued,

    /// The test is currently executing.
    Running,
}

impl RunStatus {
    /// Returns the name used in persisted state and log output.
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::NotRunning => "not-running",
            RunStatus::Queued => "queued",
            RunStatus::Running => "running",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
