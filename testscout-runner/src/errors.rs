// Copyright (c) The testscout Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Errors produced by testscout.

use crate::engine::TaskId;
use camino::Utf8PathBuf;
use std::{fmt, time::Duration};
use thiserror::Error;

/// An error produced by a unit of work running on an engine queue.
///
/// Failures inside a job are always delivered as data through the result
/// channel, never raised across the thread boundary, so a crashed job cannot
/// corrupt the engine's bookkeeping.
#[derive(Debug, Error)]
pub enum JobError {
    /// The subprocess could not be started, typically because the executable
    /// was not found.
    #[error("failed to start `{program}`")]
    Spawn {
        /// The program that was invoked.
        program: String,
        /// The underlying I/O error.
        #[source]
        error: std::io::Error,
    },

    /// The subprocess output could not be decoded under any configured
    /// encoding.
    #[error(
        "could not decode output from `{program}` (encodings tried: {})",
        encodings.join(", ")
    )]
    Decode {
        /// The program whose output was undecodable.
        program: String,
        /// The encodings that were tried, in order.
        encodings: Vec<String>,
    },

    /// The command exited with a code outside the configured success set.
    #[error("command `{command}` failed with exit code {code}{}", display_message(message))]
    ExitCode {
        /// The rendered command line.
        command: String,
        /// The exit code.
        code: i32,
        /// Captured output, if any, for context.
        message: Option<String>,
    },

    /// The job panicked. The panic is caught at the worker and converted to
    /// this error.
    #[error("job panicked: {message}")]
    Panic {
        /// The panic payload, rendered as a string.
        message: String,
    },

    /// The worker for the job's queue went away before producing a result.
    #[error("worker for queue `{queue}` disconnected before delivering a result")]
    WorkerGone {
        /// The queue name.
        queue: String,
    },

    /// The result wait exceeded its retry budget. See [`JobTimeout`].
    #[error(transparent)]
    Timeout(#[from] JobTimeout),
}

fn display_message(message: &Option<String>) -> String {
    match message {
        Some(message) if !message.is_empty() => format!(":\n\n{message}"),
        _ => ".".to_owned(),
    }
}

/// A blocking result wait repeatedly timed out past its retry budget.
///
/// This is a diagnostic safety valve against a wedged subprocess, not a
/// correctness mechanism: the watchdog logs what the worker was doing before
/// this error is returned.
#[derive(Clone, Debug, Error)]
#[error("job {task_id} on queue `{queue}` timed out after {}ms", elapsed.as_millis())]
pub struct JobTimeout {
    /// The queue the job was submitted to.
    pub queue: String,
    /// The id of the timed-out task.
    pub task_id: TaskId,
    /// How long the caller waited in total.
    pub elapsed: Duration,
}

/// One or more discovery sub-operations failed.
///
/// Details from every failed sub-operation are carried together so partial
/// discovery failures can be reported at once rather than aborting on the
/// first.
#[derive(Clone, Debug, Error)]
pub struct DiscoveryError {
    message: String,
    details: Vec<String>,
}

impl DiscoveryError {
    /// Creates a discovery error with no further details.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            details: Vec::new(),
        }
    }

    /// Creates a discovery error carrying per-sub-operation details.
    pub fn with_details(
        message: impl Into<String>,
        details: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            message: message.into(),
            details: details.into_iter().map(|d| d.into()).collect(),
        }
    }

    /// Human-readable details, one per failed sub-operation.
    pub fn details(&self) -> &[String] {
        &self.details
    }
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)?;
        for detail in &self.details {
            write!(f, "\n  - {detail}")?;
        }
        Ok(())
    }
}

/// An error while reading or writing the durable session store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store directory could not be created.
    #[error("failed to create store directory `{path}`")]
    CreateDir {
        /// The directory path.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        error: std::io::Error,
    },

    /// A store file could not be read.
    #[error("failed to read `{path}`")]
    Read {
        /// The file path.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        error: std::io::Error,
    },

    /// A store file could not be written.
    #[error("failed to write `{path}`")]
    Write {
        /// The file path.
        path: Utf8PathBuf,
        /// The underlying I/O error.
        #[source]
        error: std::io::Error,
    },

    /// A store file exists but does not parse.
    #[error("failed to parse `{path}`")]
    Parse {
        /// The file path.
        path: Utf8PathBuf,
        /// The underlying deserialization error.
        #[source]
        error: serde_json::Error,
    },
}

/// An error returned by session-level operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// A discovery or run was requested while a run is already active.
    #[error("tests are currently running; wait for them to finish or stop them first")]
    RunInProgress,

    /// The durable store could not be read or written.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Discovery produced conflicting or failed results.
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// An error building a framework integration from its registry.
#[derive(Debug, Error)]
pub enum FrameworkError {
    /// The requested framework type has no registered factory.
    #[error("unknown test framework type `{0}`")]
    UnknownType(String),

    /// The suite settings were rejected by the framework factory.
    #[error("invalid suite settings: {0}")]
    InvalidSettings(String),
}
