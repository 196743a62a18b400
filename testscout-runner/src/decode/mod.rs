// Copyright (c) The testscout Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decoding of test-runner output streams into lifecycle events.
//!
//! A [`Decoder`] consumes the raw, incrementally-arriving output of a running
//! test subprocess and translates it into a small vocabulary of events on an
//! [`EventSink`]: test started, test output, test finished. Decoders are
//! stateful -- most protocols stream one test's result at a time -- and they
//! guarantee that a started test is always finished: if the stream closes
//! first, a crashed outcome is synthesized. Silence is never success.
//!
//! Malformed input is tolerated locally. Unresolvable report ids are dropped
//! and unparseable records are treated as plain output, because one garbled
//! line must not abort an otherwise-healthy run.

mod libtest;
mod service_msg;
mod xml;

pub mod doctest;

pub use libtest::*;
pub use service_msg::*;
pub use xml::*;

use crate::list::{SuiteId, TestPath, TestStatus};
use std::sync::Arc;

/// Receiver of decoded test lifecycle events, implemented by the session.
///
/// `resolve` maps a framework-reported identifier to a tree path through the
/// report-id index; decoders drop events whose id does not resolve.
pub trait EventSink: Send + Sync {
    /// Resolves a framework-reported id to a tree path, or `None` if the id
    /// is unknown (e.g. a test that was filtered out of this run).
    fn resolve(&self, suite_id: &SuiteId, executable: &str, report_id: &str) -> Option<TestPath>;

    /// A test began executing.
    fn test_started(&self, path: &TestPath);

    /// A test produced free-form output, preserved verbatim.
    fn test_output(&self, path: &TestPath, text: &str);

    /// A test finished with the given status.
    fn test_finished(&self, path: &TestPath, status: TestStatus);
}

/// A stateful translator from raw subprocess output to lifecycle events.
pub trait Decoder: Send {
    /// Accepts the next chunk of output, typically one line, and emits zero
    /// or more events on the sink.
    fn feed(&mut self, chunk: &str);

    /// Called when the underlying stream ends. If a test was started but
    /// never finished, exactly one crashed outcome is synthesized for it.
    fn close(&mut self);
}

/// Resolves the worst sub-result accumulated for a test into its final
/// status.
///
/// Accumulation starts at `NotRun` so that a lone skip can win (`Skipped`
/// sorts below `Passed` in the severity order); a finish with no sub-result
/// at all means the test passed.
pub(crate) fn final_status(severity: TestStatus) -> TestStatus {
    if severity == TestStatus::NotRun {
        TestStatus::Passed
    } else {
        severity
    }
}

/// Builds one of the protocol-generic decoders by name, for frameworks whose
/// configuration selects an alternative output protocol.
///
/// Currently `"teamcity"` selects the service-message decoder. Unknown names
/// return `None` and the framework integration falls back to its native
/// decoder.
pub fn generic_decoder(
    name: &str,
    sink: Arc<dyn EventSink>,
    suite_id: SuiteId,
    executable: &str,
) -> Option<Box<dyn Decoder>> {
    match name {
        "teamcity" => Some(Box::new(ServiceMessageDecoder::new(sink, suite_id, executable))),
        _ => None,
    }
}
