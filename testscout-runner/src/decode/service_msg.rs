// Copyright (c) The testscout Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decoder for the TeamCity service-message protocol.
//!
//! Several runners (pytest via plugin, PHPUnit, and anything configured with
//! the generic `teamcity` parser) report results as single lines of the form
//!
//! ```text
//! ##teamcity[testStarted name='suite.test_name']
//! ```
//!
//! interleaved with free console output. Intermediate sub-results
//! (`testFailed`, `testIgnored`) arrive before the final `testFinished`; the
//! decoder accumulates the maximum-severity status seen and assigns it as
//! the final status, so one failing assertion among passing ones yields an
//! overall failure.

use crate::{
    decode::{final_status, Decoder, EventSink},
    list::{SuiteId, TestPath, TestStatus},
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::trace;

const MESSAGE_PREFIX: &str = "##teamcity[";

#[derive(Debug, Eq, PartialEq)]
struct ServiceMessage {
    name: String,
    attrs: BTreeMap<String, String>,
}

impl ServiceMessage {
    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }
}

/// Undoes TeamCity `|`-escaping inside an attribute value.
fn unescape(escaped: char) -> char {
    match escaped {
        'n' => '\n',
        'r' => '\r',
        // `||`, `|'`, `|[`, `|]` and anything unrecognized map to themselves.
        other => other,
    }
}

/// Parses one service-message line; `None` for anything that is not a
/// well-formed message.
fn parse_service_message(line: &str) -> Option<ServiceMessage> {
    let body = line.trim().strip_prefix(MESSAGE_PREFIX)?.strip_suffix(']')?;
    let (name, mut rest) = match body.split_once(' ') {
        Some((name, rest)) => (name, rest),
        None => (body, ""),
    };

    let mut attrs = BTreeMap::new();
    loop {
        rest = rest.trim_start();
        if rest.is_empty() {
            break;
        }

        let (key, after_key) = rest.split_once('=')?;
        let quoted = after_key.strip_prefix('\'')?;

        let mut value = String::new();
        let mut end = None;
        let mut chars = quoted.char_indices();
        while let Some((i, c)) = chars.next() {
            match c {
                '|' => {
                    let (_, escaped) = chars.next()?;
                    value.push(unescape(escaped));
                }
                '\'' => {
                    end = Some(i);
                    break;
                }
                c => value.push(c),
            }
        }
        let end = end?;
        attrs.insert(key.to_owned(), value);
        rest = &quoted[end + 1..];
    }

    Some(ServiceMessage {
        name: name.to_owned(),
        attrs,
    })
}

/// Stateful decoder for service-message streams.
pub struct ServiceMessageDecoder {
    sink: Arc<dyn EventSink>,
    suite_id: SuiteId,
    executable: String,
    current: Option<TestPath>,
    severity: TestStatus,
    current_suite: Option<String>,
}

impl ServiceMessageDecoder {
    /// Creates a decoder reporting against the given suite and executable.
    pub fn new(sink: Arc<dyn EventSink>, suite_id: SuiteId, executable: &str) -> Self {
        Self {
            sink,
            suite_id,
            executable: executable.to_owned(),
            current: None,
            severity: TestStatus::NotRun,
            current_suite: None,
        }
    }

    /// Finishes the current test, if any, with `status`.
    fn finish_current(&mut self, status: TestStatus) {
        if let Some(path) = self.current.take() {
            self.sink.test_finished(&path, status);
        }
    }

    /// Resolves a reported test name, preferring the `Suite::name` form when
    /// a suite is active (some runners qualify report ids that way).
    fn resolve(&self, name: &str) -> Option<TestPath> {
        if let Some(suite) = &self.current_suite {
            let qualified = format!("{suite}::{name}");
            if let Some(path) = self.sink.resolve(&self.suite_id, &self.executable, &qualified) {
                return Some(path);
            }
        }
        self.sink.resolve(&self.suite_id, &self.executable, name)
    }
}

impl Decoder for ServiceMessageDecoder {
    fn feed(&mut self, chunk: &str) {
        trace!(line = chunk.trim_end(), "service-message feed");

        // Everything the process prints while a test is active belongs to
        // that test's output, service messages included.
        if let Some(path) = &self.current {
            self.sink.test_output(path, chunk);
        }

        let Some(message) = parse_service_message(chunk) else {
            return;
        };

        match message.name.as_str() {
            "testStarted" => {
                // A started message while a test is still open means the
                // previous test never reported a result.
                self.finish_current(TestStatus::Crashed);
                let Some(name) = message.attr("name") else {
                    return;
                };
                self.severity = TestStatus::NotRun;
                self.current = self.resolve(name);
                if let Some(path) = &self.current {
                    self.sink.test_started(path);
                }
            }
            "testFinished" => {
                let status = final_status(self.severity);
                self.finish_current(status);
            }
            "testFailed" => self.severity = self.severity.max(TestStatus::Failed),
            "testIgnored" => self.severity = self.severity.max(TestStatus::Skipped),
            "testSuiteStarted" => {
                self.current_suite = message.attr("name").map(str::to_owned);
            }
            "testSuiteFinished" => self.current_suite = None,
            _ => {}
        }
    }

    fn close(&mut self) {
        self.finish_current(TestStatus::Crashed);
    }
}
