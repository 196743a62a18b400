// Copyright (c) The testscout Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decoder for libtest-style JSON event streams.
//!
//! `cargo test -- -Z unstable-options --format json` and compatible harnesses
//! emit one JSON object per line:
//!
//! ```text
//! { "type": "test", "event": "started", "name": "tests::parses" }
//! { "type": "test", "event": "ok", "name": "tests::parses" }
//! ```
//!
//! Suite-level records and lines that do not parse as JSON are passed through
//! as plain output when a test is active.

use crate::{
    decode::{final_status, Decoder, EventSink},
    list::{SuiteId, TestPath, TestStatus},
};
use serde_json::Value;
use std::sync::Arc;

/// Stateful decoder for line-delimited libtest JSON.
pub struct LibtestDecoder {
    sink: Arc<dyn EventSink>,
    suite_id: SuiteId,
    executable: String,
    current: Option<TestPath>,
    severity: TestStatus,
}

impl LibtestDecoder {
    /// Creates a decoder reporting against the given suite and executable.
    pub fn new(sink: Arc<dyn EventSink>, suite_id: SuiteId, executable: &str) -> Self {
        Self {
            sink,
            suite_id,
            executable: executable.to_owned(),
            current: None,
            severity: TestStatus::NotRun,
        }
    }

    fn finish_current(&mut self, status: TestStatus) {
        if let Some(path) = self.current.take() {
            self.sink.test_finished(&path, status);
        }
    }

    /// Interprets one parsed test record. Returns `false` if the record is
    /// not a test event, in which case the line is treated as output.
    fn handle_record(&mut self, record: &Value) -> bool {
        // Harnesses differ on whether suite records carry `"type"`; a record
        // is a test event iff `type`, when present, is `"test"` and an
        // `event` field exists.
        match record.get("type").and_then(Value::as_str) {
            Some("test") | None => {}
            Some(_) => return false,
        }
        let Some(event) = record.get("event").and_then(Value::as_str) else {
            return false;
        };
        let name = record.get("name").and_then(Value::as_str);

        match event {
            "started" => {
                self.finish_current(TestStatus::Crashed);
                let Some(name) = name else {
                    return true;
                };
                self.severity = TestStatus::NotRun;
                self.current = self.sink.resolve(&self.suite_id, &self.executable, name);
                if let Some(path) = &self.current {
                    self.sink.test_started(path);
                }
            }
            "ok" => {
                let status = final_status(self.severity);
                self.finish_current(status);
            }
            "failed" => {
                self.severity = self.severity.max(TestStatus::Failed);
                self.finish_current(self.severity);
            }
            "ignored" => {
                self.severity = self.severity.max(TestStatus::Skipped);
                self.finish_current(self.severity);
            }
            _ => {}
        }
        true
    }
}

impl Decoder for LibtestDecoder {
    fn feed(&mut self, chunk: &str) {
        let record = serde_json::from_str::<Value>(chunk.trim()).ok();
        let handled = match &record {
            Some(record) => self.handle_record(record),
            None => false,
        };

        // Anything that is not a recognized test record is console output
        // belonging to the active test.
        if !handled {
            if let Some(path) = &self.current {
                self.sink.test_output(path, chunk);
            }
        }
    }

    fn close(&mut self) {
        self.finish_current(TestStatus::Crashed);
    }
}
