// Copyright (c) The testscout Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Decoder for the doctest C++ framework's XML reporter.
//!
//! doctest writes a `<TestRun>` document containing one `<TestCase>` per
//! executed test, with nested `<SubCase>`, `<Expression>` (assertion results
//! carrying `<Original>` and `<Expanded>` forms), `<Info>` context and
//! `<Exception>` elements. The binary echoes every selected test case even
//! when invoked for a subset, so the decoder filters test cases against the
//! run ids actually requested.
//!
//! Assertion failures are rendered into the test's output as framed blocks
//! rather than kept structured; the tree only needs statuses, and the raw
//! expansion is what a person wants to read.

use crate::{
    decode::{Decoder, EventSink, XmlAdapter, XmlVisitor},
    list::{SuiteId, TestPath, TestStatus},
};
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

const FRAME: &str =
    "----------------------------------------------------------------";

/// Attributes of an `<Expression>` element, held until its children have been
/// captured.
struct ExpressionContext {
    success: bool,
    check: String,
    file: String,
    line: String,
    original: String,
    expanded: String,
}

struct ExceptionContext {
    crash: bool,
}

struct DoctestVisitor {
    sink: Arc<dyn EventSink>,
    suite_id: SuiteId,
    executable: String,
    run_ids: BTreeSet<String>,
    current: Option<TestPath>,
    severity: TestStatus,
    skipped: bool,
    subcases: Vec<String>,
    infos: Vec<String>,
    expression: Option<ExpressionContext>,
    exception: Option<ExceptionContext>,
}

impl DoctestVisitor {
    fn finish_current(&mut self, status: TestStatus) {
        if let Some(path) = self.current.take() {
            self.sink.test_finished(&path, status);
        }
        self.subcases.clear();
        self.infos.clear();
    }

    fn emit_output(&self, text: &str) {
        if let Some(path) = &self.current {
            self.sink.test_output(path, text);
        }
    }

    /// The `in subcase` / `with` context lines shared by assertion and
    /// exception blocks.
    fn context_lines(&self) -> String {
        let mut lines = String::new();
        for subcase in &self.subcases {
            lines.push_str(&format!("  in subcase \"{subcase}\"\n"));
        }
        for info in &self.infos {
            lines.push_str(&format!("  with \"{info}\"\n"));
        }
        lines
    }

    fn emit_expression(&mut self, expr: ExpressionContext) {
        let result = if expr.success { "PASSED" } else { "FAILED" };
        let context = self.context_lines();
        let block = format!(
            "{FRAME}\n{result}\n  at {}:{}\n{context}\nExpected: {}({})\nActual:   {}\n{FRAME}\n",
            expr.file,
            expr.line,
            expr.check,
            expr.original.trim(),
            expr.expanded.trim(),
        );
        self.emit_output(&block);
        self.infos.clear();
        if !expr.success {
            self.severity = self.severity.max(TestStatus::Failed);
        }
    }

    fn emit_exception(&mut self, exception: ExceptionContext, text: &str) {
        let label = if exception.crash { "CRASH" } else { "EXCEPTION" };
        let context = self.context_lines();
        let block = format!("{FRAME}\n{label}\n{context}{}\n{FRAME}\n", text.trim());
        self.emit_output(&block);
        self.infos.clear();
        let status = if exception.crash {
            TestStatus::Crashed
        } else {
            TestStatus::Failed
        };
        self.severity = self.severity.max(status);
    }
}

impl XmlVisitor for DoctestVisitor {
    fn capture_text(&self, name: &str) -> bool {
        matches!(name, "Exception" | "Expanded" | "Info" | "Original")
    }

    fn element_started(&mut self, name: &str, attrs: &BTreeMap<String, String>) {
        let attr = |key: &str| attrs.get(key).cloned().unwrap_or_default();
        match name {
            "TestCase" => {
                self.finish_current(TestStatus::Crashed);
                let report_id = attr("name");
                // doctest echoes every selected test case; only the ones this
                // run asked for are ours to report.
                if !self.run_ids.is_empty() && !self.run_ids.contains(&report_id) {
                    return;
                }
                self.severity = TestStatus::Passed;
                self.skipped = attr("skipped") == "true";
                self.current = self
                    .sink
                    .resolve(&self.suite_id, &self.executable, &report_id);
                if let Some(path) = &self.current {
                    if !self.skipped {
                        self.sink.test_started(path);
                    }
                }
            }
            "SubCase" => self.subcases.push(attr("name")),
            "Expression" => {
                self.expression = Some(ExpressionContext {
                    success: attr("success") == "true",
                    check: attr("type"),
                    file: attr("filename"),
                    line: attr("line"),
                    original: String::new(),
                    expanded: String::new(),
                });
            }
            "Exception" => {
                self.exception = Some(ExceptionContext {
                    crash: attr("crash") == "true",
                });
            }
            "OverallResultsAsserts" => {
                if attr("test_case_success") == "false" {
                    self.severity = self.severity.max(TestStatus::Failed);
                }
            }
            _ => {}
        }
    }

    fn element_finished(&mut self, name: &str, text: &str) {
        match name {
            "TestCase" => {
                let status = if self.skipped {
                    TestStatus::Skipped
                } else {
                    self.severity
                };
                self.finish_current(status);
            }
            "SubCase" => {
                self.subcases.pop();
            }
            "Original" => {
                if let Some(expr) = &mut self.expression {
                    expr.original.push_str(text);
                }
            }
            "Expanded" => {
                if let Some(expr) = &mut self.expression {
                    expr.expanded.push_str(text);
                }
            }
            "Expression" => {
                if let Some(expr) = self.expression.take() {
                    self.emit_expression(expr);
                }
            }
            "Info" => self.infos.push(text.trim().to_owned()),
            "Exception" => {
                if let Some(exception) = self.exception.take() {
                    self.emit_exception(exception, text);
                }
            }
            _ => {}
        }
    }

    fn text(&mut self, content: &str) {
        self.emit_output(content);
    }

    fn stream_closed(&mut self) {
        self.finish_current(TestStatus::Crashed);
    }
}

/// Builds the doctest decoder for one executable invocation.
///
/// `run_ids` are the test case names this invocation was asked to run; an
/// empty set means the whole executable runs unfiltered.
pub fn doctest_decoder(
    sink: Arc<dyn EventSink>,
    suite_id: SuiteId,
    executable: &str,
    run_ids: impl IntoIterator<Item = impl Into<String>>,
) -> Box<dyn Decoder> {
    Box::new(XmlAdapter::new(DoctestVisitor {
        sink,
        suite_id,
        executable: executable.to_owned(),
        run_ids: run_ids.into_iter().map(|id| id.into()).collect(),
        current: None,
        severity: TestStatus::Passed,
        skipped: false,
        subcases: Vec::new(),
        infos: Vec::new(),
        expression: None,
        exception: None,
    }))
}
