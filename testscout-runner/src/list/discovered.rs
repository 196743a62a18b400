// Copyright (c) The testscout Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Identity of tests as reported by discovery: paths, locations and the ids
//! that correlate a tree node with its owning framework integration.

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Separator between segments of a test path in its displayed and persisted
/// form.
pub const TEST_SEPARATOR: char = '/';

/// Identifier of the suite (one configured framework integration) a test
/// belongs to.
#[derive(Clone, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct SuiteId(String);

impl SuiteId {
    /// Creates a new suite id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SuiteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SuiteId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// The full, globally unique path of a test in the tree.
///
/// Segments are joined with [`TEST_SEPARATOR`] to form the `full_name` used
/// as the persistence key. The root of the tree is the empty path.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct TestPath(Vec<String>);

impl TestPath {
    /// Creates a path from individual segments.
    pub fn new(segments: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(segments.into_iter().map(|s| s.into()).collect())
    }

    /// Parses a path from its slash-delimited full name.
    pub fn from_name(full_name: &str) -> Self {
        if full_name.is_empty() {
            return Self::default();
        }
        Self(full_name.split(TEST_SEPARATOR).map(String::from).collect())
    }

    /// Returns the individual path segments.
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// Returns the last segment, or `None` for the root path.
    pub fn name(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// True for the empty path, i.e. the tree root.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Number of segments in the path.
    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// Returns the parent path, or `None` for the root.
    pub fn parent(&self) -> Option<TestPath> {
        if self.0.is_empty() {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    /// Returns every strict ancestor of this path, nearest first, ending with
    /// the root.
    pub fn ancestors(&self) -> impl Iterator<Item = TestPath> + '_ {
        (0..self.0.len())
            .rev()
            .map(move |len| Self(self.0[..len].to_vec()))
    }

    /// Returns a new path with `segment` appended.
    pub fn child(&self, segment: impl Into<String>) -> TestPath {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Self(segments)
    }
}

impl fmt::Display for TestPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("/")?;
            }
            f.write_str(segment)?;
        }
        Ok(())
    }
}

/// Source location of a runnable test.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TestLocation {
    /// The executable (or interpreter entry point) the test lives in.
    pub executable: String,

    /// Source file, relative to the project root.
    pub file: Utf8PathBuf,

    /// 1-based line number of the test definition.
    pub line: u32,
}

/// One test reported by a discovery producer.
///
/// The core does not know how these were obtained; framework integrations
/// build them from whatever listing mechanism their tool provides.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DiscoveredTest {
    /// Full tree path of the test. Must be unique across all suites.
    pub full_name: TestPath,

    /// The suite this test belongs to.
    pub suite_id: SuiteId,

    /// The id to pass to the framework when asking it to run this one test.
    pub run_id: String,

    /// The id the framework emits in its result stream to report about this
    /// test. May differ from `run_id`.
    pub report_id: String,

    /// Where the test is defined.
    pub location: TestLocation,
}
