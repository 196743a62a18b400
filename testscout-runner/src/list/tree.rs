// Copyright (c) The testscout Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The hierarchical test tree and its aggregate-status bookkeeping.
//!
//! Every level of the tree is an ordered map keyed by path segment, so
//! looking up a full path is O(depth). A secondary index maps the
//! `(suite_id, executable, report_id)` triple a framework reports about back
//! to the owning tree path in O(1), which is what decoders use while a run
//! is streaming results.

use crate::{
    errors::DiscoveryError,
    list::{DiscoveredTest, RunStatus, SuiteId, TestLocation, TestPath, TestStatus},
};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use std::collections::{BTreeSet, HashMap};

/// A node in the test tree: either an internal grouping (executable, suite,
/// fixture) or a runnable leaf.
///
/// The presence of `children` is what distinguishes the two kinds, not the
/// name or location: an internal node always has `Some` children (possibly
/// empty), a leaf has `None`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TestNode {
    /// Last segment of the node's path.
    pub name: String,

    /// Monotonic id assigned at the most recent discovery; used for stable
    /// ordering of siblings.
    pub discovery_id: u64,

    /// The suite owning this leaf. `None` for internal nodes.
    pub suite_id: Option<SuiteId>,

    /// The id used to ask the framework to run this one test.
    pub run_id: Option<String>,

    /// The id the framework emits in its result stream for this test.
    pub report_id: Option<String>,

    /// Source location; present only for runnable leaves.
    pub location: Option<TestLocation>,

    /// Outcome of the most recent execution.
    pub last_status: TestStatus,

    /// Whether the node is part of an active run.
    pub run_status: RunStatus,

    /// Timestamp of the last execution start.
    pub last_run: Option<DateTime<Utc>>,

    /// Child nodes, keyed by name. `None` marks a leaf.
    pub children: Option<IndexMap<String, TestNode>>,
}

impl TestNode {
    fn internal(name: impl Into<String>, discovery_id: u64) -> Self {
        Self {
            name: name.into(),
            discovery_id,
            suite_id: None,
            run_id: None,
            report_id: None,
            location: None,
            last_status: TestStatus::NotRun,
            run_status: RunStatus::NotRunning,
            last_run: None,
            children: Some(IndexMap::new()),
        }
    }

    fn leaf(name: impl Into<String>, discovery_id: u64, test: &DiscoveredTest) -> Self {
        Self {
            name: name.into(),
            discovery_id,
            suite_id: Some(test.suite_id.clone()),
            run_id: Some(test.run_id.clone()),
            report_id: Some(test.report_id.clone()),
            location: Some(test.location.clone()),
            last_status: TestStatus::NotRun,
            run_status: RunStatus::NotRunning,
            last_run: None,
            children: None,
        }
    }

    /// True if this node is a runnable leaf.
    pub fn is_leaf(&self) -> bool {
        self.children.is_none()
    }

    /// Recomputes this node's aggregate statuses from its immediate children.
    ///
    /// Leaves are never recomputed; an internal node with no children reports
    /// the status defaults.
    fn recompute(&mut self) {
        let Some(children) = &self.children else {
            return;
        };
        self.last_status = children
            .values()
            .map(|c| c.last_status)
            .max()
            .unwrap_or_default();
        self.run_status = children
            .values()
            .map(|c| c.run_status)
            .max()
            .unwrap_or_default();
    }
}

/// Aggregate counts over a subtree, one bucket per status.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TestStats {
    /// Total number of leaves visited.
    pub total: usize,
    /// Leaves that have never run.
    pub not_run: usize,
    /// Leaves stopped before producing a result.
    pub stopped: usize,
    /// Skipped leaves.
    pub skipped: usize,
    /// Passed leaves.
    pub passed: usize,
    /// Failed leaves.
    pub failed: usize,
    /// Crashed leaves.
    pub crashed: usize,
    /// Leaves not part of an active run.
    pub not_running: usize,
    /// Leaves queued in the active run.
    pub queued: usize,
    /// Leaves currently executing.
    pub running: usize,
    /// Most recent execution start over the subtree.
    pub last_run: Option<DateTime<Utc>>,
}

impl TestStats {
    fn record(&mut self, node: &TestNode) {
        self.total += 1;
        match node.last_status {
            TestStatus::NotRun => self.not_run += 1,
            TestStatus::Stopped => self.stopped += 1,
            TestStatus::Skipped => self.skipped += 1,
            TestStatus::Passed => self.passed += 1,
            TestStatus::Failed => self.failed += 1,
            TestStatus::Crashed => self.crashed += 1,
        }
        match node.run_status {
            RunStatus::NotRunning => self.not_running += 1,
            RunStatus::Queued => self.queued += 1,
            RunStatus::Running => self.running += 1,
        }
        self.last_run = self.last_run.max(node.last_run);
    }
}

type ReportKey = (SuiteId, String, String);

/// The test tree: the root node plus the report-id index.
#[derive(Clone, Debug, Default)]
pub struct TestTree {
    root: Option<TestNode>,
    report_index: HashMap<ReportKey, TestPath>,
}

impl TestTree {
    /// Creates an empty tree.
    pub fn new() -> Self {
        Self {
            root: Some(TestNode::internal("", 0)),
            report_index: HashMap::new(),
        }
    }

    fn root(&self) -> &TestNode {
        self.root.as_ref().expect("tree root always present")
    }

    fn root_mut(&mut self) -> &mut TestNode {
        self.root.as_mut().expect("tree root always present")
    }

    /// Builds a tree from a discovery result.
    ///
    /// Nodes whose full path already existed in `prior` keep their
    /// `last_status` and `last_run`: discovery refreshes identity and
    /// location, it does not reset history. Fresh `discovery_id`s are
    /// assigned in list order and the report-id index is rebuilt.
    ///
    /// Two tests sharing a full path, or a `(suite, executable, report_id)`
    /// triple, are a configuration error reported as [`DiscoveryError`]
    /// rather than silently overwritten.
    pub fn from_discovered(
        tests: &[DiscoveredTest],
        prior: &TestTree,
    ) -> Result<TestTree, DiscoveryError> {
        let mut tree = TestTree::new();
        let mut details = Vec::new();
        let mut next_id = 0u64;

        for test in tests {
            if test.full_name.is_root() {
                details.push("discovered a test with an empty path".to_owned());
                continue;
            }
            if tree.node(&test.full_name).is_some() {
                details.push(format!("duplicate test path: {}", test.full_name));
                continue;
            }
            // A path running through an already-discovered test would turn
            // that leaf into a group.
            if let Some(existing) = test
                .full_name
                .ancestors()
                .find(|a| !a.is_root() && tree.node(a).is_some_and(TestNode::is_leaf))
            {
                details.push(format!(
                    "test path {} passes through existing test {}",
                    test.full_name, existing,
                ));
                continue;
            }

            let key = (
                test.suite_id.clone(),
                test.location.executable.clone(),
                test.report_id.clone(),
            );
            if let Some(existing) = tree.report_index.get(&key) {
                details.push(format!(
                    "tests `{}` and `{}` both report as `{}` in {} ({})",
                    existing, test.full_name, test.report_id, test.location.executable,
                    test.suite_id,
                ));
                continue;
            }

            tree.insert_leaf(test, &mut next_id);
            tree.report_index.insert(key, test.full_name.clone());
        }

        // Carry over history for tests that still exist, then make ancestors
        // consistent in a single pass.
        tree.carry_over_history(prior);
        tree.recompute_all();

        if !details.is_empty() {
            return Err(DiscoveryError::with_details(
                "discovered tests with conflicting identities",
                details,
            ));
        }

        Ok(tree)
    }

    fn insert_leaf(&mut self, test: &DiscoveredTest, next_id: &mut u64) {
        let segments = test.full_name.segments();
        let mut node = self.root_mut();
        for (i, segment) in segments.iter().enumerate() {
            let last = i + 1 == segments.len();
            let id = *next_id;
            let children = node
                .children
                .get_or_insert_with(IndexMap::new);
            let entry = children.entry(segment.clone()).or_insert_with(|| {
                *next_id += 1;
                if last {
                    TestNode::leaf(segment.clone(), id, test)
                } else {
                    TestNode::internal(segment.clone(), id)
                }
            });
            node = entry;
        }
    }

    fn carry_over_history(&mut self, prior: &TestTree) {
        fn visit(node: &mut TestNode, path: &TestPath, prior: &TestTree) {
            if node.is_leaf() {
                if let Some(old) = prior.node(path) {
                    node.last_status = old.last_status;
                    node.last_run = old.last_run;
                }
                return;
            }
            if let Some(children) = &mut node.children {
                for child in children.values_mut() {
                    let child_path = path.child(child.name.clone());
                    visit(child, &child_path, prior);
                }
            }
        }
        let mut root = self.root.take().expect("tree root always present");
        visit(&mut root, &TestPath::default(), prior);
        self.root = Some(root);
    }

    /// Looks up a node by its full path. The empty path returns the root.
    pub fn node(&self, path: &TestPath) -> Option<&TestNode> {
        let mut node = self.root();
        for segment in path.segments() {
            node = node.children.as_ref()?.get(segment)?;
        }
        Some(node)
    }

    /// Mutable lookup by full path.
    pub fn node_mut(&mut self, path: &TestPath) -> Option<&mut TestNode> {
        let mut node = self.root_mut();
        for segment in path.segments() {
            node = node.children.as_mut()?.get_mut(segment)?;
        }
        Some(node)
    }

    /// Resolves a framework-reported identifier back to a tree path.
    pub fn find_by_report_id(
        &self,
        suite_id: &SuiteId,
        executable: &str,
        report_id: &str,
    ) -> Option<&TestPath> {
        self.report_index
            .get(&(suite_id.clone(), executable.to_owned(), report_id.to_owned()))
    }

    /// Returns the paths of all runnable leaves under `path`, in discovery
    /// order. A leaf path returns itself; an unknown path returns nothing.
    pub fn leaves_under(&self, path: &TestPath) -> Vec<TestPath> {
        fn collect(node: &TestNode, path: &TestPath, out: &mut Vec<TestPath>) {
            match &node.children {
                None => out.push(path.clone()),
                Some(children) => {
                    for child in children.values() {
                        collect(child, &path.child(child.name.clone()), out);
                    }
                }
            }
        }

        let mut out = Vec::new();
        if let Some(node) = self.node(path) {
            collect(node, path, &mut out);
        }
        out
    }

    /// Visits every node except the root, in depth-first discovery order.
    pub fn visit(&self, mut f: impl FnMut(&TestPath, &TestNode)) {
        fn walk(
            node: &TestNode,
            path: &TestPath,
            f: &mut impl FnMut(&TestPath, &TestNode),
        ) {
            if let Some(children) = &node.children {
                for child in children.values() {
                    let child_path = path.child(child.name.clone());
                    f(&child_path, child);
                    walk(child, &child_path, f);
                }
            }
        }
        walk(self.root(), &TestPath::default(), &mut f);
    }

    /// Recomputes the aggregate statuses of every ancestor of every path in
    /// `leaves`, deepest first, each affected ancestor exactly once.
    pub fn recompute_ancestors_of(&mut self, leaves: &[TestPath]) {
        let mut ancestors: Vec<TestPath> = leaves
            .iter()
            .flat_map(|leaf| leaf.ancestors())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        // Deepest first, so a parent always sees already-recomputed children.
        ancestors.sort_by_key(|path| std::cmp::Reverse(path.depth()));

        for path in ancestors {
            if let Some(node) = self.node_mut(&path) {
                node.recompute();
            }
        }
    }

    /// Recomputes every internal node in the tree, bottom-up.
    pub fn recompute_all(&mut self) {
        fn walk(node: &mut TestNode) {
            if let Some(children) = &mut node.children {
                for child in children.values_mut() {
                    walk(child);
                }
            }
            node.recompute();
        }
        walk(self.root_mut());
    }

    /// Computes status counts over the subtree at `path` (leaves only).
    pub fn stats(&self, path: &TestPath) -> TestStats {
        fn walk(node: &TestNode, stats: &mut TestStats) {
            match &node.children {
                None => stats.record(node),
                Some(children) => {
                    for child in children.values() {
                        walk(child, stats);
                    }
                }
            }
        }

        let mut stats = TestStats::default();
        if let Some(node) = self.node(path) {
            walk(node, &mut stats);
        }
        stats
    }

    /// Restores a leaf or internal node at `path`, used when loading
    /// persisted state. Parents must be inserted before their children.
    pub(crate) fn restore_node(&mut self, path: &TestPath, node: TestNode) {
        debug_assert!(!path.is_root());
        if let (Some(suite_id), Some(report_id), Some(location)) =
            (&node.suite_id, &node.report_id, &node.location)
        {
            self.report_index.insert(
                (suite_id.clone(), location.executable.clone(), report_id.clone()),
                path.clone(),
            );
        }
        let Some(parent) = self.node_mut(&path.parent().expect("non-root path has a parent"))
        else {
            return;
        };
        if let Some(children) = &mut parent.children {
            children.insert(node.name.clone(), node);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discovered(full_name: &str, suite: &str, executable: &str, id: &str) -> DiscoveredTest {
        DiscoveredTest {
            full_name: TestPath::from_name(full_name),
            suite_id: SuiteId::new(suite),
            run_id: id.to_owned(),
            report_id: id.to_owned(),
            location: TestLocation {
                executable: executable.to_owned(),
                file: "tests/main.cpp".into(),
                line: 1,
            },
        }
    }

    fn sample_tree() -> TestTree {
        TestTree::from_discovered(
            &[
                discovered("a/x", "s1", "a.exe", "x"),
                discovered("a/y", "s1", "a.exe", "y"),
                discovered("b/z", "s1", "b.exe", "z"),
            ],
            &TestTree::new(),
        )
        .unwrap()
    }

    fn set_status(tree: &mut TestTree, path: &str, status: TestStatus) {
        let path = TestPath::from_name(path);
        tree.node_mut(&path).unwrap().last_status = status;
        tree.recompute_ancestors_of(&[path]);
    }

    #[test]
    fn aggregation_is_max_over_children() {
        let mut tree = sample_tree();
        set_status(&mut tree, "a/x", TestStatus::Passed);
        set_status(&mut tree, "a/y", TestStatus::Failed);
        set_status(&mut tree, "b/z", TestStatus::Skipped);

        let status_of = |tree: &TestTree, name: &str| {
            tree.node(&TestPath::from_name(name)).unwrap().last_status
        };
        assert_eq!(status_of(&tree, "a"), TestStatus::Failed);
        assert_eq!(status_of(&tree, "b"), TestStatus::Skipped);
        assert_eq!(status_of(&tree, ""), TestStatus::Failed);

        set_status(&mut tree, "b/z", TestStatus::Failed);
        assert_eq!(status_of(&tree, "b"), TestStatus::Failed);
        assert_eq!(status_of(&tree, ""), TestStatus::Failed);
    }

    #[test]
    fn aggregation_holds_at_depth() {
        let mut tree = TestTree::from_discovered(
            &[
                discovered("p/q/r/s/deep", "s1", "deep.exe", "deep"),
                discovered("p/q/r/s/other", "s1", "deep.exe", "other"),
            ],
            &TestTree::new(),
        )
        .unwrap();

        set_status(&mut tree, "p/q/r/s/deep", TestStatus::Crashed);
        for prefix in ["p/q/r/s", "p/q/r", "p/q", "p", ""] {
            assert_eq!(
                tree.node(&TestPath::from_name(prefix)).unwrap().last_status,
                TestStatus::Crashed,
                "at {prefix:?}"
            );
        }
    }

    #[test]
    fn run_status_aggregates_independently() {
        let mut tree = sample_tree();
        let path = TestPath::from_name("a/y");
        tree.node_mut(&path).unwrap().run_status = RunStatus::Running;
        tree.recompute_ancestors_of(&[path]);

        let root = tree.node(&TestPath::default()).unwrap();
        assert_eq!(root.run_status, RunStatus::Running);
        assert_eq!(root.last_status, TestStatus::NotRun);
    }

    #[test]
    fn rediscovery_preserves_history() {
        let mut tree = sample_tree();
        let when = Utc::now();
        {
            let node = tree.node_mut(&TestPath::from_name("a/x")).unwrap();
            node.last_status = TestStatus::Failed;
            node.last_run = Some(when);
        }

        let rediscovered = TestTree::from_discovered(
            &[
                discovered("a/x", "s1", "a.exe", "x"),
                discovered("a/new", "s1", "a.exe", "new"),
            ],
            &tree,
        )
        .unwrap();

        let kept = rediscovered.node(&TestPath::from_name("a/x")).unwrap();
        assert_eq!(kept.last_status, TestStatus::Failed);
        assert_eq!(kept.last_run, Some(when));

        let fresh = rediscovered.node(&TestPath::from_name("a/new")).unwrap();
        assert_eq!(fresh.last_status, TestStatus::NotRun);
        assert_eq!(fresh.last_run, None);

        // Removed tests are gone, and the parent aggregate follows.
        assert!(rediscovered.node(&TestPath::from_name("a/y")).is_none());
        assert_eq!(
            rediscovered.node(&TestPath::from_name("a")).unwrap().last_status,
            TestStatus::Failed
        );
    }

    #[test]
    fn duplicate_report_id_is_a_discovery_error() {
        let err = TestTree::from_discovered(
            &[
                discovered("a/x", "s1", "a.exe", "same"),
                discovered("a/y", "s1", "a.exe", "same"),
            ],
            &TestTree::new(),
        )
        .unwrap_err();
        assert_eq!(err.details().len(), 1);
        assert!(err.details()[0].contains("same"), "{:?}", err.details());
    }

    #[test]
    fn path_through_an_existing_test_is_a_discovery_error() {
        let err = TestTree::from_discovered(
            &[
                discovered("a", "s1", "a.exe", "a"),
                discovered("a/x", "s1", "a.exe", "x"),
            ],
            &TestTree::new(),
        )
        .unwrap_err();
        // `a` is a test, not a group; `a/x` must not silently convert it.
        assert_eq!(err.details().len(), 1);
        assert!(err.details()[0].contains("a/x"), "{:?}", err.details());
    }

    #[test]
    fn report_id_index_resolves_leaves() {
        let tree = sample_tree();
        assert_eq!(
            tree.find_by_report_id(&SuiteId::new("s1"), "a.exe", "y"),
            Some(&TestPath::from_name("a/y"))
        );
        assert_eq!(tree.find_by_report_id(&SuiteId::new("s1"), "a.exe", "nope"), None);
        assert_eq!(tree.find_by_report_id(&SuiteId::new("other"), "a.exe", "y"), None);
    }

    #[test]
    fn leaves_under_expands_internal_paths() {
        let tree = sample_tree();
        assert_eq!(
            tree.leaves_under(&TestPath::from_name("a")),
            vec![TestPath::from_name("a/x"), TestPath::from_name("a/y")]
        );
        assert_eq!(
            tree.leaves_under(&TestPath::from_name("a/x")),
            vec![TestPath::from_name("a/x")]
        );
        assert_eq!(tree.leaves_under(&TestPath::default()).len(), 3);
        assert!(tree.leaves_under(&TestPath::from_name("missing")).is_empty());
    }

    #[test]
    fn stats_count_leaves_only() {
        let mut tree = sample_tree();
        set_status(&mut tree, "a/x", TestStatus::Passed);
        set_status(&mut tree, "a/y", TestStatus::Failed);

        let stats = tree.stats(&TestPath::default());
        assert_eq!(stats.total, 3);
        assert_eq!(stats.passed, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.not_run, 1);
    }
}
