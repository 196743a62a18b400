// Copyright (c) The testscout Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Run and discovery orchestration across framework integrations.
//!
//! A [`TestFramework`] is the seam to one configured test tool: it knows how
//! to list that tool's tests and how to run a selected subset of one
//! executable's tests. The [`TestManager`] owns the set of configured suites
//! and drives them: discovery fans out over every suite and merges, a run
//! expands the requested paths to leaves, groups them by suite and
//! executable, and spawns one engine job per suite so independent frameworks
//! execute concurrently while each framework stays serial on its own queue.

use crate::{
    decode::EventSink,
    engine::TaskEngine,
    errors::{DiscoveryError, FrameworkError, JobError, SessionError},
    list::{DiscoveredTest, SuiteId, TestPath},
    process::StopEvent,
    session::TestSession,
};
use indexmap::IndexMap;
use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};
use tracing::{error, info};

/// Everything a framework needs to execute one run of one suite.
pub struct RunRequest {
    /// Run ids grouped per executable, in discovery order.
    pub executables: IndexMap<String, Vec<String>>,

    /// Where decoded lifecycle events go.
    pub sink: Arc<dyn EventSink>,

    /// The run's cancellation signal; streamed jobs must poll it.
    pub stop: StopEvent,
}

/// One configured test tool integration.
///
/// Implementations translate between the coordinator's model and a concrete
/// tool's command lines and output protocol; the core never constructs
/// framework-specific invocations itself.
pub trait TestFramework: Send + Sync {
    /// The suite this integration reports under.
    fn suite_id(&self) -> &SuiteId;

    /// Lists this suite's tests. Runs on the caller's schedule; integrations
    /// put their subprocess work on their own engine queue.
    fn discover(&self, engine: &TaskEngine) -> Result<Vec<DiscoveredTest>, DiscoveryError>;

    /// Runs the requested tests, streaming decoded events into the request's
    /// sink. Returns once every requested executable has been processed or
    /// the stop event ended the run early.
    fn run(&self, engine: &TaskEngine, request: RunRequest) -> Result<(), JobError>;
}

type FrameworkFactory =
    Box<dyn Fn(SuiteId, &serde_json::Value) -> Result<Box<dyn TestFramework>, FrameworkError> + Send + Sync>;

/// Explicit table of framework factories, keyed by the `type` name used in
/// suite configuration.
///
/// Built once at startup by the embedding host and handed to whoever parses
/// suite settings; there is no process-global registration.
#[derive(Default)]
pub struct FrameworkRegistry {
    factories: HashMap<String, FrameworkFactory>,
}

impl FrameworkRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a factory under `type_name`, replacing any previous one.
    pub fn register<F>(&mut self, type_name: impl Into<String>, factory: F)
    where
        F: Fn(SuiteId, &serde_json::Value) -> Result<Box<dyn TestFramework>, FrameworkError>
            + Send
            + Sync
            + 'static,
    {
        self.factories.insert(type_name.into(), Box::new(factory));
    }

    /// Builds a framework of `type_name` for `suite_id` from its settings.
    pub fn create(
        &self,
        type_name: &str,
        suite_id: SuiteId,
        settings: &serde_json::Value,
    ) -> Result<Box<dyn TestFramework>, FrameworkError> {
        let factory = self
            .factories
            .get(type_name)
            .ok_or_else(|| FrameworkError::UnknownType(type_name.to_owned()))?;
        factory(suite_id, settings)
    }

    /// The registered type names.
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

/// Drives discovery and runs over the configured suites.
pub struct TestManager {
    engine: Arc<TaskEngine>,
    session: Arc<TestSession>,
    suites: Mutex<IndexMap<SuiteId, Arc<dyn TestFramework>>>,
}

impl TestManager {
    /// Creates a manager over `session` executing on `engine`.
    pub fn new(engine: Arc<TaskEngine>, session: Arc<TestSession>) -> Self {
        Self {
            engine,
            session,
            suites: Mutex::new(IndexMap::new()),
        }
    }

    /// The session this manager mutates.
    pub fn session(&self) -> &Arc<TestSession> {
        &self.session
    }

    /// Adds or replaces a suite.
    pub fn add_suite(&self, framework: Arc<dyn TestFramework>) {
        let mut suites = self.lock_suites();
        suites.insert(framework.suite_id().clone(), framework);
    }

    /// Removes a suite. Its tests disappear at the next discovery.
    pub fn remove_suite(&self, suite_id: &SuiteId) {
        self.lock_suites().shift_remove(suite_id);
    }

    /// Runs discovery over every suite and replaces the session's tree with
    /// the merged result.
    ///
    /// One suite failing does not hide the others: successful suites are
    /// applied to the session either way, and the per-suite failures come
    /// back aggregated into a single [`DiscoveryError`].
    pub fn discover_all(&self) -> Result<(), SessionError> {
        let suites: Vec<Arc<dyn TestFramework>> =
            self.lock_suites().values().cloned().collect();

        let mut merged = Vec::new();
        let mut failures = Vec::new();
        for suite in &suites {
            match suite.discover(&self.engine) {
                Ok(tests) => {
                    info!(suite = %suite.suite_id(), tests = tests.len(), "discovery finished");
                    merged.extend(tests);
                }
                Err(error) => {
                    error!(suite = %suite.suite_id(), %error, "discovery failed");
                    failures.push(format!("{}: {error}", suite.suite_id()));
                }
            }
        }

        self.session.notify_discovered_tests(&merged)?;

        if !failures.is_empty() {
            return Err(DiscoveryError::with_details(
                "discovery failed for some suites",
                failures,
            )
            .into());
        }
        Ok(())
    }

    /// Starts an asynchronous run of every leaf under the given paths.
    ///
    /// One engine job is spawned per involved suite; a failing suite is
    /// logged and the rest continue. Run state is cleared when the last
    /// suite's job completes. Returns without waiting for results.
    pub fn start_run(&self, paths: &[TestPath]) -> Result<(), SessionError> {
        let leaves = self.expand_to_leaves(paths);
        let grouped = self.group_by_suite(&leaves);
        let stop = self.session.notify_run_started(&leaves)?;

        if grouped.is_empty() {
            self.session.notify_run_finished();
            return Ok(());
        }

        let remaining = Arc::new(AtomicUsize::new(grouped.len()));
        let suites = self.lock_suites();
        for (suite_id, executables) in grouped {
            let Some(framework) = suites.get(&suite_id).cloned() else {
                // Tree entries can outlive their suite configuration.
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    self.session.notify_run_finished();
                }
                continue;
            };

            let request = RunRequest {
                executables,
                sink: self.session.clone(),
                stop: stop.clone(),
            };
            let engine = self.engine.clone();
            let session = self.session.clone();
            let remaining = remaining.clone();
            let job_suite = suite_id.clone();
            self.engine.run_async(
                suite_id.as_str(),
                &format!("run suite {suite_id}"),
                move || framework.run(&engine, request),
                move |result| {
                    if let Err(error) = result {
                        error!(suite = %job_suite, %error, "suite run failed");
                    }
                    if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                        session.notify_run_finished();
                    }
                },
            );
        }
        Ok(())
    }

    /// Asks the active run, if any, to stop.
    pub fn stop_run(&self) {
        self.session.stop();
    }

    fn lock_suites(&self) -> std::sync::MutexGuard<'_, IndexMap<SuiteId, Arc<dyn TestFramework>>> {
        self.suites.lock().expect("suite table lock poisoned")
    }

    /// Expands requested paths to their descendant leaves, deduplicated,
    /// preserving discovery order per request.
    fn expand_to_leaves(&self, paths: &[TestPath]) -> Vec<TestPath> {
        let mut seen = std::collections::BTreeSet::new();
        let mut leaves = Vec::new();
        for path in paths {
            for leaf in self.session.leaves_under(path) {
                if seen.insert(leaf.clone()) {
                    leaves.push(leaf);
                }
            }
        }
        leaves
    }

    /// Groups leaves as `suite → executable → [run_id]`.
    fn group_by_suite(&self, leaves: &[TestPath]) -> IndexMap<SuiteId, IndexMap<String, Vec<String>>> {
        let tree = self.session.test_list();
        let mut grouped: IndexMap<SuiteId, IndexMap<String, Vec<String>>> = IndexMap::new();
        for leaf in leaves {
            let Some(node) = tree.node(leaf) else { continue };
            let (Some(suite_id), Some(run_id), Some(location)) =
                (&node.suite_id, &node.run_id, &node.location)
            else {
                continue;
            };
            grouped
                .entry(suite_id.clone())
                .or_default()
                .entry(location.executable.clone())
                .or_default()
                .push(run_id.clone());
        }
        grouped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        list::{RunStatus, TestLocation, TestStatus},
        session::{RefreshNotifier, SessionOptions},
        store::TestStore,
    };
    use camino::Utf8Path;
    use camino_tempfile::Utf8TempDir;
    use pretty_assertions::assert_eq;
    use std::time::{Duration, Instant};

    struct NullNotifier;
    impl RefreshNotifier for NullNotifier {
        fn refresh(&self, _store: &Utf8Path, _hints: &[TestPath]) {}
    }

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

    /// A scripted framework: a fixed discovery result, and a run that reports
    /// every requested test as passed while recording what was requested.
    struct FakeFramework {
        suite_id: SuiteId,
        tests: Vec<DiscoveredTest>,
        discover_error: Option<String>,
        requests: Mutex<Vec<IndexMap<String, Vec<String>>>>,
    }

    impl FakeFramework {
        fn new(suite: &str, tests: Vec<DiscoveredTest>) -> Arc<Self> {
            Arc::new(Self {
                suite_id: SuiteId::new(suite),
                tests,
                discover_error: None,
                requests: Mutex::new(Vec::new()),
            })
        }

        fn failing(suite: &str, message: &str) -> Arc<Self> {
            Arc::new(Self {
                suite_id: SuiteId::new(suite),
                tests: Vec::new(),
                discover_error: Some(message.to_owned()),
                requests: Mutex::new(Vec::new()),
            })
        }
    }

    impl TestFramework for FakeFramework {
        fn suite_id(&self) -> &SuiteId {
            &self.suite_id
        }

        fn discover(&self, _engine: &TaskEngine) -> Result<Vec<DiscoveredTest>, DiscoveryError> {
            match &self.discover_error {
                Some(message) => Err(DiscoveryError::new(message.clone())),
                None => Ok(self.tests.clone()),
            }
        }

        fn run(&self, _engine: &TaskEngine, request: RunRequest) -> Result<(), JobError> {
            self.requests.lock().unwrap().push(request.executables.clone());
            for (executable, run_ids) in &request.executables {
                for run_id in run_ids {
                    let Some(path) = request.sink.resolve(&self.suite_id, executable, run_id)
                    else {
                        continue;
                    };
                    request.sink.test_started(&path);
                    request.sink.test_finished(&path, TestStatus::Passed);
                }
            }
            Ok(())
        }
    }

    fn manager() -> (TestManager, Utf8TempDir) {
        let dir = Utf8TempDir::new().unwrap();
        let session = TestSession::open(
            TestStore::new(dir.path()).unwrap(),
            Box::new(NullNotifier),
            SessionOptions {
                commit_interval: Duration::ZERO,
                defer_finish: false,
            },
        )
        .unwrap();
        (
            TestManager::new(Arc::new(TaskEngine::new()), Arc::new(session)),
            dir,
        )
    }

    fn wait_until_idle(manager: &TestManager) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while manager.session().is_running() {
            assert!(Instant::now() < deadline, "run never finished");
            std::thread::sleep(Duration::from_millis(10));
        }
    }

    #[test]
    fn discover_all_merges_suites() {
        let (manager, _dir) = manager();
        manager.add_suite(FakeFramework::new(
            "s1",
            vec![discovered("a/x", "s1", "a.exe", "x")],
        ));
        manager.add_suite(FakeFramework::new(
            "s2",
            vec![discovered("b/y", "s2", "b.exe", "y")],
        ));

        manager.discover_all().unwrap();
        assert_eq!(
            manager.session().leaves_under(&TestPath::default()),
            vec![TestPath::from_name("a/x"), TestPath::from_name("b/y")]
        );
    }

    #[test]
    fn discover_all_keeps_successes_and_aggregates_failures() {
        let (manager, _dir) = manager();
        manager.add_suite(FakeFramework::new(
            "good",
            vec![discovered("a/x", "good", "a.exe", "x")],
        ));
        manager.add_suite(FakeFramework::failing("bad", "listing binary missing"));

        let err = manager.discover_all().unwrap_err();
        match err {
            SessionError::Discovery(discovery) => {
                assert_eq!(discovery.details().len(), 1);
                assert!(discovery.details()[0].contains("bad"));
            }
            other => panic!("expected discovery error, got {other:?}"),
        }

        // The good suite's tests made it into the session anyway.
        assert_eq!(
            manager.session().leaves_under(&TestPath::default()),
            vec![TestPath::from_name("a/x")]
        );
    }

    #[test]
    fn run_groups_by_suite_and_executable() {
        let (manager, _dir) = manager();
        let s1 = FakeFramework::new(
            "s1",
            vec![
                discovered("a/x", "s1", "a.exe", "x"),
                discovered("a/y", "s1", "a.exe", "y"),
                discovered("b/z", "s1", "b.exe", "z"),
            ],
        );
        let s2 = FakeFramework::new("s2", vec![discovered("c/w", "s2", "c.exe", "w")]);
        manager.add_suite(s1.clone());
        manager.add_suite(s2.clone());
        manager.discover_all().unwrap();

        manager.start_run(&[TestPath::default()]).unwrap();
        wait_until_idle(&manager);

        let s1_requests = s1.requests.lock().unwrap();
        assert_eq!(s1_requests.len(), 1);
        assert_eq!(
            s1_requests[0],
            IndexMap::from([
                ("a.exe".to_owned(), vec!["x".to_owned(), "y".to_owned()]),
                ("b.exe".to_owned(), vec!["z".to_owned()]),
            ])
        );
        assert_eq!(s2.requests.lock().unwrap().len(), 1);

        let tree = manager.session().test_list();
        for name in ["a/x", "a/y", "b/z", "c/w"] {
            let node = tree.node(&TestPath::from_name(name)).unwrap();
            assert_eq!(node.last_status, TestStatus::Passed, "{name}");
            assert_eq!(node.run_status, RunStatus::NotRunning, "{name}");
        }
    }

    #[test]
    fn run_of_a_subtree_only_touches_its_leaves() {
        let (manager, _dir) = manager();
        let suite = FakeFramework::new(
            "s1",
            vec![
                discovered("a/x", "s1", "a.exe", "x"),
                discovered("b/z", "s1", "b.exe", "z"),
            ],
        );
        manager.add_suite(suite.clone());
        manager.discover_all().unwrap();

        manager.start_run(&[TestPath::from_name("a")]).unwrap();
        wait_until_idle(&manager);

        let requests = suite.requests.lock().unwrap();
        assert_eq!(
            requests[0],
            IndexMap::from([("a.exe".to_owned(), vec!["x".to_owned()])])
        );

        let tree = manager.session().test_list();
        assert_eq!(
            tree.node(&TestPath::from_name("b/z")).unwrap().last_status,
            TestStatus::NotRun
        );
    }

    #[test]
    fn run_with_no_matching_leaves_finishes_immediately() {
        let (manager, _dir) = manager();
        manager.start_run(&[TestPath::from_name("missing")]).unwrap();
        assert!(!manager.session().is_running());
    }

    #[test]
    fn second_run_rejected_while_active() {
        let (manager, _dir) = manager();

        // A framework that blocks until told to stop.
        struct BlockingFramework {
            suite_id: SuiteId,
        }
        impl TestFramework for BlockingFramework {
            fn suite_id(&self) -> &SuiteId {
                &self.suite_id
            }
            fn discover(
                &self,
                _engine: &TaskEngine,
            ) -> Result<Vec<DiscoveredTest>, DiscoveryError> {
                Ok(vec![discovered("a/x", "s1", "a.exe", "x")])
            }
            fn run(&self, _engine: &TaskEngine, request: RunRequest) -> Result<(), JobError> {
                while !request.stop.is_set() {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Ok(())
            }
        }

        manager.add_suite(Arc::new(BlockingFramework {
            suite_id: SuiteId::new("s1"),
        }));
        manager.discover_all().unwrap();
        manager.start_run(&[TestPath::default()]).unwrap();

        assert!(matches!(
            manager.start_run(&[TestPath::default()]),
            Err(SessionError::RunInProgress)
        ));
        assert!(matches!(
            manager.discover_all(),
            Err(SessionError::RunInProgress)
        ));

        manager.stop_run();
        wait_until_idle(&manager);
    }

    #[test]
    fn registry_builds_by_type_name() {
        let mut registry = FrameworkRegistry::new();
        registry.register("fake", |suite_id, settings| {
            if settings.get("broken").is_some() {
                return Err(FrameworkError::InvalidSettings("broken".to_owned()));
            }
            Ok(Box::new(FakeFrameworkByValue { suite_id }) as Box<dyn TestFramework>)
        });

        struct FakeFrameworkByValue {
            suite_id: SuiteId,
        }
        impl TestFramework for FakeFrameworkByValue {
            fn suite_id(&self) -> &SuiteId {
                &self.suite_id
            }
            fn discover(
                &self,
                _engine: &TaskEngine,
            ) -> Result<Vec<DiscoveredTest>, DiscoveryError> {
                Ok(Vec::new())
            }
            fn run(&self, _engine: &TaskEngine, _request: RunRequest) -> Result<(), JobError> {
                Ok(())
            }
        }

        let framework = registry
            .create("fake", SuiteId::new("s1"), &serde_json::json!({}))
            .unwrap();
        assert_eq!(framework.suite_id(), &SuiteId::new("s1"));

        assert!(matches!(
            registry.create("nope", SuiteId::new("s1"), &serde_json::json!({})),
            Err(FrameworkError::UnknownType(_))
        ));
        assert!(matches!(
            registry.create("fake", SuiteId::new("s1"), &serde_json::json!({"broken": true})),
            Err(FrameworkError::InvalidSettings(_))
        ));
    }
}
