// Copyright (c) The testscout Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The session: the single authority over a project's test tree.
//!
//! All mutation funnels through [`TestSession`] notifications, whether the
//! source is a discovery pass or a decoder streaming results. The session
//! keeps the tree's aggregate statuses consistent after every change,
//! persists through [`TestStore`] on a debounced schedule, and tells the
//! embedding frontend when to refresh.
//!
//! Two presentation details live here because they are state, not rendering:
//! the deferred-finish smoothing that stops ancestor statuses flickering
//! between consecutive tests, and the startup healing that resolves statuses
//! left dangling by a previous session that died mid-run.

use crate::{
    decode::EventSink,
    errors::SessionError,
    list::{DiscoveredTest, RunStatus, SuiteId, TestPath, TestStatus, TestTree},
    process::StopEvent,
    store::{PersistedState, RunMetadata, TestStore},
};
use camino::Utf8Path;
use chrono::Utc;
use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Mutex,
    time::{Duration, Instant},
};
use tracing::{debug, info, warn};

/// Callback into the embedding frontend: state changed, re-read it.
///
/// `hints` are the subtrees that changed since the last refresh; an empty
/// slice means the whole tree should be re-read.
pub trait RefreshNotifier: Send + Sync {
    /// Invoked after changed state has been persisted to `store`. Called
    /// with the session lock released, so implementations may call back into
    /// the session to re-read state.
    fn refresh(&self, store: &Utf8Path, hints: &[TestPath]);
}

/// Tuning knobs for a session.
#[derive(Clone, Debug)]
pub struct SessionOptions {
    /// Minimum interval between mid-run persists and refreshes. Run and
    /// discovery boundaries always flush immediately.
    pub commit_interval: Duration,

    /// Smooths status flicker between consecutive tests: when a test
    /// finishes, its own statuses settle immediately but the ancestor
    /// recomputation is held until the next test starts or the run ends.
    /// Disable for strictly immediate aggregation.
    pub defer_finish: bool,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            commit_interval: Duration::from_millis(250),
            defer_finish: true,
        }
    }
}

struct SessionState {
    tree: TestTree,
    meta: RunMetadata,
    outputs: BTreeMap<String, String>,
    // An ancestor recompute held back by the smoothing policy, applied on
    // the next start or at run end.
    deferred_recompute: Option<TestPath>,
    pending_hints: BTreeSet<TestPath>,
    pending_full: bool,
    last_flush: Instant,
    stop_event: Option<StopEvent>,
}

/// One open session over a project's test state.
pub struct TestSession {
    store: TestStore,
    state: Mutex<SessionState>,
    notifier: Box<dyn RefreshNotifier>,
    options: SessionOptions,
}

impl TestSession {
    /// Opens a session, restoring persisted state and healing anything a
    /// previous session left dangling.
    ///
    /// If the store says a run was active, that session died mid-run: tests
    /// recorded as running crashed with it, queued tests never ran.
    pub fn open(
        store: TestStore,
        notifier: Box<dyn RefreshNotifier>,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let PersistedState {
            mut tree,
            mut meta,
            outputs,
        } = store.load()?;

        if meta.running {
            info!("previous session died mid-run; healing dangling statuses");
            heal_after_crash(&mut tree);
            meta.running = false;
            store.save(&tree, &meta, &outputs)?;
        }

        Ok(Self {
            store,
            state: Mutex::new(SessionState {
                tree,
                meta,
                outputs,
                deferred_recompute: None,
                pending_hints: BTreeSet::new(),
                pending_full: false,
                last_flush: Instant::now(),
                stop_event: None,
            }),
            notifier,
            options,
        })
    }

    /// The directory this session persists into.
    pub fn store_location(&self) -> &Utf8Path {
        self.store.location()
    }

    /// Replaces the tree with a fresh discovery result.
    ///
    /// History is carried over by full path; outputs of removed tests are
    /// dropped. Rejected while a run is active, and rejected wholesale if the
    /// discovered list carries conflicting identities.
    pub fn notify_discovered_tests(
        &self,
        tests: &[DiscoveredTest],
    ) -> Result<(), SessionError> {
        let mut state = self.lock_state();
        if state.meta.running {
            return Err(SessionError::RunInProgress);
        }

        let tree = TestTree::from_discovered(tests, &state.tree)?;
        state
            .outputs
            .retain(|name, _| tree.node(&TestPath::from_name(name)).is_some());
        state.tree = tree;
        state.meta.last_discovery_time = Some(Utc::now());
        debug!(tests = tests.len(), "discovery applied");

        state.pending_full = true;
        let pending = self.flush(&mut state, true);
        drop(state);
        self.emit_refresh(pending);
        Ok(())
    }

    /// Marks the given leaves queued and the session running.
    ///
    /// Returns the [`StopEvent`] that aborts this run; process streaming
    /// should poll it.
    pub fn notify_run_started(
        &self,
        leaves: &[TestPath],
    ) -> Result<StopEvent, SessionError> {
        let mut state = self.lock_state();
        if state.meta.running {
            return Err(SessionError::RunInProgress);
        }

        for leaf in leaves {
            if let Some(node) = state.tree.node_mut(leaf) {
                node.run_status = RunStatus::Queued;
            }
        }
        state.tree.recompute_ancestors_of(leaves);
        state.meta.running = true;
        state.deferred_recompute = None;

        let stop = StopEvent::new();
        state.stop_event = Some(stop.clone());
        info!(tests = leaves.len(), "run started");

        state.pending_hints.extend(leaves.iter().cloned());
        let pending = self.flush(&mut state, true);
        drop(state);
        self.emit_refresh(pending);
        Ok(stop)
    }

    /// Marks the run over and resolves anything the result streams left
    /// unsettled: still-running tests crashed, still-queued tests never ran.
    pub fn notify_run_finished(&self) {
        let mut state = self.lock_state();
        self.apply_deferred(&mut state);
        let settled = heal_after_crash(&mut state.tree);
        state.meta.running = false;
        state.stop_event = None;
        info!(settled = settled.len(), "run finished");

        state.pending_hints.extend(settled);
        let pending = self.flush(&mut state, true);
        drop(state);
        self.emit_refresh(pending);
    }

    /// Requests that the active run stop. Queued tests that never start are
    /// settled by [`TestSession::notify_run_finished`].
    pub fn stop(&self) {
        let state = self.lock_state();
        if let Some(stop) = &state.stop_event {
            info!("stop requested");
            stop.set();
        }
    }

    /// A test began executing. Its previous captured output is discarded.
    pub fn notify_test_started(&self, path: &TestPath) {
        let mut state = self.lock_state();
        self.apply_deferred(&mut state);

        state.outputs.remove(&path.to_string());
        if let Some(node) = state.tree.node_mut(path) {
            node.run_status = RunStatus::Running;
            node.last_run = Some(Utc::now());
        }
        state.tree.recompute_ancestors_of(std::slice::from_ref(path));

        state.pending_hints.insert(path.clone());
        let pending = self.flush(&mut state, false);
        drop(state);
        self.emit_refresh(pending);
    }

    /// A test produced output; appended verbatim to its captured output.
    pub fn notify_test_output(&self, path: &TestPath, text: &str) {
        let mut state = self.lock_state();
        state
            .outputs
            .entry(path.to_string())
            .or_default()
            .push_str(text);
        let pending = self.flush(&mut state, false);
        drop(state);
        self.emit_refresh(pending);
    }

    /// A test finished. Its own statuses settle immediately; under the
    /// smoothing policy the ancestor recomputation is held until the next
    /// start or run end, so shared ancestors do not flicker out of the
    /// running state between consecutive tests.
    pub fn notify_test_finished(&self, path: &TestPath, status: TestStatus) {
        let mut state = self.lock_state();
        self.apply_deferred(&mut state);
        if let Some(node) = state.tree.node_mut(path) {
            node.last_status = status;
            node.run_status = RunStatus::NotRunning;
        }
        if self.options.defer_finish {
            state.deferred_recompute = Some(path.clone());
        } else {
            state.tree.recompute_ancestors_of(std::slice::from_ref(path));
        }
        state.pending_hints.insert(path.clone());
        let pending = self.flush(&mut state, false);
        drop(state);
        self.emit_refresh(pending);
    }

    /// Resolves a framework-reported id to a tree path.
    pub fn find_test_by_report_id(
        &self,
        suite_id: &SuiteId,
        executable: &str,
        report_id: &str,
    ) -> Option<TestPath> {
        self.lock_state()
            .tree
            .find_by_report_id(suite_id, executable, report_id)
            .cloned()
    }

    /// Returns a snapshot of the current tree.
    pub fn test_list(&self) -> TestTree {
        self.lock_state().tree.clone()
    }

    /// Returns the captured output of one test, if any.
    pub fn test_output(&self, path: &TestPath) -> Option<String> {
        self.lock_state().outputs.get(&path.to_string()).cloned()
    }

    /// Paths of all runnable leaves under `path`.
    pub fn leaves_under(&self, path: &TestPath) -> Vec<TestPath> {
        self.lock_state().tree.leaves_under(path)
    }

    /// True while a run is active.
    pub fn is_running(&self) -> bool {
        self.lock_state().meta.running
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state.lock().expect("session state lock poisoned")
    }

    fn apply_deferred(&self, state: &mut SessionState) {
        if let Some(path) = state.deferred_recompute.take() {
            state.tree.recompute_ancestors_of(std::slice::from_ref(&path));
            state.pending_hints.insert(path);
        }
    }

    /// Persists pending changes and returns the refresh to send once the
    /// state lock is released. Forced flushes happen at run and discovery
    /// boundaries; otherwise changes are batched under the commit interval.
    /// Persist failures on the debounced path are logged, not raised, so a
    /// transient disk error cannot take down a streaming run.
    fn flush(&self, state: &mut SessionState, force: bool) -> Option<Vec<TestPath>> {
        if !force && state.last_flush.elapsed() < self.options.commit_interval {
            return None;
        }
        if let Err(error) = self.store.save(&state.tree, &state.meta, &state.outputs) {
            warn!(%error, "failed to persist session state");
        }
        state.last_flush = Instant::now();

        if state.pending_full {
            state.pending_full = false;
            state.pending_hints.clear();
            // Full refresh is signalled with no hints.
            Some(Vec::new())
        } else if state.pending_hints.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut state.pending_hints).into_iter().collect())
        }
    }

    /// Sends a refresh produced by a flush. Must be called with the state
    /// lock released: notifiers are allowed to read the session from inside
    /// the callback.
    fn emit_refresh(&self, pending: Option<Vec<TestPath>>) {
        if let Some(hints) = pending {
            self.notifier.refresh(self.store.location(), &hints);
        }
    }
}

/// Settles every leaf still marked as part of a run: running leaves crashed,
/// queued leaves never got to run. Returns the settled paths.
fn heal_after_crash(tree: &mut TestTree) -> Vec<TestPath> {
    let mut dangling = Vec::new();
    tree.visit(|path, node| {
        if node.is_leaf() && node.run_status != RunStatus::NotRunning {
            dangling.push((path.clone(), node.run_status));
        }
    });
    for (path, run_status) in &dangling {
        if let Some(node) = tree.node_mut(path) {
            node.last_status = match run_status {
                RunStatus::Running => TestStatus::Crashed,
                RunStatus::Queued => TestStatus::Stopped,
                RunStatus::NotRunning => unreachable!(),
            };
            node.run_status = RunStatus::NotRunning;
        }
    }
    if !dangling.is_empty() {
        tree.recompute_all();
    }
    dangling.into_iter().map(|(path, _)| path).collect()
}

impl EventSink for TestSession {
    fn resolve(
        &self,
        suite_id: &SuiteId,
        executable: &str,
        report_id: &str,
    ) -> Option<TestPath> {
        self.find_test_by_report_id(suite_id, executable, report_id)
    }

    fn test_started(&self, path: &TestPath) {
        self.notify_test_started(path);
    }

    fn test_output(&self, path: &TestPath, text: &str) {
        self.notify_test_output(path, text);
    }

    fn test_finished(&self, path: &TestPath, status: TestStatus) {
        self.notify_test_finished(path, status);
    }
}
