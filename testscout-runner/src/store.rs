// Copyright (c) The testscout Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Durable persistence of a session's tree, run metadata and test outputs.
//!
//! The store is a directory of three JSON files:
//!
//! * `tests.json` -- every tree node keyed by its full path, leaves and
//!   internal nodes alike, so the tree can be restored without rediscovery.
//! * `meta.json` -- run-level metadata, including the `running` flag used to
//!   detect a session that died mid-run.
//! * `outputs.json` -- captured output per test, keyed by full path.
//!
//! Writes go through [`atomicwrites`] so a crash mid-write leaves the
//! previous file intact rather than a torn one.

use crate::{
    errors::StoreError,
    list::{RunStatus, SuiteId, TestLocation, TestNode, TestPath, TestStatus, TestTree},
};
use atomicwrites::{AtomicFile, OverwriteBehavior};
use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

const TESTS_FILE: &str = "tests.json";
const META_FILE: &str = "meta.json";
const OUTPUTS_FILE: &str = "outputs.json";

/// One persisted tree node.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct TestRecord {
    /// Sibling-ordering id from the discovery that produced the node.
    pub discovery_id: u64,
    /// Owning suite; `None` for internal nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suite_id: Option<SuiteId>,
    /// Framework run id; `None` for internal nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    /// Framework report id; `None` for internal nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_id: Option<String>,
    /// Source location; `None` for internal nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<TestLocation>,
    /// Outcome of the most recent execution.
    pub last_status: TestStatus,
    /// Run-participation state at the time of the write.
    pub run_status: RunStatus,
    /// Timestamp of the last execution start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,
    /// True for runnable leaves, false for grouping nodes.
    pub leaf: bool,
}

/// Run-level metadata persisted alongside the tree.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct RunMetadata {
    /// When discovery last completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_discovery_time: Option<DateTime<Utc>>,
    /// True while a run is active. Still true at load time means the previous
    /// session died mid-run.
    #[serde(default)]
    pub running: bool,
}

/// Everything a session restores at startup.
#[derive(Debug, Default)]
pub struct PersistedState {
    /// The restored tree.
    pub tree: TestTree,
    /// Run metadata as last written.
    pub meta: RunMetadata,
    /// Captured outputs keyed by full test path.
    pub outputs: BTreeMap<String, String>,
}

/// A directory-backed store for one session.
#[derive(Debug)]
pub struct TestStore {
    location: Utf8PathBuf,
}

impl TestStore {
    /// Opens a store at `location`, creating the directory if needed.
    pub fn new(location: impl Into<Utf8PathBuf>) -> Result<Self, StoreError> {
        let location = location.into();
        std::fs::create_dir_all(&location).map_err(|error| StoreError::CreateDir {
            path: location.clone(),
            error,
        })?;
        Ok(Self { location })
    }

    /// The directory the store writes into.
    pub fn location(&self) -> &Utf8Path {
        &self.location
    }

    /// Loads the persisted state. Missing files load as empty defaults, so a
    /// fresh directory yields an empty tree rather than an error.
    pub fn load(&self) -> Result<PersistedState, StoreError> {
        let records: BTreeMap<String, TestRecord> =
            self.read_json(TESTS_FILE)?.unwrap_or_default();
        let meta: RunMetadata = self.read_json(META_FILE)?.unwrap_or_default();
        let outputs: BTreeMap<String, String> =
            self.read_json(OUTPUTS_FILE)?.unwrap_or_default();

        debug!(
            nodes = records.len(),
            outputs = outputs.len(),
            store = %self.location,
            "loaded session state"
        );

        Ok(PersistedState {
            tree: restore_tree(records),
            meta,
            outputs,
        })
    }

    /// Writes the tree, metadata and outputs. Each file is written atomically.
    pub fn save(
        &self,
        tree: &TestTree,
        meta: &RunMetadata,
        outputs: &BTreeMap<String, String>,
    ) -> Result<(), StoreError> {
        let mut records = BTreeMap::new();
        tree.visit(|path, node| {
            records.insert(
                path.to_string(),
                TestRecord {
                    discovery_id: node.discovery_id,
                    suite_id: node.suite_id.clone(),
                    run_id: node.run_id.clone(),
                    report_id: node.report_id.clone(),
                    location: node.location.clone(),
                    last_status: node.last_status,
                    run_status: node.run_status,
                    last_run: node.last_run,
                    leaf: node.is_leaf(),
                },
            );
        });

        self.write_json(TESTS_FILE, &records)?;
        self.write_json(META_FILE, meta)?;
        self.write_json(OUTPUTS_FILE, outputs)?;
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(&self, file: &str) -> Result<Option<T>, StoreError> {
        let path = self.location.join(file);
        let contents = match std::fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(StoreError::Read { path, error }),
        };
        serde_json::from_str(&contents)
            .map(Some)
            .map_err(|error| StoreError::Parse { path, error })
    }

    fn write_json<T: Serialize>(&self, file: &str, value: &T) -> Result<(), StoreError> {
        let path = self.location.join(file);
        let file = AtomicFile::new(&path, OverwriteBehavior::AllowOverwrite);
        file.write(|f| serde_json::to_writer_pretty(f, value))
            .map_err(|error| StoreError::Write {
                path,
                error: match error {
                    atomicwrites::Error::Internal(error) => error,
                    atomicwrites::Error::User(error) => error.into(),
                },
            })
    }
}

/// Rebuilds a [`TestTree`] from persisted records.
///
/// Records are inserted parents-first (ancestors have shorter paths) and
/// siblings in discovery order, so the restored tree iterates in the same
/// order it was discovered in.
fn restore_tree(records: BTreeMap<String, TestRecord>) -> TestTree {
    let mut ordered: Vec<(TestPath, TestRecord)> = records
        .into_iter()
        .map(|(name, record)| (TestPath::from_name(&name), record))
        .collect();
    ordered.sort_by_key(|(path, record)| (path.depth(), record.discovery_id));

    let mut tree = TestTree::new();
    for (path, record) in ordered {
        if path.is_root() {
            continue;
        }
        let Some(name) = path.name() else { continue };
        let node = TestNode {
            name: name.to_owned(),
            discovery_id: record.discovery_id,
            suite_id: record.suite_id,
            run_id: record.run_id,
            report_id: record.report_id,
            location: record.location,
            last_status: record.last_status,
            run_status: record.run_status,
            last_run: record.last_run,
            children: if record.leaf {
                None
            } else {
                Some(IndexMap::new())
            },
        };
        tree.restore_node(&path, node);
    }
    tree
}
