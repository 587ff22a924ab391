//! Shared test doubles: an in-memory dataset service that materializes
//! mountpoints on the local filesystem, and a scriptable low-level runtime

#![allow(dead_code)]

use oci_model::runtime::RuntimeState;
use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use zdataset::{
    DatasetError, DatasetKind, DatasetService, PropertyValue, ZfsClone, ZfsCreate, ZfsSnapshot,
};
use zoci::config::ZociConfig;
use zoci::image::Distribution;
use zoci::runtime::{ContainerRuntime, RuncError, Runtime};
use zoci::util::{CountingEntropy, FixedClock};

pub const GRAPH_DATASET: &str = "zroot/zoci";

fn failure(message: &str) -> DatasetError {
    DatasetError::CommandFailure {
        code: Some(1),
        stderr: message.to_string(),
    }
}

#[derive(Debug, Default)]
struct MemDataset {
    mountpoint: Option<PathBuf>,
    readonly: bool,
    origin: Option<String>,
    props: BTreeMap<String, String>,
}

#[derive(Debug)]
struct MemSnapshot {
    dataset: String,
    tree: Option<PathBuf>,
}

#[derive(Debug, Default)]
struct MemState {
    datasets: BTreeMap<String, MemDataset>,
    snapshots: BTreeMap<String, MemSnapshot>,
}

/// An in-memory stand-in for the ZFS adapter. Datasets are table entries;
/// mounted datasets are real directories, and snapshot/clone copy trees
/// around so copy-on-write semantics hold for the tests.
#[derive(Clone)]
pub struct MemoryDatasetService {
    state: Rc<RefCell<MemState>>,
    snapshot_store: PathBuf,
}

impl MemoryDatasetService {
    pub fn new(scratch: &Path) -> MemoryDatasetService {
        let snapshot_store = scratch.join(".snapshot-store");
        std::fs::create_dir_all(&snapshot_store).unwrap();
        MemoryDatasetService {
            state: Rc::new(RefCell::new(MemState::default())),
            snapshot_store,
        }
    }

    pub fn dataset_names(&self) -> Vec<String> {
        self.state.borrow().datasets.keys().cloned().collect()
    }

    pub fn snapshot_names(&self) -> Vec<String> {
        self.state.borrow().snapshots.keys().cloned().collect()
    }

    fn snapshot_tree_dir(&self, snapshot: &str) -> PathBuf {
        self.snapshot_store
            .join(snapshot.replace('/', "_").replace('@', "+"))
    }

    fn descendants(state: &MemState, dataset: &str) -> Vec<String> {
        let prefix = format!("{dataset}/");
        state
            .datasets
            .keys()
            .filter(|name| name.starts_with(&prefix))
            .cloned()
            .collect()
    }
}

fn copy_tree(src: &Path, dst: &Path) {
    std::fs::create_dir_all(dst).unwrap();
    for entry in std::fs::read_dir(src).unwrap() {
        let entry = entry.unwrap();
        let target = dst.join(entry.file_name());
        if entry.path().is_dir() {
            copy_tree(&entry.path(), &target);
        } else {
            std::fs::copy(entry.path(), &target).unwrap();
        }
    }
}

fn clear_dir(dir: &Path) {
    if !dir.exists() {
        return;
    }
    for entry in std::fs::read_dir(dir).unwrap() {
        let entry = entry.unwrap();
        if entry.path().is_dir() {
            std::fs::remove_dir_all(entry.path()).unwrap();
        } else {
            std::fs::remove_file(entry.path()).unwrap();
        }
    }
}

impl DatasetService for MemoryDatasetService {
    fn create(&self, request: ZfsCreate) -> Result<(), DatasetError> {
        let mut state = self.state.borrow_mut();
        let name = request.dataset().to_string();
        if state.datasets.contains_key(&name) {
            return Err(failure("dataset already exists"));
        }
        if let Some((parent, _)) = name.rsplit_once('/') {
            if !state.datasets.contains_key(parent) {
                let mut ancestors = Vec::new();
                let mut current = parent.to_string();
                loop {
                    if !state.datasets.contains_key(&current) {
                        ancestors.push(current.clone());
                    }
                    match current.rsplit_once('/') {
                        Some((up, _)) => current = up.to_string(),
                        None => break,
                    }
                }
                for ancestor in ancestors {
                    state.datasets.insert(ancestor, MemDataset::default());
                }
            }
        }
        let mut dataset = MemDataset::default();
        for (key, value) in request.props() {
            match key.as_str() {
                "mountpoint" if value != "none" && value != "legacy" => {
                    let path = PathBuf::from(value);
                    std::fs::create_dir_all(&path).map_err(|_| failure("cannot mount"))?;
                    dataset.mountpoint = Some(path);
                }
                "mountpoint" => {}
                "compression" => {}
                other => {
                    dataset.props.insert(other.to_string(), value.clone());
                }
            }
        }
        state.datasets.insert(name, dataset);
        Ok(())
    }

    fn clone_from(&self, request: ZfsClone) -> Result<(), DatasetError> {
        let mut state = self.state.borrow_mut();
        let snapshot = request.snapshot().to_string();
        let target = request.target().to_string();
        let Some(stored) = state.snapshots.get(&snapshot) else {
            return Err(failure("source snapshot does not exist"));
        };
        let tree = stored.tree.clone();
        if state.datasets.contains_key(&target) {
            return Err(failure("target dataset already exists"));
        }
        let mut dataset = MemDataset {
            origin: Some(snapshot),
            ..MemDataset::default()
        };
        for (key, value) in request.props() {
            if key == "mountpoint" && value != "none" {
                let path = PathBuf::from(value);
                std::fs::create_dir_all(&path).map_err(|_| failure("cannot mount"))?;
                if let Some(tree) = tree.as_deref() {
                    if tree.exists() {
                        copy_tree(tree, &path);
                    }
                }
                dataset.mountpoint = Some(path);
            }
        }
        state.datasets.insert(target, dataset);
        Ok(())
    }

    fn snapshot(&self, request: ZfsSnapshot) -> Result<(), DatasetError> {
        let mut state = self.state.borrow_mut();
        let dataset = request.dataset().to_string();
        if !state.datasets.contains_key(&dataset) {
            return Err(failure("dataset does not exist"));
        }
        let mut targets = vec![dataset.clone()];
        if request.recursive() {
            targets.extend(Self::descendants(&state, &dataset));
        }
        for target in targets {
            let name = format!("{target}@{}", request.tag());
            if state.snapshots.contains_key(&name) {
                return Err(failure("snapshot already exists"));
            }
            let tree = match state.datasets.get(&target).and_then(|d| d.mountpoint.clone()) {
                Some(mount) => {
                    let stored = self.snapshot_tree_dir(&name);
                    copy_tree(&mount, &stored);
                    Some(stored)
                }
                None => None,
            };
            state.snapshots.insert(
                name,
                MemSnapshot {
                    dataset: target,
                    tree,
                },
            );
        }
        Ok(())
    }

    fn set_readonly(&self, dataset: &str, readonly: bool) -> Result<(), DatasetError> {
        let mut state = self.state.borrow_mut();
        match state.datasets.get_mut(dataset) {
            Some(entry) => {
                entry.readonly = readonly;
                Ok(())
            }
            None => Err(failure("dataset does not exist")),
        }
    }

    fn set_mountpoint(&self, dataset: &str, mountpoint: &Path) -> Result<(), DatasetError> {
        let mut state = self.state.borrow_mut();
        match state.datasets.get_mut(dataset) {
            Some(entry) => {
                std::fs::create_dir_all(mountpoint).map_err(|_| failure("cannot mount"))?;
                entry.mountpoint = Some(mountpoint.to_path_buf());
                Ok(())
            }
            None => Err(failure("dataset does not exist")),
        }
    }

    fn set_property(&self, dataset: &str, property: &str, value: &str) -> Result<(), DatasetError> {
        let mut state = self.state.borrow_mut();
        match state.datasets.get_mut(dataset) {
            Some(entry) => {
                entry.props.insert(property.to_string(), value.to_string());
                Ok(())
            }
            None => Err(failure("dataset does not exist")),
        }
    }

    fn get(&self, dataset: &str, property: &str) -> Result<Option<PropertyValue>, DatasetError> {
        let state = self.state.borrow();
        if let Some(entry) = state.datasets.get(dataset) {
            return Ok(match property {
                "type" => Some(PropertyValue::Text("filesystem".to_string())),
                "readonly" => Some(PropertyValue::Bool(entry.readonly)),
                "origin" => entry.origin.clone().map(PropertyValue::Text),
                "mountpoint" => match entry.mountpoint.clone() {
                    Some(path) => Some(PropertyValue::Path(path)),
                    None => Some(PropertyValue::Text("none".to_string())),
                },
                other => entry.props.get(other).cloned().map(PropertyValue::Text),
            });
        }
        if state.snapshots.contains_key(dataset) {
            return Ok(match property {
                "type" => Some(PropertyValue::Text("snapshot".to_string())),
                _ => None,
            });
        }
        Err(failure("dataset does not exist"))
    }

    fn destroy(&self, name: &str, recursive: bool, _synchronous: bool) -> Result<(), DatasetError> {
        let mut state = self.state.borrow_mut();
        if name.contains('@') {
            let (dataset, tag) = name.split_once('@').unwrap();
            let mut doomed: Vec<String> = vec![name.to_string()];
            if recursive {
                let prefix = format!("{dataset}/");
                doomed.extend(
                    state
                        .snapshots
                        .keys()
                        .filter(|snap| {
                            snap.rsplit_once('@').map(|(ds, t)| {
                                t == tag && ds.starts_with(&prefix)
                            }) == Some(true)
                        })
                        .cloned(),
                );
            }
            if !state.snapshots.contains_key(name) {
                return Err(failure("snapshot does not exist"));
            }
            for snapshot in doomed {
                let clone_exists = state
                    .datasets
                    .values()
                    .any(|entry| entry.origin.as_deref() == Some(snapshot.as_str()));
                if clone_exists {
                    return Err(failure("snapshot has dependent clones"));
                }
                if let Some(removed) = state.snapshots.remove(&snapshot) {
                    if let Some(tree) = removed.tree {
                        let _ = std::fs::remove_dir_all(tree);
                    }
                }
            }
            return Ok(());
        }

        if !state.datasets.contains_key(name) {
            return Err(failure("dataset does not exist"));
        }
        let children = Self::descendants(&state, name);
        if !children.is_empty() && !recursive {
            return Err(failure("dataset has children"));
        }
        let mut doomed = children;
        doomed.push(name.to_string());
        for dataset in doomed.iter() {
            let snapshots: Vec<String> = state
                .snapshots
                .iter()
                .filter(|(_, snap)| &snap.dataset == dataset)
                .map(|(name, _)| name.clone())
                .collect();
            for snapshot in snapshots.iter() {
                let clone_exists = state
                    .datasets
                    .values()
                    .any(|entry| entry.origin.as_deref() == Some(snapshot.as_str()));
                if clone_exists {
                    return Err(failure("dataset has dependent clones"));
                }
            }
            for snapshot in snapshots {
                state.snapshots.remove(&snapshot);
            }
            if let Some(removed) = state.datasets.remove(dataset) {
                if let Some(mount) = removed.mountpoint {
                    clear_dir(&mount);
                }
            }
        }
        Ok(())
    }

    fn send(
        &self,
        snapshot: &str,
        sink: &mut dyn Write,
        _from_snapshot: Option<&str>,
        _recursive: bool,
    ) -> Result<(), DatasetError> {
        let state = self.state.borrow();
        if !state.snapshots.contains_key(snapshot) {
            return Err(failure("snapshot does not exist"));
        }
        sink.write_all(b"ZOCISTREAM\n")
            .map_err(DatasetError::Spawn)?;
        sink.write_all(snapshot.as_bytes())
            .map_err(DatasetError::Spawn)?;
        Ok(())
    }

    fn receive(&self, _dataset: &str, _source: &mut dyn Read) -> Result<(), DatasetError> {
        Err(failure("receive is not supported by the test double"))
    }

    fn list(
        &self,
        root: &str,
        recursive: bool,
        kind: DatasetKind,
        properties: &[&str],
    ) -> Result<Vec<HashMap<String, Option<PropertyValue>>>, DatasetError> {
        let state = self.state.borrow();
        if !state.datasets.contains_key(root) {
            return Err(failure("dataset does not exist"));
        }
        let prefix = format!("{root}/");
        let mut names: Vec<String> = Vec::new();
        if matches!(kind, DatasetKind::Filesystem | DatasetKind::All) {
            names.push(root.to_string());
            if recursive {
                names.extend(
                    state
                        .datasets
                        .keys()
                        .filter(|name| name.starts_with(&prefix))
                        .cloned(),
                );
            }
        }
        if matches!(kind, DatasetKind::Snapshot | DatasetKind::All) {
            names.extend(
                state
                    .snapshots
                    .keys()
                    .filter(|name| {
                        let dataset = name.split_once('@').map(|(ds, _)| ds).unwrap_or("");
                        dataset == root || dataset.starts_with(&prefix)
                    })
                    .cloned(),
            );
        }
        names.sort();
        drop(state);

        let mut rows = Vec::with_capacity(names.len());
        for name in names {
            let mut row = HashMap::new();
            for property in properties {
                let value = if *property == "name" {
                    Some(PropertyValue::Text(name.clone()))
                } else {
                    self.get(&name, property).unwrap_or(None)
                };
                row.insert(property.to_string(), value);
            }
            rows.push(row);
        }
        Ok(rows)
    }

    fn exists(&self, name: &str) -> bool {
        let state = self.state.borrow();
        state.datasets.contains_key(name) || state.snapshots.contains_key(name)
    }
}

#[derive(Debug, Default)]
struct MockRuntimeState {
    statuses: BTreeMap<String, String>,
    calls: Vec<String>,
}

/// Scriptable stand-in for the external low-level runtime
#[derive(Clone, Default)]
pub struct MockContainerRuntime {
    state: Rc<RefCell<MockRuntimeState>>,
}

impl MockContainerRuntime {
    pub fn new() -> MockContainerRuntime {
        MockContainerRuntime::default()
    }

    pub fn set_status(&self, runtime_id: &str, status: &str) {
        self.state
            .borrow_mut()
            .statuses
            .insert(runtime_id.to_string(), status.to_string());
    }

    pub fn forget(&self, runtime_id: &str) {
        self.state.borrow_mut().statuses.remove(runtime_id);
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }
}

impl ContainerRuntime for MockContainerRuntime {
    fn create(&self, runtime_id: &str, bundle: &Path) -> Result<(), RuncError> {
        let mut state = self.state.borrow_mut();
        state
            .calls
            .push(format!("create {runtime_id} -b {}", bundle.display()));
        state
            .statuses
            .insert(runtime_id.to_string(), "created".to_string());
        Ok(())
    }

    fn start(&self, runtime_id: &str) -> Result<(), RuncError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(format!("start {runtime_id}"));
        match state.statuses.get_mut(runtime_id) {
            Some(status) => {
                *status = "running".to_string();
                Ok(())
            }
            None => Err(RuncError::CommandFailure {
                code: Some(1),
                stderr: "container does not exist".to_string(),
            }),
        }
    }

    fn delete(&self, runtime_id: &str, force: bool) -> Result<(), RuncError> {
        let mut state = self.state.borrow_mut();
        state.calls.push(format!("delete force={force} {runtime_id}"));
        let running = state.statuses.get(runtime_id).map(String::as_str) == Some("running");
        if running && !force {
            return Err(RuncError::CommandFailure {
                code: Some(1),
                stderr: "container is running".to_string(),
            });
        }
        state.statuses.remove(runtime_id);
        Ok(())
    }

    fn state(&self, runtime_id: &str) -> Result<Option<RuntimeState>, RuncError> {
        let state = self.state.borrow();
        Ok(state
            .statuses
            .get(runtime_id)
            .map(|status| RuntimeState {
                oci_version: None,
                id: runtime_id.to_string(),
                status: status.clone(),
                bundle: None,
                pid: None,
            }))
    }
}

/// A store rooted in a temp directory over the in-memory dataset service,
/// with a deterministic clock and id sequence
pub struct TestStore {
    pub root: tempfile::TempDir,
    pub handle: MemoryDatasetService,
}

impl TestStore {
    pub fn new() -> TestStore {
        let root = tempfile::tempdir().unwrap();
        let handle = MemoryDatasetService::new(root.path());
        TestStore { root, handle }
    }

    pub fn config(&self) -> ZociConfig {
        ZociConfig::rooted(self.root.path(), GRAPH_DATASET)
    }

    pub fn open_distribution(&self) -> Distribution {
        self.open_distribution_with(1_600_000_000, 1)
    }

    pub fn open_distribution_with(&self, epoch_secs: i64, first_id: u64) -> Distribution {
        Distribution::open(
            &self.config(),
            Box::new(self.handle.clone()),
            Box::new(FixedClock::at_epoch_secs(epoch_secs)),
            Box::new(CountingEntropy::starting_at(first_id)),
        )
        .unwrap()
    }

    pub fn open_runtime(&self, runner: &MockContainerRuntime) -> Runtime {
        Runtime::open(
            self.root.path(),
            Box::new(runner.clone()),
            Box::new(FixedClock::at_epoch_secs(1_600_000_000)),
            Box::new(CountingEntropy::starting_at(1000)),
        )
        .unwrap()
    }

    /// A one-file root filesystem archive: `/etc/hello` containing `hi\n`
    pub fn make_rootfs_tar(&self, name: &str) -> PathBuf {
        let stage = self.root.path().join(format!("{name}-rootfs"));
        std::fs::create_dir_all(stage.join("etc")).unwrap();
        std::fs::write(stage.join("etc/hello"), b"hi\n").unwrap();
        let tar = self.root.path().join(format!("{name}.tar"));
        zoci::util::archive::pack_dir(&stage, &tar).unwrap();
        std::fs::remove_dir_all(&stage).unwrap();
        tar
    }
}
