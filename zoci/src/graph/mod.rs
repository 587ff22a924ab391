//! Copy-on-write graph driver over a snapshot-capable dataset service
//!
//! Naming discipline on the backing store, for a chain founded by node
//! `aabbccddeeff...` (64 hex):
//!
//! ```text
//! root                      fixed driver root, never mounted
//! root/aabbccddeeff         per-chain base dataset (12-hex prefix), unmounted
//! root/aabbccddeeff/<node>  one dataset per node, mounted at <mount_root>/<node>
//! root/aabbccddeeff@<node>  recursive snapshot taken at commit
//! root/aabbccddeeff/<node>@<node>  the clone source for the node's children
//! ```

// Copyright (c) 2023 Yan Ka, Chiu.
// All rights reserved.
//
// Redistribution and use in source and binary forms, with or without
// modification, are permitted provided that the following conditions
// are met:
// 1. Redistributions of source code must retain the above copyright
//    notice, this list of conditions, and the following disclaimer,
//    without modification, immediately at the beginning of the file.
// 2. The name of the author may not be used to endorse or promote products
//    derived from this software without specific prior written permission.
//
// THIS SOFTWARE IS PROVIDED BY THE AUTHOR AND CONTRIBUTORS ``AS IS'' AND
// ANY EXPRESS OR IMPLIED WARRANTIES, INCLUDING, BUT NOT LIMITED TO, THE
// IMPLIED WARRANTIES OF MERCHANTABILITY AND FITNESS FOR A PARTICULAR PURPOSE
// ARE DISCLAIMED. IN NO EVENT SHALL THE AUTHOR OR CONTRIBUTORS BE LIABLE FOR
// ANY DIRECT, INDIRECT, INCIDENTAL, SPECIAL, EXEMPLARY, OR CONSEQUENTIAL
// DAMAGES (INCLUDING, BUT NOT LIMITED TO, PROCUREMENT OF SUBSTITUTE GOODS
// OR SERVICES; LOSS OF USE, DATA, OR PROFITS; OR BUSINESS INTERRUPTION)
// HOWEVER CAUSED AND ON ANY THEORY OF LIABILITY, WHETHER IN CONTRACT, STRICT
// LIABILITY, OR TORT (INCLUDING NEGLIGENCE OR OTHERWISE) ARISING IN ANY WAY
// OUT OF THE USE OF THIS SOFTWARE, EVEN IF ADVISED OF THE POSSIBILITY OF
// SUCH DAMAGE.

use crate::util::{self, archive, Entropy};
use oci_model::digest::OciDigest;
use std::collections::BTreeMap;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};
use zdataset::{DatasetKind, DatasetService, PropertyValue, ZfsClone, ZfsCreate, ZfsSnapshot};

/// User property carrying the content id of a node's uncompressed diff
/// archive
pub const DIFF_PROPERTY: &str = "zoci:diff";

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("node ({0}) does not exist")]
    NodeNotFound(String),
    #[error("node ({0}) has dependent children, can not remove")]
    NodeInUse(String),
    #[error("node ({0}) is not committed")]
    NotCommitted(String),
    #[error("node ({0}) is committed and read only")]
    NodeReadonly(String),
    #[error("can not save node ({0}) to ({1}), format unsupported")]
    UnsupportedSave(String, PathBuf),
    #[error(transparent)]
    Dataset(#[from] zdataset::DatasetError),
    #[error(transparent)]
    Archive(#[from] archive::ArchiveError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

type Result<T> = std::result::Result<T, GraphError>;

#[derive(Clone, Debug)]
pub struct Node {
    id: String,
    base: String,
    parent: Option<String>,
    mount_path: Option<PathBuf>,
    committed: bool,
    size: u64,
    base_snapshot: Option<String>,
    snapshot: Option<String>,
    diff: Option<OciDigest>,
}

impl Node {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn parent(&self) -> Option<&str> {
        self.parent.as_deref()
    }

    pub fn mount_path(&self) -> Option<&Path> {
        self.mount_path.as_deref()
    }

    pub fn committed(&self) -> bool {
        self.committed
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// The committed, readonly snapshot children are cloned from
    pub fn snapshot(&self) -> Option<&str> {
        self.snapshot.as_deref()
    }

    pub fn base_snapshot(&self) -> Option<&str> {
        self.base_snapshot.as_deref()
    }

    pub fn diff(&self) -> Option<&OciDigest> {
        self.diff.as_ref()
    }
}

pub struct GraphDriver {
    handle: Box<dyn DatasetService>,
    root_dataset: String,
    mount_root: PathBuf,
    entropy: Box<dyn Entropy>,
    nodes: BTreeMap<String, Node>,
}

impl GraphDriver {
    /// Open the driver over `root_dataset`, creating it when absent, and
    /// rebuild the node table from what is actually on the backing store
    pub fn open(
        handle: Box<dyn DatasetService>,
        root_dataset: &str,
        mount_root: impl AsRef<Path>,
        entropy: Box<dyn Entropy>,
    ) -> Result<GraphDriver> {
        std::fs::create_dir_all(mount_root.as_ref())?;
        if !handle.exists(root_dataset) {
            let mut create = ZfsCreate::new(root_dataset, true, false);
            create.insert_prop("mountpoint", "none").compression("lz4");
            handle.create(create)?;
        }
        let mut driver = GraphDriver {
            handle,
            root_dataset: root_dataset.to_string(),
            mount_root: mount_root.as_ref().to_path_buf(),
            entropy,
            nodes: BTreeMap::new(),
        };
        driver.reload()?;
        Ok(driver)
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    pub fn node(&self, id: &str) -> Option<&Node> {
        self.nodes.get(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn find_by_diff(&self, diff: &OciDigest) -> Option<&Node> {
        self.nodes.values().find(|node| node.diff() == Some(diff))
    }

    fn base_dataset(&self, base: &str) -> String {
        format!("{}/{}", self.root_dataset, base)
    }

    fn node_dataset(&self, node: &Node) -> String {
        format!("{}/{}/{}", self.root_dataset, node.base, node.id)
    }

    fn require(&self, id: &str) -> Result<&Node> {
        self.nodes
            .get(id)
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))
    }

    /// Create a new writable node. Without a parent this founds a new chain
    /// (fresh base dataset); with a parent the node is cloned from the
    /// parent's committed snapshot.
    pub fn create(&mut self, parent: Option<&str>) -> Result<String> {
        let mut id = util::gen_id(self.entropy.as_ref());
        while self.nodes.contains_key(&id) {
            id = util::gen_id(self.entropy.as_ref());
        }
        let mount_path = self.mount_root.join(&id);

        let node = match parent {
            None => {
                let base = util::short_id(&id).to_string();
                let base_dataset = self.base_dataset(&base);
                let mut create_base = ZfsCreate::new(&base_dataset, false, true);
                create_base.insert_prop("mountpoint", "none");
                self.handle.create(create_base)?;

                let dataset = format!("{base_dataset}/{id}");
                let mut create_node = ZfsCreate::new(&dataset, false, false);
                create_node.mountpoint(&mount_path);
                self.handle.create(create_node)?;

                Node {
                    id: id.clone(),
                    base,
                    parent: None,
                    mount_path: Some(mount_path),
                    committed: false,
                    size: 0,
                    base_snapshot: None,
                    snapshot: None,
                    diff: None,
                }
            }
            Some(parent_id) => {
                let parent = self.require(parent_id)?;
                let Some(snapshot) = parent.snapshot() else {
                    return Err(GraphError::NotCommitted(parent_id.to_string()));
                };
                let base = parent.base.clone();
                let size = parent.size;
                let dataset = format!("{}/{}", self.base_dataset(&base), id);
                let mut clone = ZfsClone::new(snapshot, &dataset);
                clone.mountpoint(&mount_path);
                self.handle.clone_from(clone)?;

                Node {
                    id: id.clone(),
                    base,
                    parent: Some(parent_id.to_string()),
                    mount_path: Some(mount_path),
                    committed: false,
                    size,
                    base_snapshot: None,
                    snapshot: None,
                    diff: None,
                }
            }
        };
        debug!(node = %id, parent = ?parent, "created graph node");
        self.nodes.insert(id.clone(), node);
        Ok(id)
    }

    /// Seal a node: the dataset becomes readonly and a recursive snapshot of
    /// the base makes the node available as a clone source. Committing a
    /// committed node is a no-op and returns the existing snapshot name.
    pub fn commit(&mut self, id: &str) -> Result<String> {
        let node = self.require(id)?;
        if let Some(snapshot) = node.snapshot() {
            return Ok(snapshot.to_string());
        }
        let base_dataset = self.base_dataset(&node.base);
        let dataset = self.node_dataset(node);
        let size = match node.mount_path() {
            Some(mount) => archive::directory_size(mount)?,
            None => node.size,
        };

        self.handle.set_readonly(&dataset, true)?;
        let mut request = ZfsSnapshot::new(&base_dataset, id);
        request.set_recursive(true);
        self.handle.snapshot(request)?;

        let snapshot = format!("{dataset}@{id}");
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))?;
        node.committed = true;
        node.size = size;
        node.base_snapshot = Some(format!("{base_dataset}@{id}"));
        node.snapshot = Some(snapshot.clone());
        debug!(node = %id, %snapshot, "committed graph node");
        Ok(snapshot)
    }

    /// Record the content id of the node's uncompressed diff archive, both on
    /// the node table and as a user property on the dataset so `reload` can
    /// recover the pairing
    pub fn set_diff(&mut self, id: &str, diff: &OciDigest) -> Result<()> {
        let node = self.require(id)?;
        let dataset = self.node_dataset(node);
        self.handle
            .set_property(&dataset, DIFF_PROPERTY, diff.as_str())?;
        if let Some(node) = self.nodes.get_mut(id) {
            node.diff = Some(diff.clone());
        }
        Ok(())
    }

    /// Serialize a committed node to `file_path`. A `.tar` suffix packs the
    /// materialized tree (chain roots only); a `.zfs` suffix produces a
    /// native stream, incremental when the node has a parent.
    pub fn save(&self, id: &str, file_path: impl AsRef<Path>) -> Result<()> {
        let file_path = file_path.as_ref();
        let node = self.require(id)?;
        if !node.committed {
            return Err(GraphError::NotCommitted(id.to_string()));
        }
        match file_path.extension().and_then(|e| e.to_str()) {
            Some("tar") => {
                if node.parent.is_some() {
                    return Err(GraphError::UnsupportedSave(
                        id.to_string(),
                        file_path.to_path_buf(),
                    ));
                }
                let mount = node
                    .mount_path()
                    .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))?;
                archive::pack_dir(mount, file_path)?;
                Ok(())
            }
            Some("zfs") => {
                let snapshot = node
                    .base_snapshot()
                    .ok_or_else(|| GraphError::NotCommitted(id.to_string()))?;
                let origin = match node.parent() {
                    Some(parent_id) => {
                        let parent = self.require(parent_id)?;
                        Some(
                            parent
                                .base_snapshot()
                                .ok_or_else(|| GraphError::NotCommitted(parent_id.to_string()))?
                                .to_string(),
                        )
                    }
                    None => None,
                };
                let mut file = std::fs::File::create(file_path)?;
                self.handle
                    .send(snapshot, &mut file, origin.as_deref(), true)?;
                Ok(())
            }
            _ => Err(GraphError::UnsupportedSave(
                id.to_string(),
                file_path.to_path_buf(),
            )),
        }
    }

    /// Copy a regular file into the node's tree
    pub fn add_file(&mut self, id: &str, source: &Path, dest: Option<&str>) -> Result<PathBuf> {
        let node = self.require(id)?;
        if node.committed {
            return Err(GraphError::NodeReadonly(id.to_string()));
        }
        let mount = node
            .mount_path()
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))?
            .to_path_buf();
        let relative = archive::copy_into(source, &mount, dest)?;
        let size = archive::directory_size(&mount)?;
        if let Some(node) = self.nodes.get_mut(id) {
            node.size = size;
        }
        Ok(relative)
    }

    /// Unpack a tar stream into the node's tree, optionally below `dest`
    pub fn add_tar(&mut self, id: &str, source: &mut dyn Read, dest: Option<&str>) -> Result<()> {
        let node = self.require(id)?;
        if node.committed {
            return Err(GraphError::NodeReadonly(id.to_string()));
        }
        let mount = node
            .mount_path()
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))?
            .to_path_buf();
        let target = match dest {
            Some(dest) => mount.join(dest.trim_start_matches('/')),
            None => mount.clone(),
        };
        archive::unpack_stream(source, &target)?;
        let size = archive::directory_size(&mount)?;
        if let Some(node) = self.nodes.get_mut(id) {
            node.size = size;
        }
        Ok(())
    }

    pub fn children(&self, id: &str) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|node| node.parent() == Some(id))
            .collect()
    }

    pub fn is_parent(&self, id: &str) -> bool {
        !self.children(id).is_empty()
    }

    pub fn path(&self, id: &str) -> Result<&Path> {
        self.require(id)?
            .mount_path()
            .ok_or_else(|| GraphError::NodeNotFound(id.to_string()))
    }

    pub fn size(&self, id: &str) -> Result<u64> {
        Ok(self.require(id)?.size)
    }

    /// Tear a node down. Also tolerates partially created nodes left behind
    /// by a crash: each backing object is destroyed only if it still exists.
    pub fn remove(&mut self, id: &str) -> Result<()> {
        let node = self.require(id)?;
        if self.is_parent(id) {
            return Err(GraphError::NodeInUse(id.to_string()));
        }
        let base_dataset = self.base_dataset(&node.base);
        let base_snapshot = format!("{base_dataset}@{id}");
        let dataset = self.node_dataset(node);
        let mount_path = node.mount_path().map(Path::to_path_buf);
        let is_chain_root = node.parent.is_none();

        if self.handle.is_snapshot(&base_snapshot) {
            if let Err(error) = self.handle.destroy(&base_snapshot, true, true) {
                warn!(%base_snapshot, "could not destroy snapshot: {error}");
            }
        }
        if self.handle.is_filesystem(&dataset) {
            self.handle.destroy(&dataset, false, true)?;
        }
        if let Some(mount_path) = mount_path {
            if mount_path.exists() {
                std::fs::remove_dir_all(&mount_path)?;
            }
        }
        if is_chain_root && self.handle.is_filesystem(&base_dataset) {
            self.handle.destroy(&base_dataset, false, true)?;
        }
        self.nodes.remove(id);
        debug!(node = %id, "removed graph node");
        Ok(())
    }

    /// Rebuild the node table from the datasets actually present under the
    /// driver root. Datasets whose names do not follow the 12-hex base /
    /// 64-hex node discipline are ignored.
    pub fn reload(&mut self) -> Result<()> {
        self.nodes.clear();
        if !self.handle.exists(&self.root_dataset) {
            return Ok(());
        }
        let rows = self.handle.list(
            &self.root_dataset,
            true,
            DatasetKind::Filesystem,
            &["name", "mountpoint", "origin", "readonly"],
        )?;
        let prefix = format!("{}/", self.root_dataset);
        for row in rows.iter() {
            let Some(name) = row.get("name").and_then(|v| v.as_ref()) else {
                continue;
            };
            let name = match name {
                PropertyValue::Text(name) => name.clone(),
                PropertyValue::Path(path) => path.to_string_lossy().to_string(),
                _ => continue,
            };
            let Some(relative) = name.strip_prefix(&prefix) else {
                continue;
            };
            let components: Vec<&str> = relative.split('/').collect();
            let [base, id] = components.as_slice() else {
                continue;
            };
            if !util::is_short_hex_id(base) || !util::is_hex_id(id) {
                continue;
            }
            let mount_path = row
                .get("mountpoint")
                .and_then(|v| v.as_ref())
                .and_then(|v| v.as_path())
                .map(Path::to_path_buf);
            let committed = row
                .get("readonly")
                .and_then(|v| v.as_ref())
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            let parent = row
                .get("origin")
                .and_then(|v| v.as_ref())
                .and_then(|v| v.as_text())
                .and_then(|origin| parse_origin_node(origin, &prefix, base));
            let diff = match self.handle.get(&name, DIFF_PROPERTY)? {
                Some(PropertyValue::Text(value)) => OciDigest::from_str(&value).ok(),
                _ => None,
            };
            let size = match mount_path.as_deref() {
                Some(mount) if mount.exists() => archive::directory_size(mount).unwrap_or(0),
                _ => 0,
            };
            self.nodes.insert(
                id.to_string(),
                Node {
                    id: id.to_string(),
                    base: base.to_string(),
                    parent,
                    mount_path,
                    committed,
                    size,
                    base_snapshot: None,
                    snapshot: None,
                    diff,
                },
            );
        }

        let snapshots =
            self.handle
                .list(&self.root_dataset, true, DatasetKind::Snapshot, &["name"])?;
        for row in snapshots.iter() {
            let Some(name) = row.get("name").and_then(|v| v.as_ref()) else {
                continue;
            };
            let name = match name {
                PropertyValue::Text(name) => name.clone(),
                PropertyValue::Path(path) => path.to_string_lossy().to_string(),
                _ => continue,
            };
            let Some((dataset, tag)) = name.split_once('@') else {
                continue;
            };
            let Some(relative) = dataset.strip_prefix(&prefix) else {
                continue;
            };
            let components: Vec<&str> = relative.split('/').collect();
            match components.as_slice() {
                [_base] => {
                    if let Some(node) = self.nodes.get_mut(tag) {
                        node.base_snapshot = Some(name.clone());
                    }
                }
                [_base, id] if *id == tag => {
                    if let Some(node) = self.nodes.get_mut(tag) {
                        node.snapshot = Some(name.clone());
                    }
                }
                _ => {}
            }
        }
        debug!(nodes = self.nodes.len(), "reloaded graph node table");
        Ok(())
    }
}

/// Extract a parent node id from a clone origin such as
/// `root/<base>/<parent>@<parent>`; origins outside this chain are ignored
fn parse_origin_node(origin: &str, root_prefix: &str, base: &str) -> Option<String> {
    let (dataset, _tag) = origin.split_once('@')?;
    let relative = dataset.strip_prefix(root_prefix)?;
    let (origin_base, parent) = relative.split_once('/')?;
    if origin_base != base || !util::is_hex_id(parent) {
        return None;
    }
    Some(parent.to_string())
}
