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

use crate::graph::GraphDriver;
use crate::image::{ImageError, Result};
use crate::util::archive;
use oci_model::digest::OciDigest;
use oci_model::models::{Descriptor, OCI_LAYER_TAR_GZIP};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A content-addressed blob on disk, as referenced from a manifest
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobRef {
    pub digest: OciDigest,
    pub size: u64,
    pub media_type: String,
}

/// A layer pairs an immutable blob under `layers/` with the graph node that
/// materializes its tree. Scratch layers (container roots) carry a node but
/// no blob.
#[derive(Clone, Debug)]
pub struct Layer {
    node_id: String,
    diff_id: Option<OciDigest>,
    blob: Option<BlobRef>,
}

impl Layer {
    pub(crate) fn from_parts(
        node_id: &str,
        diff_id: Option<OciDigest>,
        blob: Option<BlobRef>,
    ) -> Layer {
        Layer {
            node_id: node_id.to_string(),
            diff_id,
            blob,
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    /// `sha256:<diff_id>` of the uncompressed diff archive
    pub fn diff_digest(&self) -> Option<&OciDigest> {
        self.diff_id.as_ref()
    }

    pub fn blob(&self) -> Option<&BlobRef> {
        self.blob.as_ref()
    }

    pub fn is_scratch(&self) -> bool {
        self.blob.is_none()
    }

    /// The descriptor recorded in manifests for this layer's blob
    pub fn descriptor(&self) -> Option<Descriptor> {
        self.blob.as_ref().map(|blob| {
            Descriptor::new(&blob.media_type, blob.size, blob.digest.clone())
        })
    }
}

pub struct LayerStore {
    graph: GraphDriver,
    layers_dir: PathBuf,
}

impl LayerStore {
    pub fn open(graph: GraphDriver, layers_dir: impl AsRef<Path>) -> Result<LayerStore> {
        std::fs::create_dir_all(layers_dir.as_ref())?;
        Ok(LayerStore {
            graph,
            layers_dir: layers_dir.as_ref().to_path_buf(),
        })
    }

    pub fn graph(&self) -> &GraphDriver {
        &self.graph
    }

    pub(crate) fn graph_mut(&mut self) -> &mut GraphDriver {
        &mut self.graph
    }

    pub fn blob_path(&self, digest: &OciDigest) -> PathBuf {
        self.layers_dir.join(digest.encoded())
    }

    /// Materialize a new layer from an archive (or a plain file copied to the
    /// tree root) and seal it into a content-addressed blob
    pub fn new_from_source(&mut self, source: &Path, parent: Option<&Layer>) -> Result<Layer> {
        let node_id = self.begin(parent)?;
        let result = self.ingest(&node_id, source, None).and_then(|_| {
            self.seal(&node_id, None)
        });
        match result {
            Ok(layer) => Ok(layer),
            Err(error) => {
                self.abandon(&node_id);
                Err(error)
            }
        }
    }

    /// Allocate the writable node a new layer builds in
    pub(crate) fn begin(&mut self, parent: Option<&Layer>) -> Result<String> {
        Ok(self.graph.create(parent.map(Layer::node_id))?)
    }

    /// Ingest `source` into the node: tar archives unpack, anything else is
    /// copied in as a file
    pub(crate) fn ingest(
        &mut self,
        node_id: &str,
        source: &Path,
        dest: Option<&str>,
    ) -> Result<Option<PathBuf>> {
        if source.extension().and_then(|e| e.to_str()) == Some("tar") {
            let mut file = std::fs::File::open(source)?;
            self.graph.add_tar(node_id, &mut file, dest)?;
            Ok(None)
        } else {
            let relative = self.graph.add_file(node_id, source, dest)?;
            Ok(Some(relative))
        }
    }

    /// Commit the node and produce its blob: serialize the diff archive,
    /// digest the uncompressed bytes, compress while digesting the output,
    /// and move the result into place under its content id. `paths`, when
    /// given, limits the archive to the named entries of the tree (diffs of
    /// derived layers); otherwise the whole tree is packed (chain roots).
    pub(crate) fn seal(&mut self, node_id: &str, paths: Option<&[String]>) -> Result<Layer> {
        self.graph.commit(node_id)?;
        let mount = self.graph.path(node_id)?.to_path_buf();
        let staging_tar = self.layers_dir.join(format!(".tmp-{node_id}.tar"));
        let staging_gz = self.layers_dir.join(format!(".tmp-{node_id}.tar.gz"));
        debug!(node = %node_id, "serializing layer diff");
        let sealed = (|| -> Result<Layer> {
            match paths {
                Some(paths) => archive::pack_paths(&mount, paths, &staging_tar)?,
                None => archive::pack_dir(&mount, &staging_tar)?,
            }
            let blob = archive::compress_file_gz(&staging_tar, &staging_gz)?;
            let blob_path = self.blob_path(&blob.blob_digest);
            std::fs::rename(&staging_gz, &blob_path)?;
            self.graph.set_diff(node_id, &blob.source_digest)?;
            Ok(Layer {
                node_id: node_id.to_string(),
                diff_id: Some(blob.source_digest),
                blob: Some(BlobRef {
                    digest: blob.blob_digest,
                    size: blob.blob_size,
                    media_type: OCI_LAYER_TAR_GZIP.to_string(),
                }),
            })
        })();
        // staging files may legitimately not exist when packing failed
        let _ = std::fs::remove_file(&staging_tar);
        if sealed.is_err() {
            let _ = std::fs::remove_file(&staging_gz);
        }
        sealed
    }

    /// A writable clone of `parent` with no blob, used as a container root
    pub fn new_scratch(&mut self, parent: &Layer) -> Result<Layer> {
        let node_id = self.graph.create(Some(parent.node_id()))?;
        Ok(Layer {
            node_id,
            diff_id: None,
            blob: None,
        })
    }

    /// Remove the graph node backing `layer`. Fails with `LayerInUse` when
    /// other layers were cloned from it. Blob files are unlinked separately
    /// because identical blobs may be shared between images.
    pub fn remove(&mut self, layer: &Layer) -> Result<()> {
        self.remove_node(layer.node_id())
    }

    pub fn remove_node(&mut self, node_id: &str) -> Result<()> {
        Ok(self.graph.remove(node_id)?)
    }

    pub fn unlink_blob(&self, digest: &OciDigest) -> Result<()> {
        let path = self.blob_path(digest);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    pub fn is_parent(&self, layer: &Layer) -> bool {
        self.graph.is_parent(layer.node_id())
    }

    /// Bytes of the materialized tree
    pub fn size(&self, layer: &Layer) -> u64 {
        self.graph
            .node(layer.node_id())
            .map(|node| node.size())
            .unwrap_or(0)
    }

    pub fn path(&self, layer: &Layer) -> Result<&Path> {
        Ok(self.graph.path(layer.node_id())?)
    }

    pub fn blob_exists(&self, digest: &OciDigest) -> bool {
        self.blob_path(digest).exists()
    }

    /// Best-effort teardown of a node that failed mid-construction
    pub(crate) fn abandon(&mut self, node_id: &str) {
        if let Err(error) = self.graph.remove(node_id) {
            warn!(node = %node_id, "could not clean up abandoned layer node: {error}");
        }
    }

    /// Size of the blob file for `digest`, `MissingBlob` when absent
    pub fn has_blob(&self, digest: &OciDigest) -> Result<u64> {
        let path = self.blob_path(digest);
        if !path.exists() {
            return Err(ImageError::MissingBlob(digest.clone()));
        }
        Ok(std::fs::metadata(&path)?.len())
    }
}
