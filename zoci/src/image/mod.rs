//! Image distribution: layers, manifests, configs, repositories

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

pub mod distribution;
pub mod image;
pub mod layer;
pub mod repository;
pub mod save;

pub use self::distribution::Distribution;
pub use self::image::{HistoryEntryView, Image, ImageSummary};
pub use self::layer::{BlobRef, Layer, LayerStore};
pub use self::repository::Repository;

use crate::graph::GraphError;
use crate::util::archive::ArchiveError;
use oci_model::digest::OciDigest;
use oci_model::reference::ReferenceParseError;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("image ({0}) is unknown")]
    ImageUnknown(String),
    #[error("image ({0}) already exists")]
    ImageExists(String),
    #[error("image ({0}) has dependent images, can not remove")]
    ImageInUse(String),
    #[error("repository ({0}) is unknown")]
    RepositoryUnknown(String),
    #[error("layer ({0}) is unknown")]
    LayerUnknown(String),
    #[error("layer ({0}) is in use, can not remove")]
    LayerInUse(String),
    #[error("can not parse image reference ({0})")]
    ReferenceParse(String),
    #[error("dockerfile parse error: {0}")]
    DockerfileParse(String),
    #[error("digest mismatch, expected ({expected}), got ({actual})")]
    DigestMismatch { expected: String, actual: String },
    #[error("missing blob ({0})")]
    MissingBlob(OciDigest),
    #[error("dangling reference ({0})")]
    DanglingReference(String),
    #[error("unsupported operation: {0}")]
    Unsupported(String),
    #[error(transparent)]
    Graph(GraphError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<GraphError> for ImageError {
    fn from(error: GraphError) -> ImageError {
        match error {
            GraphError::NodeInUse(id) => ImageError::LayerInUse(id),
            other => ImageError::Graph(other),
        }
    }
}

impl From<ReferenceParseError> for ImageError {
    fn from(error: ReferenceParseError) -> ImageError {
        ImageError::ReferenceParse(error.0)
    }
}

pub type Result<T> = std::result::Result<T, ImageError>;

/// Directory layout under the store root
#[derive(Clone, Debug)]
pub struct StorePaths {
    root: PathBuf,
}

impl StorePaths {
    pub fn new(root: impl AsRef<Path>) -> StorePaths {
        StorePaths {
            root: root.as_ref().to_path_buf(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn layers_dir(&self) -> PathBuf {
        self.root.join("layers")
    }

    pub fn manifests_dir(&self) -> PathBuf {
        self.root.join("manifests")
    }

    pub fn configs_dir(&self) -> PathBuf {
        self.root.join("configs")
    }

    pub fn repositories_dir(&self) -> PathBuf {
        self.root.join("repositories")
    }

    pub fn repository_file(&self, name: &str) -> PathBuf {
        self.repositories_dir().join(format!("{name}.json"))
    }

    pub fn oci_layout_file(&self) -> PathBuf {
        self.repositories_dir().join("oci-layout")
    }

    pub fn distribution_file(&self) -> PathBuf {
        self.root.join("distribution.json")
    }

    pub fn containers_dir(&self) -> PathBuf {
        self.root.join("containers")
    }

    pub fn runtime_file(&self) -> PathBuf {
        self.root.join("runtime.json")
    }

    pub fn manifest_file(&self, digest: &OciDigest) -> PathBuf {
        self.manifests_dir().join(digest.encoded())
    }

    pub fn config_file(&self, digest: &OciDigest) -> PathBuf {
        self.configs_dir().join(digest.encoded())
    }

    pub fn blob_file(&self, digest: &OciDigest) -> PathBuf {
        self.layers_dir().join(digest.encoded())
    }
}
