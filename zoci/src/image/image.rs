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
use crate::image::layer::{BlobRef, Layer, LayerStore};
use crate::image::{ImageError, Result, StorePaths};
use chrono::{DateTime, Utc};
use oci_model::digest::{sha256_once, OciDigest};
use oci_model::models::{ImageConfig, ImageManifest};

/// A fully resolved image: manifest, config, and the layer chain root → top
#[derive(Clone, Debug)]
pub struct Image {
    pub repository: String,
    pub tag: String,
    pub manifest_id: OciDigest,
    pub config_id: OciDigest,
    pub manifest: ImageManifest,
    pub config: ImageConfig,
    pub layers: Vec<Layer>,
}

impl Image {
    pub fn name(&self) -> String {
        format!("{}:{}", self.repository, self.tag)
    }

    /// The image id is its manifest id
    pub fn id(&self) -> &str {
        self.manifest_id.encoded()
    }

    pub fn short_id(&self) -> &str {
        self.manifest_id.short_id()
    }

    /// The digest shown next to an image is its top layer's diff digest
    pub fn digest(&self) -> Option<&OciDigest> {
        self.top_layer().and_then(Layer::diff_digest)
    }

    pub fn top_layer(&self) -> Option<&Layer> {
        self.layers.last()
    }

    pub fn created(&self) -> Option<DateTime<Utc>> {
        self.config.created
    }

    /// Sum of the compressed blob sizes recorded in the manifest
    pub fn blob_size(&self) -> u64 {
        self.manifest.layers.iter().map(|layer| layer.size).sum()
    }

    /// Load an image from the manifest and config files on disk, pairing
    /// each `(diff_id, blob)` with the graph node that materializes it
    pub(crate) fn load(
        paths: &StorePaths,
        graph: &GraphDriver,
        repository: &str,
        tag: &str,
        manifest_id: &OciDigest,
    ) -> Result<Image> {
        let manifest_path = paths.manifest_file(manifest_id);
        let manifest_bytes = std::fs::read(&manifest_path)
            .map_err(|_| ImageError::DanglingReference(manifest_id.to_string()))?;
        let actual = sha256_once(&manifest_bytes);
        if &actual != manifest_id {
            return Err(ImageError::DigestMismatch {
                expected: manifest_id.to_string(),
                actual: actual.to_string(),
            });
        }
        let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)?;

        let config_id = manifest.config.digest.clone();
        let config_bytes = std::fs::read(paths.config_file(&config_id))
            .map_err(|_| ImageError::DanglingReference(config_id.to_string()))?;
        let config: ImageConfig = serde_json::from_slice(&config_bytes)?;

        if config.rootfs.diff_ids.len() != manifest.layers.len() {
            return Err(ImageError::DanglingReference(format!(
                "manifest ({manifest_id}) layer count disagrees with its config"
            )));
        }
        let mut layers = Vec::with_capacity(manifest.layers.len());
        for (diff_id, descriptor) in config.rootfs.diff_ids.iter().zip(manifest.layers.iter()) {
            let node = graph
                .find_by_diff(diff_id)
                .ok_or_else(|| ImageError::DanglingReference(diff_id.to_string()))?;
            layers.push(Layer::from_parts(
                node.id(),
                Some(diff_id.clone()),
                Some(BlobRef {
                    digest: descriptor.digest.clone(),
                    size: descriptor.size,
                    media_type: descriptor.media_type.clone(),
                }),
            ));
        }

        Ok(Image {
            repository: repository.to_string(),
            tag: tag.to_string(),
            manifest_id: manifest_id.clone(),
            config_id,
            manifest,
            config,
            layers,
        })
    }
}

/// One row of an image summary listing
#[derive(Clone, Debug)]
pub struct ImageSummary {
    pub repository: String,
    pub tag: String,
    pub id: OciDigest,
    pub short_id: String,
    pub digest: Option<OciDigest>,
    pub created: Option<DateTime<Utc>>,
    pub size: u64,
}

/// One row of `image history`, newest first
#[derive(Clone, Debug)]
pub struct HistoryEntryView {
    /// Short blob id of the layer this entry created, `<empty>` for entries
    /// that created none
    pub layer: String,
    pub created: Option<DateTime<Utc>>,
    pub created_by: String,
    pub size: u64,
    pub comment: String,
    pub author: String,
}

pub(crate) fn history_view(image: &Image, layers: &LayerStore) -> Vec<HistoryEntryView> {
    let mut rows = Vec::new();
    let mut layer_index = 0usize;
    for item in image.config.history.iter() {
        let (layer, size) = if item.is_empty_layer() {
            ("<empty>".to_string(), 0)
        } else {
            let layer = image.layers.get(layer_index);
            layer_index += 1;
            match layer {
                Some(layer) => {
                    let label = layer
                        .blob()
                        .map(|blob| blob.digest.short_id().to_string())
                        .unwrap_or_else(|| "<missing>".to_string());
                    (label, layers.size(layer))
                }
                None => ("<missing>".to_string(), 0),
            }
        };
        rows.push(HistoryEntryView {
            layer,
            created: item.created,
            created_by: item.created_by.clone().unwrap_or_default(),
            size,
            comment: item.comment.clone().unwrap_or_default(),
            author: item.author.clone().unwrap_or_default(),
        });
    }
    rows.reverse();
    rows
}
