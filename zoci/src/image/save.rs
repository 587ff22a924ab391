//! OCI image-layout directories, the interchange format of `image save` and
//! `image load`

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

use crate::image::image::Image;
use crate::image::{ImageError, Result, StorePaths};
use oci_model::digest::sha256_once;
use oci_model::models::{
    Descriptor, ImageConfig, ImageIndex, ImageLayout, ImageManifest, ANNOTATION_REF_NAME,
    OCI_MANIFEST,
};
use std::path::{Path, PathBuf};

const BLOBS_SHA256: &str = "blobs/sha256";

/// Write `image` into `dir` as an OCI layout. Blob, config, and manifest
/// files are copied byte for byte so a later load reproduces the same ids.
pub(crate) fn write_layout(paths: &StorePaths, image: &Image, dir: &Path) -> Result<()> {
    let blobs_dir = dir.join(BLOBS_SHA256);
    std::fs::create_dir_all(&blobs_dir)?;

    let layout_bytes = serde_json::to_vec(&ImageLayout::default())?;
    std::fs::write(dir.join("oci-layout"), layout_bytes)?;

    let manifest_file = paths.manifest_file(&image.manifest_id);
    let manifest_size = std::fs::metadata(&manifest_file)
        .map_err(|_| ImageError::DanglingReference(image.manifest_id.to_string()))?
        .len();
    std::fs::copy(&manifest_file, blobs_dir.join(image.manifest_id.encoded()))?;
    std::fs::copy(
        paths.config_file(&image.config_id),
        blobs_dir.join(image.config_id.encoded()),
    )?;
    for descriptor in image.manifest.layers.iter() {
        let blob = paths.blob_file(&descriptor.digest);
        if !blob.exists() {
            return Err(ImageError::MissingBlob(descriptor.digest.clone()));
        }
        std::fs::copy(&blob, blobs_dir.join(descriptor.digest.encoded()))?;
    }

    let mut index = ImageIndex::default();
    index.set_tag(
        Descriptor::new(OCI_MANIFEST, manifest_size, image.manifest_id.clone())
            .annotate(ANNOTATION_REF_NAME, &image.tag),
    );
    let index_bytes = serde_json::to_vec(&index)?;
    std::fs::write(dir.join("index.json"), index_bytes)?;
    Ok(())
}

pub(crate) struct LoadedLayout {
    pub manifest_descriptor: Descriptor,
    pub manifest_bytes: Vec<u8>,
    pub manifest: ImageManifest,
    pub config_bytes: Vec<u8>,
    pub config: ImageConfig,
    pub blobs_dir: PathBuf,
}

/// Read an OCI layout directory, verifying manifest and config digests
pub(crate) fn read_layout(dir: &Path) -> Result<LoadedLayout> {
    let blobs_dir = dir.join(BLOBS_SHA256);
    let index_bytes = std::fs::read(dir.join("index.json"))?;
    let index: ImageIndex = serde_json::from_slice(&index_bytes)?;
    let manifest_descriptor = index
        .manifests
        .first()
        .cloned()
        .ok_or_else(|| ImageError::DanglingReference("layout index has no manifests".to_string()))?;

    let manifest_path = blobs_dir.join(manifest_descriptor.digest.encoded());
    if !manifest_path.exists() {
        return Err(ImageError::MissingBlob(manifest_descriptor.digest.clone()));
    }
    let manifest_bytes = std::fs::read(&manifest_path)?;
    let actual = sha256_once(&manifest_bytes);
    if actual != manifest_descriptor.digest {
        return Err(ImageError::DigestMismatch {
            expected: manifest_descriptor.digest.to_string(),
            actual: actual.to_string(),
        });
    }
    let manifest: ImageManifest = serde_json::from_slice(&manifest_bytes)?;

    let config_path = blobs_dir.join(manifest.config.digest.encoded());
    if !config_path.exists() {
        return Err(ImageError::MissingBlob(manifest.config.digest.clone()));
    }
    let config_bytes = std::fs::read(&config_path)?;
    let actual = sha256_once(&config_bytes);
    if actual != manifest.config.digest {
        return Err(ImageError::DigestMismatch {
            expected: manifest.config.digest.to_string(),
            actual: actual.to_string(),
        });
    }
    let config: ImageConfig = serde_json::from_slice(&config_bytes)?;

    Ok(LoadedLayout {
        manifest_descriptor,
        manifest_bytes,
        manifest,
        config_bytes,
        config,
        blobs_dir,
    })
}
