//! The distribution: every repository on this host, and the protocols that
//! create, resolve, retire, save, and load images

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

use crate::config::ZociConfig;
use crate::graph::GraphDriver;
use crate::image::image::{history_view, HistoryEntryView, Image, ImageSummary};
use crate::image::layer::{BlobRef, Layer, LayerStore};
use crate::image::repository::Repository;
use crate::image::{save, ImageError, Result, StorePaths};
use crate::util::{self, archive, Clock, Entropy};
use oci_model::digest::{sha256_once, OciDigest};
use oci_model::models::{
    Descriptor, History, ImageConfig, ImageLayout, InnerConfig, RepositoryList, RootFs,
    ANNOTATION_REF_NAME, OCI_CONFIG, OCI_LAYER_TAR_GZIP, OCI_MANIFEST,
};
use oci_model::reference::ImageReference;
use oci_model::runtime::RuntimeSpec;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};
use zdataset::DatasetService;

pub const DEFAULT_ENV: &str = "PATH=/usr/sbin:/usr/bin:/sbin:/bin";
pub const DEFAULT_CMD: &str = "/bin/sh";
pub const DEFAULT_WORKDIR: &str = "/";

pub struct Distribution {
    paths: StorePaths,
    layers: LayerStore,
    repositories: BTreeMap<String, Repository>,
    clock: Box<dyn Clock>,
}

impl Distribution {
    /// Open (or initialize) the store rooted at `config.root_dir`
    pub fn open(
        config: &ZociConfig,
        handle: Box<dyn DatasetService>,
        clock: Box<dyn Clock>,
        entropy: Box<dyn Entropy>,
    ) -> Result<Distribution> {
        let paths = StorePaths::new(&config.root_dir);
        std::fs::create_dir_all(paths.manifests_dir())?;
        std::fs::create_dir_all(paths.configs_dir())?;
        std::fs::create_dir_all(paths.repositories_dir())?;

        let graph = GraphDriver::open(
            handle,
            &config.graph_dataset,
            &config.graph_mount_dir,
            entropy,
        )?;
        let layers = LayerStore::open(graph, paths.layers_dir())?;

        let layout_file = paths.oci_layout_file();
        if !layout_file.exists() {
            let bytes = serde_json::to_vec(&ImageLayout::default())?;
            std::fs::write(&layout_file, bytes)?;
        }

        let mut distribution = Distribution {
            paths,
            layers,
            repositories: BTreeMap::new(),
            clock,
        };
        distribution.load_repositories()?;
        Ok(distribution)
    }

    pub fn layers(&self) -> &LayerStore {
        &self.layers
    }

    pub(crate) fn layers_mut(&mut self) -> &mut LayerStore {
        &mut self.layers
    }

    pub(crate) fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn repository_names(&self) -> impl Iterator<Item = &str> {
        self.repositories.keys().map(String::as_str)
    }

    pub fn repository(&self, name: &str) -> Option<&Repository> {
        self.repositories.get(name)
    }

    /// Read the distribution file and the repository index files, reconcile
    /// any disagreement between them, and load every repository. A missing
    /// distribution file initializes an empty one.
    fn load_repositories(&mut self) -> Result<()> {
        let listed: Vec<String> = match std::fs::read(self.paths.distribution_file()) {
            Ok(bytes) => serde_json::from_slice::<RepositoryList>(&bytes)?.repositories,
            Err(_) => Vec::new(),
        };
        let on_disk = self.scan_repository_files()?;
        for name in listed.iter() {
            if !on_disk.contains(name) {
                warn!("repository ({name}) is listed but its index file is missing, dropping");
            }
        }
        for name in on_disk.iter() {
            if !listed.contains(name) {
                warn!("repository ({name}) has an index file but is not listed, adopting");
            }
        }
        for name in on_disk.iter() {
            let repository = Repository::load(&self.paths, self.layers.graph(), name)?;
            self.repositories.insert(name.clone(), repository);
        }
        self.save_distribution()?;
        Ok(())
    }

    /// Repository names derived from the index files on disk
    fn scan_repository_files(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let root = self.paths.repositories_dir();
        let mut stack = vec![root.clone()];
        while let Some(dir) = stack.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                    continue;
                }
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                if let Ok(relative) = path.strip_prefix(&root) {
                    let name = relative.to_string_lossy();
                    if let Some(name) = name.strip_suffix(".json") {
                        names.push(name.to_string());
                    }
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn save_distribution(&self) -> Result<()> {
        let list = RepositoryList {
            repositories: self.repositories.keys().cloned().collect(),
        };
        let bytes = serde_json::to_vec(&list)?;
        util::write_file_atomic(self.paths.distribution_file(), &bytes)?;
        Ok(())
    }

    /// Resolve a reference to an image. Resolution order: full manifest id,
    /// 12-hex short id, then `name[:tag]`.
    pub fn get_image(&self, reference: &str) -> Result<&Image> {
        if util::is_hex_id(reference) {
            if let Some(image) = self.all_images().find(|image| image.id() == reference) {
                return Ok(image);
            }
        }
        if util::is_short_hex_id(reference) {
            if let Some(image) = self.all_images().find(|image| image.short_id() == reference) {
                return Ok(image);
            }
        }
        let parsed = ImageReference::from_str(reference)?;
        self.repositories
            .get(&parsed.name)
            .and_then(|repository| repository.images.get(&parsed.tag))
            .ok_or_else(|| ImageError::ImageUnknown(reference.to_string()))
    }

    fn all_images(&self) -> impl Iterator<Item = &Image> {
        self.repositories
            .values()
            .flat_map(|repository| repository.images.values())
    }

    /// Import protocol: materialize a single layer from `source`, derive the
    /// config from the supplied runtime spec, persist config, manifest, and
    /// the repository index, in that order
    pub fn create_image(
        &mut self,
        reference: &str,
        source: &Path,
        runtime_config: Option<&RuntimeSpec>,
    ) -> Result<&Image> {
        let reference = ImageReference::from_str(reference)?;
        info!(reference = %reference, source = ?source, "importing image");
        let layer = self.layers.new_from_source(source, None)?;
        let diff_id = layer
            .diff_digest()
            .cloned()
            .ok_or_else(|| ImageError::DanglingReference(layer.node_id().to_string()))?;
        let now = self.clock.now();

        let process = runtime_config.and_then(|spec| spec.process.clone());
        let command = process
            .as_ref()
            .map(|process| process.args.clone())
            .filter(|args| !args.is_empty())
            .unwrap_or_else(|| vec![DEFAULT_CMD.to_string()]);
        let env = process
            .as_ref()
            .map(|process| process.env.clone())
            .filter(|env| !env.is_empty())
            .unwrap_or_else(|| vec![DEFAULT_ENV.to_string()]);
        let cwd = process
            .map(|process| process.cwd)
            .filter(|cwd| !cwd.is_empty())
            .unwrap_or_else(|| DEFAULT_WORKDIR.to_string());
        let platform = runtime_config.and_then(|spec| spec.platform.clone());

        let history = vec![
            History {
                created: Some(now),
                created_by: Some(format!(
                    "/bin/sh -c #(nop) ADD file:{} in / ",
                    diff_id.encoded()
                )),
                ..History::default()
            },
            History {
                created: Some(now),
                created_by: Some(format!(
                    "/bin/sh -c #(nop)  CMD [\"{}\"]",
                    command.join(" ")
                )),
                empty_layer: Some(true),
                ..History::default()
            },
        ];
        let config = ImageConfig {
            created: Some(now),
            author: None,
            architecture: platform
                .as_ref()
                .map(|platform| platform.arch.clone())
                .unwrap_or_else(|| util::get_current_arch().to_string()),
            os: platform
                .map(|platform| platform.os)
                .unwrap_or_else(|| util::get_current_os().to_string()),
            config: Some(InnerConfig {
                env: Some(env),
                cmd: Some(command),
                working_dir: Some(cwd),
                ..InnerConfig::default()
            }),
            rootfs: RootFs::layers(vec![diff_id]),
            history,
        };

        let reference = self.register_image(&reference, vec![layer], config)?;
        self.get_image(&reference.to_string())
    }

    /// Persist a fully assembled image: config bytes first, then the
    /// manifest referencing them, then the repository index, then the
    /// distribution file. Registering over an existing tag replaces the
    /// tag's descriptor.
    pub(crate) fn register_image(
        &mut self,
        reference: &ImageReference,
        layers: Vec<Layer>,
        config: ImageConfig,
    ) -> Result<ImageReference> {
        let config_bytes = serde_json::to_vec(&config)?;
        let config_id = sha256_once(&config_bytes);
        util::write_file_atomic(self.paths.config_file(&config_id), &config_bytes)?;
        let config_descriptor =
            Descriptor::new(OCI_CONFIG, config_bytes.len() as u64, config_id.clone());

        let mut layer_descriptors = Vec::with_capacity(layers.len());
        for layer in layers.iter() {
            layer_descriptors.push(layer.descriptor().ok_or_else(|| {
                ImageError::Unsupported("layer without a blob in a manifest".to_string())
            })?);
        }
        let manifest =
            oci_model::models::ImageManifest::new(config_descriptor, layer_descriptors);
        let manifest_bytes = serde_json::to_vec(&manifest)?;
        let manifest_id = sha256_once(&manifest_bytes);
        util::write_file_atomic(self.paths.manifest_file(&manifest_id), &manifest_bytes)?;

        let descriptor = Descriptor::new(
            OCI_MANIFEST,
            manifest_bytes.len() as u64,
            manifest_id.clone(),
        )
        .annotate(ANNOTATION_REF_NAME, &reference.tag);

        let image = Image {
            repository: reference.name.clone(),
            tag: reference.tag.clone(),
            manifest_id: manifest_id.clone(),
            config_id,
            manifest,
            config,
            layers,
        };
        let repository = self
            .repositories
            .entry(reference.name.clone())
            .or_insert_with(|| Repository::new(&reference.name));
        repository.index.set_tag(descriptor);
        repository.images.insert(reference.tag.clone(), image);
        repository.save(&self.paths)?;
        self.save_distribution()?;
        info!(reference = %reference, manifest = %manifest_id, "registered image");
        Ok(reference.clone())
    }

    /// Record an additional tag for an existing image
    pub fn tag_image(&mut self, source: &str, target: &str) -> Result<()> {
        let image = self.get_image(source)?.clone();
        let target = ImageReference::from_str(target)?;
        if image.repository == target.name && image.tag == target.tag {
            return Ok(());
        }
        let manifest_size = std::fs::metadata(self.paths.manifest_file(&image.manifest_id))
            .map_err(|_| ImageError::DanglingReference(image.manifest_id.to_string()))?
            .len();
        let descriptor = Descriptor::new(OCI_MANIFEST, manifest_size, image.manifest_id.clone())
            .annotate(ANNOTATION_REF_NAME, &target.tag);
        let retagged = Image {
            repository: target.name.clone(),
            tag: target.tag.clone(),
            ..image
        };
        let repository = self
            .repositories
            .entry(target.name.clone())
            .or_insert_with(|| Repository::new(&target.name));
        repository.index.set_tag(descriptor);
        repository.images.insert(target.tag.clone(), retagged);
        repository.save(&self.paths)?;
        self.save_distribution()?;
        Ok(())
    }

    /// Removal protocol: refuse when derived images (or scratch containers)
    /// sit on top; otherwise tear layers down top to bottom, sparing
    /// anything shared with another image, and update the repository index
    /// and distribution file last
    pub fn remove_image(&mut self, reference: &str) -> Result<()> {
        let image = self.get_image(reference)?.clone();
        if let Some(top) = image.top_layer() {
            if self.layers.is_parent(top) {
                return Err(ImageError::ImageInUse(image.name()));
            }
        }
        info!(image = %image.name(), "removing image");

        let manifest_references = self
            .all_images()
            .filter(|other| other.manifest_id == image.manifest_id)
            .count();
        if manifest_references <= 1 {
            for layer in image.layers.iter().rev() {
                if self.layer_node_shared(layer.node_id(), &image) {
                    break;
                }
                match self.layers.remove(layer) {
                    Ok(()) => {}
                    Err(ImageError::LayerInUse(_)) => break,
                    Err(error) => return Err(error),
                }
                if let Some(blob) = layer.blob() {
                    if !self.blob_shared(&blob.digest, &image) {
                        self.layers.unlink_blob(&blob.digest)?;
                    }
                }
            }
            if !self.config_shared(&image.config_id, &image) {
                let config_file = self.paths.config_file(&image.config_id);
                if config_file.exists() {
                    std::fs::remove_file(&config_file)?;
                }
            }
            let manifest_file = self.paths.manifest_file(&image.manifest_id);
            if manifest_file.exists() {
                std::fs::remove_file(&manifest_file)?;
            }
        }

        let repository = self
            .repositories
            .get_mut(&image.repository)
            .ok_or_else(|| ImageError::RepositoryUnknown(image.repository.clone()))?;
        repository.index.remove_tag(&image.tag);
        repository.images.remove(&image.tag);
        if repository.index.manifests.is_empty() {
            repository.delete_file(&self.paths)?;
            self.repositories.remove(&image.repository);
        } else {
            repository.save(&self.paths)?;
        }
        self.save_distribution()?;
        Ok(())
    }

    fn layer_node_shared(&self, node_id: &str, except: &Image) -> bool {
        self.all_images()
            .filter(|other| {
                !(other.repository == except.repository && other.tag == except.tag)
            })
            .any(|other| other.layers.iter().any(|layer| layer.node_id() == node_id))
    }

    fn blob_shared(&self, digest: &OciDigest, except: &Image) -> bool {
        self.all_images()
            .filter(|other| {
                !(other.repository == except.repository && other.tag == except.tag)
            })
            .any(|other| {
                other
                    .manifest
                    .layers
                    .iter()
                    .any(|descriptor| &descriptor.digest == digest)
            })
    }

    fn config_shared(&self, config_id: &OciDigest, except: &Image) -> bool {
        self.all_images()
            .filter(|other| {
                !(other.repository == except.repository && other.tag == except.tag)
            })
            .any(|other| &other.config_id == config_id)
    }

    /// Image summaries, newest first
    pub fn list_images(&self) -> Vec<ImageSummary> {
        let mut summaries: Vec<ImageSummary> = self
            .all_images()
            .map(|image| ImageSummary {
                repository: image.repository.clone(),
                tag: image.tag.clone(),
                id: image.manifest_id.clone(),
                short_id: image.short_id().to_string(),
                digest: image.digest().cloned(),
                created: image.created(),
                size: image.blob_size(),
            })
            .collect();
        summaries.sort_by(|a, b| b.created.cmp(&a.created));
        summaries
    }

    /// The canonical reverse-chronological history view of an image
    pub fn history(&self, reference: &str) -> Result<Vec<HistoryEntryView>> {
        let image = self.get_image(reference)?;
        Ok(history_view(image, &self.layers))
    }

    /// Write the image as an OCI layout into `dir`
    pub fn save_image(&self, reference: &str, dir: &Path) -> Result<()> {
        let image = self.get_image(reference)?;
        save::write_layout(&self.paths, image, dir)
    }

    /// Write the image as an OCI layout tarball at `tar_path`
    pub fn save_image_tar(&self, reference: &str, tar_path: &Path) -> Result<()> {
        let staging = self.staging_dir("save")?;
        let result = self
            .save_image(reference, &staging)
            .and_then(|_| archive::pack_dir(&staging, tar_path).map_err(ImageError::from));
        let _ = std::fs::remove_dir_all(&staging);
        result
    }

    /// Ingest an OCI layout (directory or tarball) under `reference`. The
    /// manifest and config bytes are preserved verbatim, so the loaded image
    /// keeps its ids; layers already materialized in the graph are reused.
    pub fn load_image(&mut self, input: &Path, reference: &str) -> Result<&Image> {
        let reference = ImageReference::from_str(reference)?;
        let staging;
        let dir: &Path = if input.is_dir() {
            input
        } else {
            staging = self.staging_dir("load")?;
            archive::unpack_file(input, &staging)?;
            &staging
        };
        let outcome = self.load_layout_dir(dir, &reference);
        if !input.is_dir() {
            let _ = std::fs::remove_dir_all(dir);
        }
        outcome?;
        self.get_image(&reference.to_string())
    }

    fn load_layout_dir(&mut self, dir: &Path, reference: &ImageReference) -> Result<()> {
        let layout = save::read_layout(dir)?;
        if self
            .repositories
            .get(&reference.name)
            .map(|repository| repository.images.contains_key(&reference.tag))
            .unwrap_or(false)
        {
            return Err(ImageError::ImageExists(reference.to_string()));
        }
        if layout.config.rootfs.diff_ids.len() != layout.manifest.layers.len() {
            return Err(ImageError::DanglingReference(
                "layout manifest layer count disagrees with its config".to_string(),
            ));
        }

        let mut layers: Vec<Layer> = Vec::with_capacity(layout.manifest.layers.len());
        for (diff_id, descriptor) in layout
            .config
            .rootfs
            .diff_ids
            .iter()
            .zip(layout.manifest.layers.iter())
        {
            if descriptor.media_type != OCI_LAYER_TAR_GZIP {
                return Err(ImageError::Unsupported(format!(
                    "layer media type ({})",
                    descriptor.media_type
                )));
            }
            let blob_source = layout.blobs_dir.join(descriptor.digest.encoded());
            if !blob_source.exists() {
                return Err(ImageError::MissingBlob(descriptor.digest.clone()));
            }
            if !self.layers.blob_exists(&descriptor.digest) {
                std::fs::copy(&blob_source, self.layers.blob_path(&descriptor.digest))?;
            }
            let blob = BlobRef {
                digest: descriptor.digest.clone(),
                size: descriptor.size,
                media_type: descriptor.media_type.clone(),
            };
            let existing = self
                .layers
                .graph()
                .find_by_diff(diff_id)
                .map(|node| node.id().to_string());
            let layer = match existing {
                Some(node_id) => {
                    debug!(diff = %diff_id, node = %node_id, "reusing materialized layer");
                    Layer::from_parts(&node_id, Some(diff_id.clone()), Some(blob))
                }
                None => self.materialize_layer(diff_id, blob, layers.last(), &blob_source)?,
            };
            layers.push(layer);
        }

        util::write_file_atomic(
            self.paths.manifest_file(&layout.manifest_descriptor.digest),
            &layout.manifest_bytes,
        )?;
        util::write_file_atomic(
            self.paths.config_file(&layout.manifest.config.digest),
            &layout.config_bytes,
        )?;

        let descriptor = Descriptor::new(
            OCI_MANIFEST,
            layout.manifest_bytes.len() as u64,
            layout.manifest_descriptor.digest.clone(),
        )
        .annotate(ANNOTATION_REF_NAME, &reference.tag);
        let image = Image {
            repository: reference.name.clone(),
            tag: reference.tag.clone(),
            manifest_id: layout.manifest_descriptor.digest.clone(),
            config_id: layout.manifest.config.digest.clone(),
            manifest: layout.manifest,
            config: layout.config,
            layers,
        };
        let repository = self
            .repositories
            .entry(reference.name.clone())
            .or_insert_with(|| Repository::new(&reference.name));
        repository.index.set_tag(descriptor);
        repository.images.insert(reference.tag.clone(), image);
        repository.save(&self.paths)?;
        self.save_distribution()?;
        info!(reference = %reference, "loaded image");
        Ok(())
    }

    /// Build the graph node for a blob fetched from a layout: decompress,
    /// verify the diff id, unpack, commit
    fn materialize_layer(
        &mut self,
        diff_id: &OciDigest,
        blob: BlobRef,
        parent: Option<&Layer>,
        blob_source: &Path,
    ) -> Result<Layer> {
        let node_id = self
            .layers
            .graph_mut()
            .create(parent.map(Layer::node_id))?;
        let staging_tar = self
            .paths
            .layers_dir()
            .join(format!(".tmp-{node_id}.tar"));
        let outcome = (|| -> Result<()> {
            let actual = archive::decompress_gz(blob_source, &staging_tar)?;
            if &actual != diff_id {
                return Err(ImageError::DigestMismatch {
                    expected: diff_id.to_string(),
                    actual: actual.to_string(),
                });
            }
            let mut file = std::fs::File::open(&staging_tar)?;
            self.layers.graph_mut().add_tar(&node_id, &mut file, None)?;
            self.layers.graph_mut().commit(&node_id)?;
            self.layers.graph_mut().set_diff(&node_id, diff_id)?;
            Ok(())
        })();
        let _ = std::fs::remove_file(&staging_tar);
        if let Err(error) = outcome {
            self.layers.abandon(&node_id);
            return Err(error);
        }
        Ok(Layer::from_parts(
            &node_id,
            Some(diff_id.clone()),
            Some(blob),
        ))
    }

    /// A writable scratch layer cloned from the image's top layer, for a
    /// container root filesystem
    pub fn new_scratch_layer(&mut self, image: &Image) -> Result<Layer> {
        let top = image
            .top_layer()
            .ok_or_else(|| ImageError::LayerUnknown(image.name()))?;
        let top = top.clone();
        self.layers.new_scratch(&top)
    }

    /// Destroy the graph node of a container's scratch layer
    pub fn remove_scratch_node(&mut self, node_id: &str) -> Result<()> {
        self.layers.remove_node(node_id)
    }

    /// Host path of the materialized tree behind `node_id`
    pub fn node_path(&self, node_id: &str) -> Result<PathBuf> {
        Ok(self.layers.graph().path(node_id)?.to_path_buf())
    }

    fn staging_dir(&self, label: &str) -> Result<PathBuf> {
        let dir = self
            .paths
            .root()
            .join(format!(".staging-{label}-{}", util::epoch_now_nano()));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}
