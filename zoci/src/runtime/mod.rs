//! The runtime record: prepared containers and orchestration of the external
//! low-level runtime

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

pub mod container;
pub mod runc;

pub use self::container::{Container, ContainerRecord};
pub use self::runc::{ContainerRuntime, RuncError, RuncHandle};

use crate::image::{Distribution, ImageError, StorePaths};
use crate::util::{self, Clock, Entropy};
use oci_model::runtime::{
    Platform, Process, Root, RuntimeSpec, RuntimeState, User, OCI_RUNTIME_VERSION, STATUS_CREATED,
    STATUS_EXITED, STATUS_RUNNING,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("container ({0}) is unknown")]
    ContainerUnknown(String),
    #[error("container ({0}) is running, can not remove without force")]
    ContainerRunning(String),
    #[error("container name ({0}) is already in use")]
    NameInUse(String),
    #[error("container ({0}) is in state ({1}), can not start")]
    CannotStart(String, String),
    #[error(transparent)]
    Image(#[from] ImageError),
    #[error(transparent)]
    Runc(#[from] RuncError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

#[derive(Serialize, Deserialize, Default)]
struct RuntimeFile {
    containers: Vec<String>,
}

pub struct CreateContainer<'a> {
    pub image: &'a str,
    pub name: Option<&'a str>,
    pub command: Option<Vec<String>>,
    pub workdir: Option<&'a str>,
}

impl<'a> CreateContainer<'a> {
    pub fn from_image(image: &'a str) -> CreateContainer<'a> {
        CreateContainer {
            image,
            name: None,
            command: None,
            workdir: None,
        }
    }
}

pub struct Runtime {
    paths: StorePaths,
    runner: Box<dyn ContainerRuntime>,
    clock: Box<dyn Clock>,
    entropy: Box<dyn Entropy>,
    containers: BTreeMap<String, Container>,
}

impl Runtime {
    /// Open the runtime record under `root`, creating `runtime.json` when it
    /// does not exist yet
    pub fn open(
        root: impl AsRef<Path>,
        runner: Box<dyn ContainerRuntime>,
        clock: Box<dyn Clock>,
        entropy: Box<dyn Entropy>,
    ) -> Result<Runtime> {
        let paths = StorePaths::new(root);
        std::fs::create_dir_all(paths.containers_dir())?;
        let mut runtime = Runtime {
            paths,
            runner,
            clock,
            entropy,
            containers: BTreeMap::new(),
        };
        runtime.load()?;
        Ok(runtime)
    }

    fn load(&mut self) -> Result<()> {
        let runtime_file = self.paths.runtime_file();
        let record: RuntimeFile = match std::fs::read(&runtime_file) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(_) => {
                let fresh = RuntimeFile::default();
                util::write_file_atomic(&runtime_file, &serde_json::to_vec(&fresh)?)?;
                fresh
            }
        };
        for id in record.containers.iter() {
            match self.load_container(id) {
                Ok(container) => {
                    self.containers.insert(id.clone(), container);
                }
                Err(error) => {
                    warn!(container = %id, "skipping unreadable container record: {error}");
                }
            }
        }
        Ok(())
    }

    fn load_container(&self, id: &str) -> Result<Container> {
        let dir = self.paths.containers_dir().join(id);
        let record: ContainerRecord =
            serde_json::from_slice(&std::fs::read(dir.join("container.json"))?)?;
        let spec: RuntimeSpec = serde_json::from_slice(&std::fs::read(dir.join("config.json"))?)?;
        Ok(Container::new(record, spec))
    }

    fn save(&self) -> Result<()> {
        let record = RuntimeFile {
            containers: self.containers.keys().cloned().collect(),
        };
        util::write_file_atomic(self.paths.runtime_file(), &serde_json::to_vec(&record)?)?;
        Ok(())
    }

    pub fn containers(&self) -> impl Iterator<Item = &Container> {
        self.containers.values()
    }

    /// Resolve a container reference: full id, 12-hex prefix, or name
    pub fn get_container(&self, reference: &str) -> Result<&Container> {
        if let Some(container) = self.containers.get(reference) {
            return Ok(container);
        }
        self.containers
            .values()
            .find(|container| {
                container.runtime_id() == reference || container.name() == reference
            })
            .ok_or_else(|| RuntimeError::ContainerUnknown(reference.to_string()))
    }

    /// The status the low-level runtime reports; a container it does not
    /// know reads as exited
    pub fn status(&self, container: &Container) -> Result<String> {
        Ok(self
            .runner
            .state(container.runtime_id())?
            .map(|state| state.status)
            .unwrap_or_else(|| STATUS_EXITED.to_string()))
    }

    /// The raw state document, when the runtime knows the container
    pub fn state(&self, reference: &str) -> Result<Option<RuntimeState>> {
        let container = self.get_container(reference)?;
        Ok(self.runner.state(container.runtime_id())?)
    }

    /// Create protocol: resolve the image, clone a scratch layer off its top
    /// layer, compose the runtime spec, persist the bundle, then ask the
    /// low-level runtime to create the container
    pub fn create_container(
        &mut self,
        images: &mut Distribution,
        request: CreateContainer,
    ) -> Result<&Container> {
        let image = images.get_image(request.image)?.clone();

        let mut id = util::gen_id(self.entropy.as_ref());
        while self.containers.contains_key(&id)
            || self
                .containers
                .values()
                .any(|container| container.runtime_id() == util::short_id(&id))
        {
            id = util::gen_id(self.entropy.as_ref());
        }
        let runtime_id = util::short_id(&id).to_string();

        let name = match request.name {
            Some(name) => {
                if self.containers.values().any(|c| c.name() == name) {
                    return Err(RuntimeError::NameInUse(name.to_string()));
                }
                name.to_string()
            }
            None => {
                let taken: Vec<String> = self
                    .containers
                    .values()
                    .map(|c| c.name().to_string())
                    .collect();
                util::generate_random_name(&taken)
            }
        };

        let scratch = images.new_scratch_layer(&image)?;
        let scratch_path = match images.node_path(scratch.node_id()) {
            Ok(path) => path,
            Err(error) => {
                images.remove_scratch_node(scratch.node_id()).ok();
                return Err(error.into());
            }
        };

        let inner = image.config.config.clone().unwrap_or_default();
        let args = request
            .command
            .or_else(|| inner.cmd.clone())
            .unwrap_or_else(|| vec!["/bin/sh".to_string()]);
        let cwd = request
            .workdir
            .map(str::to_string)
            .or_else(|| inner.working_dir.clone())
            .unwrap_or_else(|| "/".to_string());
        let spec = RuntimeSpec {
            oci_version: OCI_RUNTIME_VERSION.to_string(),
            platform: Some(Platform {
                os: image.config.os.clone(),
                arch: image.config.architecture.clone(),
            }),
            hostname: Some(runtime_id.clone()),
            process: Some(Process {
                terminal: true,
                user: User::default(),
                args,
                env: inner.env.clone().unwrap_or_default(),
                cwd,
            }),
            root: Some(Root {
                path: scratch_path,
                readonly: false,
            }),
        };

        let record = ContainerRecord {
            id: id.clone(),
            name,
            runtime_id: runtime_id.clone(),
            image_id: image.id().to_string(),
            diff_id: scratch.node_id().to_string(),
            create_time: self.clock.now(),
        };
        let container = Container::new(record, spec);

        let bundle = container.bundle_path(&self.paths.containers_dir());
        let outcome = (|| -> Result<()> {
            std::fs::create_dir_all(&bundle)?;
            std::fs::write(
                bundle.join("container.json"),
                serde_json::to_vec(container.record())?,
            )?;
            std::fs::write(
                bundle.join("config.json"),
                serde_json::to_vec(container.spec())?,
            )?;
            self.runner.create(&runtime_id, &bundle)?;
            Ok(())
        })();
        if let Err(error) = outcome {
            let _ = std::fs::remove_dir_all(&bundle);
            if let Err(cleanup) = images.remove_scratch_node(scratch.node_id()) {
                warn!(node = %scratch.node_id(), "could not clean up scratch node: {cleanup}");
            }
            return Err(error);
        }

        info!(container = %id, runtime_id = %runtime_id, image = %image.name(), "created container");
        self.containers.insert(id.clone(), container);
        self.save()?;
        self.get_container(&id)
    }

    /// Start a created container
    pub fn start_container(&mut self, reference: &str) -> Result<()> {
        let container = self.get_container(reference)?;
        let status = self.status(container)?;
        if status != STATUS_CREATED {
            return Err(RuntimeError::CannotStart(
                container.id().to_string(),
                status,
            ));
        }
        Ok(self.runner.start(container.runtime_id())?)
    }

    /// Remove protocol: an exited (or unknown) container is torn down
    /// directly; anything else needs `force`, which asks the runtime to
    /// delete first. The scratch node, the bundle directory, and the
    /// runtime file entry go last, in that order.
    pub fn remove_container(
        &mut self,
        images: &mut Distribution,
        reference: &str,
        force: bool,
    ) -> Result<()> {
        let container = self.get_container(reference)?;
        let id = container.id().to_string();
        let runtime_id = container.runtime_id().to_string();
        let scratch_node = container.scratch_node_id().to_string();
        let status = self.status(container)?;

        if status != STATUS_EXITED {
            if status == STATUS_RUNNING && !force {
                return Err(RuntimeError::ContainerRunning(id));
            }
            if let Err(error) = self.runner.delete(&runtime_id, status == STATUS_RUNNING) {
                warn!(container = %id, "runtime delete failed: {error}");
            }
        }

        images.remove_scratch_node(&scratch_node)?;
        let bundle = self.paths.containers_dir().join(&id);
        if bundle.exists() {
            std::fs::remove_dir_all(&bundle)?;
        }
        self.containers.remove(&id);
        self.save()?;
        info!(container = %id, "removed container");
        Ok(())
    }
}
