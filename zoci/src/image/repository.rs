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
use crate::image::image::Image;
use crate::image::{Result, StorePaths};
use crate::util::write_file_atomic;
use oci_model::models::ImageIndex;
use std::collections::BTreeMap;

/// A named repository: its on-disk OCI index plus the images resolved from
/// it, keyed by tag
#[derive(Debug)]
pub struct Repository {
    pub name: String,
    pub index: ImageIndex,
    pub images: BTreeMap<String, Image>,
}

impl Repository {
    pub fn new(name: &str) -> Repository {
        Repository {
            name: name.to_string(),
            index: ImageIndex::default(),
            images: BTreeMap::new(),
        }
    }

    /// Read `repositories/<name>.json` and resolve every tagged manifest
    pub(crate) fn load(paths: &StorePaths, graph: &GraphDriver, name: &str) -> Result<Repository> {
        let bytes = std::fs::read(paths.repository_file(name))?;
        let index: ImageIndex = serde_json::from_slice(&bytes)?;
        let mut images = BTreeMap::new();
        for descriptor in index.manifests.iter() {
            let Some(tag) = descriptor.ref_name() else {
                continue;
            };
            let image = Image::load(paths, graph, name, tag, &descriptor.digest)?;
            images.insert(tag.to_string(), image);
        }
        Ok(Repository {
            name: name.to_string(),
            index,
            images,
        })
    }

    pub(crate) fn save(&self, paths: &StorePaths) -> Result<()> {
        let file = paths.repository_file(&self.name);
        if let Some(parent) = file.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec(&self.index)?;
        write_file_atomic(&file, &bytes)?;
        Ok(())
    }

    pub(crate) fn delete_file(&self, paths: &StorePaths) -> Result<()> {
        let file = paths.repository_file(&self.name);
        if file.exists() {
            std::fs::remove_file(&file)?;
        }
        Ok(())
    }

    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.images.keys().map(String::as_str)
    }
}
