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

use chrono::{DateTime, Utc};
use oci_model::runtime::RuntimeSpec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The index metadata persisted as `containers/<id>/container.json`
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ContainerRecord {
    pub id: String,
    pub name: String,
    pub runtime_id: String,
    pub image_id: String,
    /// Graph node of the writable scratch layer
    pub diff_id: String,
    pub create_time: DateTime<Utc>,
}

/// A prepared container: an image reference, a scratch node, and the runtime
/// configuration handed to the low-level runtime
#[derive(Clone, Debug)]
pub struct Container {
    record: ContainerRecord,
    spec: RuntimeSpec,
}

impl Container {
    pub(crate) fn new(record: ContainerRecord, spec: RuntimeSpec) -> Container {
        Container { record, spec }
    }

    pub fn id(&self) -> &str {
        &self.record.id
    }

    /// The 12-hex identifier handed to the low-level runtime
    pub fn runtime_id(&self) -> &str {
        &self.record.runtime_id
    }

    pub fn name(&self) -> &str {
        &self.record.name
    }

    pub fn image_id(&self) -> &str {
        &self.record.image_id
    }

    pub fn scratch_node_id(&self) -> &str {
        &self.record.diff_id
    }

    pub fn created(&self) -> DateTime<Utc> {
        self.record.create_time
    }

    pub fn spec(&self) -> &RuntimeSpec {
        &self.spec
    }

    pub fn record(&self) -> &ContainerRecord {
        &self.record
    }

    /// The bundle directory handed to the runtime's `create`
    pub fn bundle_path(&self, containers_dir: &Path) -> PathBuf {
        containers_dir.join(&self.record.id)
    }
}
