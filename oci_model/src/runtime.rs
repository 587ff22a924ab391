//! OCI runtime-spec documents: the container configuration handed to the
//! low-level runtime, and the state document it reports back

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

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const OCI_RUNTIME_VERSION: &str = "1.0.0";

pub const STATUS_CREATED: &str = "created";
pub const STATUS_RUNNING: &str = "running";
pub const STATUS_EXITED: &str = "exited";

#[derive(PartialEq, Eq, Serialize, Deserialize, Clone, Debug)]
pub struct Platform {
    pub os: String,
    pub arch: String,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Clone, Debug, Default)]
pub struct User {
    pub uid: u32,
    pub gid: u32,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Clone, Debug)]
pub struct Process {
    #[serde(default)]
    pub terminal: bool,
    #[serde(default)]
    pub user: User,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: Vec<String>,
    #[serde(default)]
    pub cwd: String,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Clone, Debug)]
pub struct Root {
    pub path: PathBuf,
    #[serde(default)]
    pub readonly: bool,
}

/// An OCI runtime configuration. All sections are optional on input
/// (user-supplied documents only carry what they want to override); the
/// engine always emits fully-populated documents.
#[derive(PartialEq, Eq, Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSpec {
    pub oci_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub process: Option<Process>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<Root>,
}

impl Default for RuntimeSpec {
    fn default() -> RuntimeSpec {
        RuntimeSpec {
            oci_version: OCI_RUNTIME_VERSION.to_string(),
            platform: None,
            hostname: None,
            process: None,
            root: None,
        }
    }
}

/// The state document reported by `runtime state <id>`
#[derive(PartialEq, Eq, Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oci_version: Option<String>,
    pub id: String,
    pub status: String,
    #[serde(alias = "bundlepath", skip_serializing_if = "Option::is_none")]
    pub bundle: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<i64>,
}

impl RuntimeState {
    pub fn is_running(&self) -> bool {
        self.status == STATUS_RUNNING
    }

    pub fn is_exited(&self) -> bool {
        self.status == STATUS_EXITED
    }
}
