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

use crate::{
    normalize_value, DatasetError, DatasetKind, DatasetService, PropertyValue, Result,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::debug;

pub const ZFS_CMD: &str = crate::env_or_default!("ZOCI_ZFS_CMD", "/sbin/zfs");

/// ZFS functionality is implemented by running commands, this struct defines
/// certain behaviours when the commands execute
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ZfsHandle {
    /// The command binary, by default whichever zfs binary the build selected
    executable: String,
    /// If the stdout and stderr should be piped for commands that do not rely
    /// on stdout/stderr to function correctly
    inherit_stdout: bool,
    inherit_stderr: bool,
}

impl Default for ZfsHandle {
    fn default() -> ZfsHandle {
        ZfsHandle {
            executable: ZFS_CMD.to_string(),
            inherit_stdout: false,
            inherit_stderr: false,
        }
    }
}

pub struct ZfsCreate {
    dataset: String,
    properties: Vec<(String, String)>,
    create_ancestors: bool,
    no_mount: bool,
}

impl ZfsCreate {
    /// Create a ZFS create template
    ///
    /// # Arguments
    ///
    /// * `dataset` - The dataset to be created
    /// * `create_ancestors` - Also create intermediate datasets
    /// * `no_mount` - Do not mount the created dataset
    pub fn new(dataset: &str, create_ancestors: bool, no_mount: bool) -> ZfsCreate {
        ZfsCreate {
            dataset: dataset.to_string(),
            create_ancestors,
            no_mount,
            properties: Vec::new(),
        }
    }

    pub fn insert_prop(&mut self, key: &str, value: &str) -> &mut ZfsCreate {
        self.properties.push((key.to_string(), value.to_string()));
        self
    }

    pub fn mountpoint(&mut self, path: impl AsRef<Path>) -> &mut ZfsCreate {
        self.insert_prop("mountpoint", &path.as_ref().to_string_lossy())
    }

    pub fn compression(&mut self, algorithm: &str) -> &mut ZfsCreate {
        self.insert_prop("compression", algorithm)
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn props(&self) -> &[(String, String)] {
        &self.properties
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["create".to_string()];
        if self.no_mount {
            args.push("-u".to_string());
        }
        if self.create_ancestors {
            args.push("-p".to_string());
        }
        for (key, value) in self.properties.iter() {
            args.push("-o".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(self.dataset.clone());
        args
    }
}

pub struct ZfsClone {
    snapshot: String,
    target: String,
    properties: Vec<(String, String)>,
}

impl ZfsClone {
    pub fn new(snapshot: &str, target: &str) -> ZfsClone {
        ZfsClone {
            snapshot: snapshot.to_string(),
            target: target.to_string(),
            properties: Vec::new(),
        }
    }

    pub fn insert_prop(&mut self, key: &str, value: &str) -> &mut ZfsClone {
        self.properties.push((key.to_string(), value.to_string()));
        self
    }

    pub fn mountpoint(&mut self, path: impl AsRef<Path>) -> &mut ZfsClone {
        self.insert_prop("mountpoint", &path.as_ref().to_string_lossy())
    }

    pub fn snapshot(&self) -> &str {
        &self.snapshot
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn props(&self) -> &[(String, String)] {
        &self.properties
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["clone".to_string()];
        for (key, value) in self.properties.iter() {
            args.push("-o".to_string());
            args.push(format!("{key}={value}"));
        }
        args.push(self.snapshot.clone());
        args.push(self.target.clone());
        args
    }
}

pub struct ZfsSnapshot {
    dataset: String,
    tag: String,
    recursive: bool,
}

impl ZfsSnapshot {
    pub fn new(dataset: &str, tag: &str) -> ZfsSnapshot {
        ZfsSnapshot {
            dataset: dataset.to_string(),
            tag: tag.to_string(),
            recursive: false,
        }
    }

    pub fn set_recursive(&mut self, recursive: bool) -> &mut ZfsSnapshot {
        self.recursive = recursive;
        self
    }

    pub fn dataset(&self) -> &str {
        &self.dataset
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn recursive(&self) -> bool {
        self.recursive
    }

    pub fn name(&self) -> String {
        format!("{}@{}", self.dataset, self.tag)
    }

    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["snapshot".to_string()];
        if self.recursive {
            args.push("-r".to_string());
        }
        args.push(self.name());
        args
    }
}

impl ZfsHandle {
    pub fn new(executable: &str, inherit_stdout: bool, inherit_stderr: bool) -> ZfsHandle {
        ZfsHandle {
            executable: executable.to_string(),
            inherit_stdout,
            inherit_stderr,
        }
    }

    fn use_command<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Command),
    {
        let mut command = Command::new(&self.executable);
        command.stdout(Stdio::null());
        f(&mut command);
        debug!("running: {command:?}");
        let output = command.output().map_err(DatasetError::Spawn)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(DatasetError::CommandFailure {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }

    fn use_command_with_output<F>(&self, f: F) -> Result<Vec<u8>>
    where
        F: FnOnce(&mut Command),
    {
        let mut command = Command::new(&self.executable);
        f(&mut command);
        debug!("running: {command:?}");
        let output = command.output().map_err(DatasetError::Spawn)?;
        if output.status.success() {
            Ok(output.stdout)
        } else {
            Err(DatasetError::CommandFailure {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }
}

impl DatasetService for ZfsHandle {
    fn create(&self, request: ZfsCreate) -> Result<()> {
        self.use_command(|c| {
            c.args(request.args());
        })
    }

    fn clone_from(&self, request: ZfsClone) -> Result<()> {
        self.use_command(|c| {
            c.args(request.args());
        })
    }

    fn snapshot(&self, request: ZfsSnapshot) -> Result<()> {
        self.use_command(|c| {
            c.args(request.args());
        })
    }

    fn set_readonly(&self, dataset: &str, readonly: bool) -> Result<()> {
        let value = if readonly { "on" } else { "off" };
        self.set_property(dataset, "readonly", value)
    }

    fn set_mountpoint(&self, dataset: &str, mountpoint: &Path) -> Result<()> {
        self.set_property(dataset, "mountpoint", &mountpoint.to_string_lossy())
    }

    fn set_property(&self, dataset: &str, property: &str, value: &str) -> Result<()> {
        self.use_command(|c| {
            c.arg("set").arg(format!("{property}={value}")).arg(dataset);
        })
    }

    fn get(&self, dataset: &str, property: &str) -> Result<Option<PropertyValue>> {
        let output = self.use_command_with_output(|c| {
            c.arg("get")
                .arg("-Hp")
                .arg("-o")
                .arg("value")
                .arg(property)
                .arg(dataset);
        })?;
        let raw = String::from_utf8_lossy(&output);
        Ok(normalize_value(property, raw.trim()))
    }

    fn destroy(&self, name: &str, recursive: bool, synchronous: bool) -> Result<()> {
        self.use_command(|c| {
            c.arg("destroy");
            if recursive {
                c.arg("-r");
            }
            if synchronous {
                c.arg("-s");
            }
            c.arg(name);
        })
    }

    fn send(
        &self,
        snapshot: &str,
        sink: &mut dyn Write,
        from_snapshot: Option<&str>,
        recursive: bool,
    ) -> Result<()> {
        let mut command = Command::new(&self.executable);
        command.arg("send");
        if recursive {
            command.arg("-R");
        }
        if let Some(origin) = from_snapshot {
            command.arg("-I").arg(origin);
        }
        command.arg(snapshot);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        debug!("running: {command:?}");
        let mut child = command.spawn().map_err(DatasetError::Spawn)?;
        if let Some(mut stdout) = child.stdout.take() {
            std::io::copy(&mut stdout, sink).map_err(DatasetError::Spawn)?;
        }
        let output = child.wait_with_output().map_err(DatasetError::Spawn)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(DatasetError::CommandFailure {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }

    fn receive(&self, dataset: &str, source: &mut dyn Read) -> Result<()> {
        let mut command = Command::new(&self.executable);
        command.arg("receive").arg(dataset);
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        debug!("running: {command:?}");
        let mut child = command.spawn().map_err(DatasetError::Spawn)?;
        if let Some(mut stdin) = child.stdin.take() {
            std::io::copy(source, &mut stdin).map_err(DatasetError::Spawn)?;
        }
        let output = child.wait_with_output().map_err(DatasetError::Spawn)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(DatasetError::CommandFailure {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }

    fn list(
        &self,
        root: &str,
        recursive: bool,
        kind: DatasetKind,
        properties: &[&str],
    ) -> Result<Vec<HashMap<String, Option<PropertyValue>>>> {
        let output = self.use_command_with_output(|c| {
            c.arg("list").arg("-Hp");
            if recursive {
                c.arg("-r");
            }
            c.arg("-t").arg(kind.as_str());
            c.arg("-o").arg(properties.join(","));
            c.arg(root);
        })?;
        let stdout = String::from_utf8_lossy(&output);
        let mut rows = Vec::new();
        for line in stdout.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            let mut row = HashMap::new();
            for (property, raw) in properties.iter().zip(line.split('\t')) {
                row.insert(property.to_string(), normalize_value(property, raw));
            }
            rows.push(row);
        }
        Ok(rows)
    }

    fn exists(&self, name: &str) -> bool {
        Command::new(&self.executable)
            .arg("list")
            .arg(name)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }
}
