//! Narrow adapter over a host dataset service with snapshots and clones

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

pub mod zfs;

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub use crate::zfs::{ZfsClone, ZfsCreate, ZfsHandle, ZfsSnapshot};

#[macro_export]
macro_rules! env_or_default {
    ($env:expr, $default:expr) => {
        match option_env!($env) {
            Some(value) => value,
            None => $default,
        }
    };
}

#[derive(Error, Debug)]
pub enum DatasetError {
    #[error("fail to spawn dataset service process: {0}")]
    Spawn(std::io::Error),
    #[error("dataset command failed with exit code {code:?}, stderr: {stderr}")]
    CommandFailure { code: Option<i32>, stderr: String },
}

pub type Result<T> = std::result::Result<T, DatasetError>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatasetKind {
    Filesystem,
    Snapshot,
    All,
}

impl DatasetKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatasetKind::Filesystem => "filesystem",
            DatasetKind::Snapshot => "snapshot",
            DatasetKind::All => "all",
        }
    }
}

/// A property value as reported by the service, with the service's textual
/// conventions (`on`/`off`, `-` for absent, byte counts) decoded away
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PropertyValue {
    Bool(bool),
    Bytes(u64),
    Path(PathBuf),
    Text(String),
}

impl PropertyValue {
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PropertyValue::Bool(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<u64> {
        match self {
            PropertyValue::Bytes(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_path(&self) -> Option<&Path> {
        match self {
            PropertyValue::Path(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            PropertyValue::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }
}

/// Decode the raw value of `property` printed by the service, `None` when the
/// service reported the property as not present (`-`)
pub fn normalize_value(property: &str, raw: &str) -> Option<PropertyValue> {
    if raw == "-" {
        return None;
    }
    if raw == "on" {
        return Some(PropertyValue::Bool(true));
    }
    if raw == "off" {
        return Some(PropertyValue::Bool(false));
    }
    if property == "mountpoint" || property == "origin" || property == "name" {
        // `mountpoint` may also read `none` or `legacy`, keep those textual
        if raw.starts_with('/') {
            return Some(PropertyValue::Path(PathBuf::from(raw)));
        }
        return Some(PropertyValue::Text(raw.to_string()));
    }
    match raw.parse::<u64>() {
        Ok(number) => Some(PropertyValue::Bytes(number)),
        Err(_) => Some(PropertyValue::Text(raw.to_string())),
    }
}

/// The boundary to a snapshot-capable dataset service. Everything the engine
/// needs from the host filesystem goes through this trait so tests can stand
/// in a fake that scripts exit codes and stderr.
pub trait DatasetService {
    fn create(&self, request: ZfsCreate) -> Result<()>;

    fn clone_from(&self, request: ZfsClone) -> Result<()>;

    fn snapshot(&self, request: ZfsSnapshot) -> Result<()>;

    fn set_readonly(&self, dataset: &str, readonly: bool) -> Result<()>;

    fn set_mountpoint(&self, dataset: &str, mountpoint: &Path) -> Result<()>;

    fn set_property(&self, dataset: &str, property: &str, value: &str) -> Result<()>;

    fn get(&self, dataset: &str, property: &str) -> Result<Option<PropertyValue>>;

    fn destroy(&self, name: &str, recursive: bool, synchronous: bool) -> Result<()>;

    fn send(
        &self,
        snapshot: &str,
        sink: &mut dyn Write,
        from_snapshot: Option<&str>,
        recursive: bool,
    ) -> Result<()>;

    fn receive(&self, dataset: &str, source: &mut dyn Read) -> Result<()>;

    fn list(
        &self,
        root: &str,
        recursive: bool,
        kind: DatasetKind,
        properties: &[&str],
    ) -> Result<Vec<HashMap<String, Option<PropertyValue>>>>;

    fn exists(&self, name: &str) -> bool;

    fn is_filesystem(&self, name: &str) -> bool {
        matches!(
            self.get(name, "type"),
            Ok(Some(PropertyValue::Text(kind))) if kind == "filesystem"
        )
    }

    fn is_snapshot(&self, name: &str) -> bool {
        matches!(
            self.get(name, "type"),
            Ok(Some(PropertyValue::Text(kind))) if kind == "snapshot"
        )
    }
}
