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
use std::path::{Path, PathBuf};

fn default_root_dir() -> PathBuf {
    PathBuf::from("/var/lib/zoci")
}

fn default_graph_dataset() -> String {
    "zroot/zoci".to_string()
}

fn default_graph_mount_dir() -> PathBuf {
    PathBuf::from("/var/lib/zoci/graph")
}

fn default_zfs_executable() -> String {
    zdataset::zfs::ZFS_CMD.to_string()
}

fn default_runc_executable() -> String {
    crate::runtime::runc::RUNC_CMD.to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ZociConfig {
    /// Directory holding distribution.json, layers/, manifests/, configs/,
    /// repositories/, containers/ and runtime.json
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,
    /// Dataset all graph nodes live under
    #[serde(default = "default_graph_dataset")]
    pub graph_dataset: String,
    /// Directory node datasets are mounted under
    #[serde(default = "default_graph_mount_dir")]
    pub graph_mount_dir: PathBuf,
    #[serde(default = "default_zfs_executable")]
    pub zfs_executable: String,
    #[serde(default = "default_runc_executable")]
    pub runc_executable: String,
}

impl Default for ZociConfig {
    fn default() -> ZociConfig {
        ZociConfig {
            root_dir: default_root_dir(),
            graph_dataset: default_graph_dataset(),
            graph_mount_dir: default_graph_mount_dir(),
            zfs_executable: default_zfs_executable(),
            runc_executable: default_runc_executable(),
        }
    }
}

impl ZociConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<ZociConfig, std::io::Error> {
        let bytes = std::fs::read(path.as_ref())?;
        serde_json::from_slice(&bytes)
            .map_err(|error| std::io::Error::new(std::io::ErrorKind::InvalidData, error))
    }

    /// A configuration rooted at `root`, for stores that do not live at the
    /// system default location
    pub fn rooted(root: impl AsRef<Path>, graph_dataset: &str) -> ZociConfig {
        ZociConfig {
            root_dir: root.as_ref().to_path_buf(),
            graph_dataset: graph_dataset.to_string(),
            graph_mount_dir: root.as_ref().join("graph"),
            ..ZociConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config: ZociConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.root_dir, PathBuf::from("/var/lib/zoci"));
        assert_eq!(config.graph_dataset, "zroot/zoci");
        assert_eq!(config.graph_mount_dir, PathBuf::from("/var/lib/zoci/graph"));
    }

    #[test]
    fn test_partial_override() {
        let config: ZociConfig =
            serde_json::from_str(r#"{"graph_dataset":"tank/containers"}"#).unwrap();
        assert_eq!(config.graph_dataset, "tank/containers");
        assert_eq!(config.root_dir, PathBuf::from("/var/lib/zoci"));
    }
}
