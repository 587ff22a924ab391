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

use crate::digest::OciDigest;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const OCI_IMAGE_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const OCI_CONFIG: &str = "application/vnd.oci.image.config.v1+json";
pub const OCI_LAYER_TAR_GZIP: &str =
    "application/vnd.oci.image.layer.nondistributable.v1.tar+gzip";
pub const OCI_LAYER_ZFS_XZ: &str = "application/vnd.oci.image.layer.nondistributable.v1.zfs+xz";

pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

pub const OCI_LAYOUT_VERSION: &str = "1.0.0";

#[derive(PartialEq, Eq, Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub size: u64,
    pub digest: OciDigest,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    pub fn new(media_type: &str, size: u64, digest: OciDigest) -> Descriptor {
        Descriptor {
            media_type: media_type.to_string(),
            size,
            digest,
            annotations: BTreeMap::new(),
        }
    }

    pub fn annotate(mut self, key: &str, value: &str) -> Descriptor {
        self.annotations.insert(key.to_string(), value.to_string());
        self
    }

    /// The tag recorded on this descriptor, if any
    pub fn ref_name(&self) -> Option<&str> {
        self.annotations.get(ANNOTATION_REF_NAME).map(String::as_str)
    }
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ImageManifest {
    pub schema_version: u32,
    pub media_type: String,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

impl ImageManifest {
    pub fn new(config: Descriptor, layers: Vec<Descriptor>) -> ImageManifest {
        ImageManifest {
            schema_version: 2,
            media_type: OCI_MANIFEST.to_string(),
            config,
            layers,
        }
    }
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ImageIndex {
    pub schema_version: u32,
    pub media_type: String,
    pub manifests: Vec<Descriptor>,
}

impl Default for ImageIndex {
    fn default() -> ImageIndex {
        ImageIndex {
            schema_version: 2,
            media_type: OCI_IMAGE_INDEX.to_string(),
            manifests: Vec::new(),
        }
    }
}

impl ImageIndex {
    /// Locate the manifest descriptor carrying `tag` as its ref name
    pub fn find_tag(&self, tag: &str) -> Option<&Descriptor> {
        self.manifests
            .iter()
            .find(|descriptor| descriptor.ref_name() == Some(tag))
    }

    /// Insert `descriptor`, replacing any existing descriptor with the same
    /// ref name
    pub fn set_tag(&mut self, descriptor: Descriptor) {
        let tag = descriptor.ref_name().map(str::to_string);
        self.manifests
            .retain(|existing| existing.ref_name().map(str::to_string) != tag);
        self.manifests.push(descriptor);
    }

    pub fn remove_tag(&mut self, tag: &str) {
        self.manifests
            .retain(|descriptor| descriptor.ref_name() != Some(tag));
    }
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Clone, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ImageLayout {
    pub image_layout_version: String,
}

impl Default for ImageLayout {
    fn default() -> ImageLayout {
        ImageLayout {
            image_layout_version: OCI_LAYOUT_VERSION.to_string(),
        }
    }
}

/// The distribution file shape: the set of repository names present on disk
#[derive(PartialEq, Eq, Serialize, Deserialize, Clone, Debug, Default)]
pub struct RepositoryList {
    pub repositories: Vec<String>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "PascalCase")]
pub struct InnerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Clone, Debug)]
pub struct RootFs {
    #[serde(rename = "type")]
    pub typ: String,
    pub diff_ids: Vec<OciDigest>,
}

impl RootFs {
    pub fn layers(diff_ids: Vec<OciDigest>) -> RootFs {
        RootFs {
            typ: "layers".to_string(),
            diff_ids,
        }
    }
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Clone, Debug, Default)]
pub struct History {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_layer: Option<bool>,
}

impl History {
    pub fn is_empty_layer(&self) -> bool {
        self.empty_layer.unwrap_or(false)
    }
}

#[derive(PartialEq, Eq, Serialize, Deserialize, Clone, Debug)]
pub struct ImageConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    pub architecture: String,
    pub os: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub config: Option<InnerConfig>,
    pub rootfs: RootFs,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<History>,
}

impl ImageConfig {
    /// History entries that pair with layers, in order
    pub fn layered_history(&self) -> impl Iterator<Item = &History> {
        self.history.iter().filter(|item| !item.is_empty_layer())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_decode_image_config() {
        let doc = r#"
{
  "created": "2020-12-24T00:52:27.094774629Z",
  "architecture": "amd64",
  "os": "linux",
  "config": {
    "Env": [
      "PATH=/usr/sbin:/usr/bin:/sbin:/bin"
    ],
    "Cmd": ["/bin/sh"],
    "WorkingDir": "/"
  },
  "rootfs": {
    "type": "layers",
    "diff_ids": [
      "sha256:69c93d9f9e6b5a1083c2700797b203cd3258eaee33f83688a51edc715e21303e",
      "sha256:9c8b9e8235ecf05ff1b3c8282f080ed944f93cb0779d855394e72ad1dd7a2f9e"
    ]
  },
  "history": [
    {
      "created": "2020-12-17T15:05:18.886399847Z",
      "created_by": "/bin/sh -c #(nop) ADD file:6c75c85d1017 in / "
    },
    {
      "created": "2020-12-17T15:05:19.293721862Z",
      "created_by": "/bin/sh -c #(nop)  CMD [\"/bin/sh\"]",
      "empty_layer": true
    },
    {
      "created": "2020-12-17T15:05:21.204018073Z",
      "created_by": "/bin/sh -c #(nop) ADD file:73235ba7e613 in /tmp/ "
    }
  ]
}
        "#;
        let config: ImageConfig = serde_json::from_str(doc).expect("cannot decode oci config");
        assert_eq!(config.os, "linux");
        assert_eq!(config.rootfs.typ, "layers");
        assert_eq!(config.rootfs.diff_ids.len(), 2);
        assert_eq!(config.layered_history().count(), 2);
    }

    #[test]
    fn test_index_tag_management() {
        let digest = OciDigest::from_str(
            "sha256:deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef",
        )
        .unwrap();
        let other = OciDigest::from_str(
            "sha256:cafebabecafebabecafebabecafebabecafebabecafebabecafebabecafebabe",
        )
        .unwrap();
        let mut index = ImageIndex::default();
        index.set_tag(
            Descriptor::new(OCI_MANIFEST, 1, digest.clone()).annotate(ANNOTATION_REF_NAME, "latest"),
        );
        assert_eq!(index.find_tag("latest").map(|d| &d.digest), Some(&digest));

        index.set_tag(
            Descriptor::new(OCI_MANIFEST, 2, other.clone()).annotate(ANNOTATION_REF_NAME, "latest"),
        );
        assert_eq!(index.manifests.len(), 1);
        assert_eq!(index.find_tag("latest").map(|d| &d.digest), Some(&other));

        index.remove_tag("latest");
        assert!(index.manifests.is_empty());
    }

    #[test]
    fn test_compact_manifest_bytes() {
        let digest = OciDigest::from_str(
            "sha256:deadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeefdeadbeef",
        )
        .unwrap();
        let manifest = ImageManifest::new(
            Descriptor::new(OCI_CONFIG, 7, digest.clone()),
            vec![Descriptor::new(OCI_LAYER_TAR_GZIP, 11, digest)],
        );
        let bytes = serde_json::to_vec(&manifest).unwrap();
        // compact encoding: no spaces, stable field order
        assert!(bytes.starts_with(br#"{"schemaVersion":2,"mediaType""#));
        assert!(!bytes.contains(&b' '));
    }
}
