//! Tar and compression helpers backing diffs and blobs

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

use flate2::write::GzEncoder;
use flate2::Compression;
use oci_model::digest::{DigestWriter, Hasher, OciDigest};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::debug;

pub const TAR_CMD: &str = zdataset::env_or_default!("ZOCI_TAR_CMD", "tar");

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("fail to spawn archive process: {0}")]
    Spawn(std::io::Error),
    #[error("archive command failed with exit code {code:?}, stderr: {stderr}")]
    CommandFailure { code: Option<i32>, stderr: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

fn run_tar(args: &[&str], stdin: Option<&mut dyn Read>) -> Result<()> {
    let mut command = Command::new(TAR_CMD);
    command.args(args);
    command.stdout(Stdio::null()).stderr(Stdio::piped());
    if stdin.is_some() {
        command.stdin(Stdio::piped());
    } else {
        command.stdin(Stdio::null());
    }
    debug!("running: {command:?}");
    let mut child = command.spawn().map_err(ArchiveError::Spawn)?;
    if let Some(source) = stdin {
        if let Some(mut sink) = child.stdin.take() {
            std::io::copy(source, &mut sink)?;
        }
    }
    let output = child.wait_with_output().map_err(ArchiveError::Spawn)?;
    if output.status.success() {
        Ok(())
    } else {
        Err(ArchiveError::CommandFailure {
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }
}

/// Pack the entire contents of `dir` into `tar_file`. Entries are the
/// children of `dir`, in sorted order so identical trees produce identical
/// archives.
pub fn pack_dir(dir: impl AsRef<Path>, tar_file: impl AsRef<Path>) -> Result<()> {
    let mut entries = Vec::new();
    for entry in std::fs::read_dir(dir.as_ref())? {
        entries.push(entry?.file_name().to_string_lossy().to_string());
    }
    entries.sort();
    pack_paths(dir, &entries, tar_file)
}

/// Pack the named `paths` (relative to `dir`) into `tar_file`
pub fn pack_paths(
    dir: impl AsRef<Path>,
    paths: &[String],
    tar_file: impl AsRef<Path>,
) -> Result<()> {
    let dir = dir.as_ref().to_string_lossy().to_string();
    let tar_file = tar_file.as_ref().to_string_lossy().to_string();
    let mut args = vec!["-c", "-f", tar_file.as_str(), "-C", dir.as_str()];
    if paths.is_empty() {
        // an empty tree still yields a valid, empty-ish archive
        args.push(".");
        return run_tar(&args, None);
    }
    for path in paths {
        args.push(path.as_str());
    }
    run_tar(&args, None)
}

pub fn unpack_file(tar_file: impl AsRef<Path>, dir: impl AsRef<Path>) -> Result<()> {
    std::fs::create_dir_all(dir.as_ref())?;
    let tar_file = tar_file.as_ref().to_string_lossy().to_string();
    let dir = dir.as_ref().to_string_lossy().to_string();
    run_tar(&["-x", "-f", tar_file.as_str(), "-C", dir.as_str()], None)
}

pub fn unpack_stream(source: &mut dyn Read, dir: impl AsRef<Path>) -> Result<()> {
    std::fs::create_dir_all(dir.as_ref())?;
    let dir = dir.as_ref().to_string_lossy().to_string();
    run_tar(&["-x", "-f", "-", "-C", dir.as_str()], Some(source))
}

/// Copy a regular file into `dir`. `dest` is interpreted relative to `dir`
/// even when written absolute; a trailing slash selects a directory to place
/// the file under its own name.
pub fn copy_into(
    source: impl AsRef<Path>,
    dir: impl AsRef<Path>,
    dest: Option<&str>,
) -> Result<PathBuf> {
    let source = source.as_ref();
    let file_name = source
        .file_name()
        .ok_or_else(|| {
            ArchiveError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "source has no file name",
            ))
        })?
        .to_string_lossy()
        .to_string();
    let relative = match dest {
        None => file_name,
        Some(dest) => {
            let trimmed = dest.trim_start_matches('/');
            if dest.ends_with('/') || trimmed.is_empty() {
                format!("{trimmed}{file_name}")
            } else {
                trimmed.to_string()
            }
        }
    };
    let target = dir.as_ref().join(&relative);
    if let Some(parent) = target.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::copy(source, &target)?;
    Ok(PathBuf::from(relative))
}

/// Bytes used by the tree rooted at `dir`, symlinks not followed
pub fn directory_size(dir: impl AsRef<Path>) -> Result<u64> {
    let mut total = 0u64;
    let mut stack = vec![dir.as_ref().to_path_buf()];
    while let Some(current) = stack.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let meta = entry.path().symlink_metadata()?;
            if meta.is_dir() {
                stack.push(entry.path());
            } else {
                total += meta.len();
            }
        }
    }
    Ok(total)
}

pub struct CompressedBlob {
    /// Digest of the bytes fed in (the diff id when compressing a diff
    /// archive)
    pub source_digest: OciDigest,
    /// Digest of the compressed output (the blob id)
    pub blob_digest: OciDigest,
    /// Size of the compressed output file
    pub blob_size: u64,
}

/// Gzip-compress `source` into `target`, hashing both sides of the stream in
/// one pass
pub fn compress_file_gz(source: impl AsRef<Path>, target: impl AsRef<Path>) -> Result<CompressedBlob> {
    let mut input = std::fs::File::open(source.as_ref())?;
    let output = std::fs::File::create(target.as_ref())?;
    let mut source_hasher = Hasher::sha256();
    let mut encoder = GzEncoder::new(DigestWriter::new(output), Compression::default());
    let mut buf = [0u8; 8192];
    loop {
        let nread = input.read(&mut buf)?;
        if nread == 0 {
            break;
        }
        source_hasher.update(&buf[..nread]);
        encoder.write_all(&buf[..nread])?;
    }
    let writer = encoder.finish()?;
    let (file, blob_digest, blob_size) = writer.consume();
    file.sync_all()?;
    Ok(CompressedBlob {
        source_digest: source_hasher.finalize(),
        blob_digest,
        blob_size,
    })
}

/// Decompress a gzip blob into `target`, returning the digest of the
/// decompressed bytes
pub fn decompress_gz(source: impl AsRef<Path>, target: impl AsRef<Path>) -> Result<OciDigest> {
    let input = std::fs::File::open(source.as_ref())?;
    let output = std::fs::File::create(target.as_ref())?;
    let mut decoder = flate2::read::GzDecoder::new(input);
    let mut writer = DigestWriter::new(output);
    std::io::copy(&mut decoder, &mut writer)?;
    let (_, digest, _) = writer.consume();
    Ok(digest)
}
