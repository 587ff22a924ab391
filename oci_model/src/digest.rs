//! Content ids and hashing used by the oci specification

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
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;
use thiserror::Error;

pub const SHA256_HEX_LEN: usize = 64;
pub const SHORT_ID_LEN: usize = 12;

#[derive(Error, Debug)]
pub enum DigestError {
    #[error("unknown digest algorithm in ({0})")]
    UnknownAlgorithm(String),
    #[error("incorrect digest length in ({0})")]
    BadLength(String),
    #[error("digest ({0}) contains non-hex characters")]
    BadCharacters(String),
}

/// A digest of the form `sha256:<64-hex-lower>`
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Hash)]
pub struct OciDigest(String);

impl OciDigest {
    pub fn new_unchecked(input: &str) -> OciDigest {
        OciDigest(input.to_string())
    }

    /// Wrap a bare 64-hex content id into its digest form
    pub fn from_content_id(content_id: &str) -> Result<OciDigest, DigestError> {
        format!("sha256:{content_id}").parse()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The content id: the digest with the algorithm prefix stripped
    pub fn encoded(&self) -> &str {
        &self.0[7..]
    }

    /// First 12 hex characters of the content id
    pub fn short_id(&self) -> &str {
        &self.encoded()[..SHORT_ID_LEN]
    }
}

impl AsRef<str> for OciDigest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for OciDigest {
    fn fmt(&self, fmt: &mut std::fmt::Formatter<'_>) -> Result<(), std::fmt::Error> {
        self.0.fmt(fmt)
    }
}

impl FromStr for OciDigest {
    type Err = DigestError;
    fn from_str(s: &str) -> Result<OciDigest, Self::Err> {
        let Some(encoded) = s.strip_prefix("sha256:") else {
            return Err(DigestError::UnknownAlgorithm(s.to_string()));
        };
        if encoded.len() != SHA256_HEX_LEN {
            return Err(DigestError::BadLength(s.to_string()));
        }
        if !is_hex(encoded) {
            return Err(DigestError::BadCharacters(s.to_string()));
        }
        Ok(OciDigest(s.to_string()))
    }
}

/// True when `input` consists only of lowercase hex digits
pub fn is_hex(input: &str) -> bool {
    !input.is_empty()
        && input
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

/// Encode bytes to lowercase hex stream representation
pub fn hex(bytes: impl AsRef<[u8]>) -> String {
    let slice = bytes.as_ref();
    let mut buf = String::with_capacity(slice.len() * 2);
    for byte in slice {
        const TBL: [char; 16] = [
            '0', '1', '2', '3', '4', '5', '6', '7', '8', '9', 'a', 'b', 'c', 'd', 'e', 'f',
        ];
        buf.push(TBL[(*byte >> 4) as usize]);
        buf.push(TBL[(*byte & 0x0f) as usize]);
    }
    buf
}

pub struct Hasher(Sha256);

impl Default for Hasher {
    fn default() -> Hasher {
        Hasher::sha256()
    }
}

impl Hasher {
    pub fn sha256() -> Hasher {
        Hasher(Sha256::new())
    }

    pub fn update(&mut self, bytes: impl AsRef<[u8]>) {
        self.0.update(&bytes);
    }

    /// Consume the hasher and generate the digest output in the form of
    /// sha256:{hex_digest}
    pub fn finalize(self) -> OciDigest {
        OciDigest(format!("sha256:{}", hex(self.0.finalize())))
    }
}

pub fn sha256_once(input: impl AsRef<[u8]>) -> OciDigest {
    let mut hasher = Hasher::sha256();
    hasher.update(input);
    hasher.finalize()
}

/// Digest a file's contents without slurping it into memory
pub fn sha256_file(path: impl AsRef<Path>) -> Result<OciDigest, std::io::Error> {
    let mut file = std::fs::File::open(path.as_ref())?;
    let mut hasher = Hasher::sha256();
    let mut buf = [0u8; 8192];
    loop {
        let nread = file.read(&mut buf)?;
        if nread == 0 {
            break;
        }
        hasher.update(&buf[..nread]);
    }
    Ok(hasher.finalize())
}

pub struct DigestWriter<W: Write> {
    sink: W,
    digest: Sha256,
    written: u64,
}

impl<W: Write> DigestWriter<W> {
    pub fn new(sink: W) -> DigestWriter<W> {
        DigestWriter {
            sink,
            digest: Sha256::new(),
            written: 0,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    pub fn consume(self) -> (W, OciDigest, u64) {
        let digest = OciDigest(format!("sha256:{}", hex(self.digest.finalize())));
        (self.sink, digest, self.written)
    }
}

impl<W: Write> Write for DigestWriter<W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, std::io::Error> {
        let size = self.sink.write(buf)?;
        self.digest.update(&buf[..size]);
        self.written += size as u64;
        Ok(size)
    }
    fn flush(&mut self) -> Result<(), std::io::Error> {
        self.sink.flush()
    }
}
