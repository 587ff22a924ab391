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

pub mod archive;

use chrono::{DateTime, TimeZone, Utc};
use oci_model::digest::hex;
use rand::Rng;
use std::cell::Cell;
use std::path::Path;

pub const ID_HEX_LEN: usize = 64;
pub const SHORT_ID_HEX_LEN: usize = 12;

/// Wall clock used for `created` timestamps. Injected so tests are
/// deterministic.
pub trait Clock {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock pinned to a single instant
pub struct FixedClock(pub DateTime<Utc>);

impl FixedClock {
    pub fn at_epoch_secs(secs: i64) -> FixedClock {
        FixedClock(
            Utc.timestamp_opt(secs, 0)
                .single()
                .unwrap_or(DateTime::<Utc>::MIN_UTC),
        )
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        self.0
    }
}

/// Source of 256-bit identifiers for graph nodes and containers
pub trait Entropy {
    fn id_bytes(&self) -> [u8; 32];
}

pub struct SystemEntropy;

impl Entropy for SystemEntropy {
    fn id_bytes(&self) -> [u8; 32] {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill(&mut bytes);
        bytes
    }
}

/// Hands out ids derived from an incrementing counter; every run produces the
/// same sequence
pub struct CountingEntropy {
    counter: Cell<u64>,
}

impl CountingEntropy {
    pub fn starting_at(value: u64) -> CountingEntropy {
        CountingEntropy {
            counter: Cell::new(value),
        }
    }
}

impl Default for CountingEntropy {
    fn default() -> CountingEntropy {
        CountingEntropy::starting_at(1)
    }
}

impl Entropy for CountingEntropy {
    fn id_bytes(&self) -> [u8; 32] {
        let value = self.counter.get();
        self.counter.set(value + 1);
        let mut bytes = [0u8; 32];
        bytes[24..].copy_from_slice(&value.to_be_bytes());
        // the low 48 bits also lead the id, so 12-hex short ids stay distinct
        bytes[..6].copy_from_slice(&value.to_be_bytes()[2..]);
        bytes
    }
}

/// Generate a fresh 64-hex identifier
pub fn gen_id(entropy: &dyn Entropy) -> String {
    hex(entropy.id_bytes())
}

pub fn short_id(id: &str) -> &str {
    &id[..SHORT_ID_HEX_LEN.min(id.len())]
}

pub fn is_hex_id(input: &str) -> bool {
    input.len() == ID_HEX_LEN && oci_model::digest::is_hex(input)
}

pub fn is_short_hex_id(input: &str) -> bool {
    input.len() == SHORT_ID_HEX_LEN && oci_model::digest::is_hex(input)
}

pub fn epoch_now_nano() -> u128 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_nanos())
        .unwrap_or(0)
}

pub fn get_current_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        otherwise => otherwise,
    }
}

pub fn get_current_os() -> &'static str {
    std::env::consts::OS
}

/// Write `bytes` next to `path` and rename into place, so readers never
/// observe a torn file
pub fn write_file_atomic(path: impl AsRef<Path>, bytes: &[u8]) -> Result<(), std::io::Error> {
    let path = path.as_ref();
    let file_name = path
        .file_name()
        .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "missing file name"))?
        .to_string_lossy()
        .to_string();
    let staging = path.with_file_name(format!(".tmp-{file_name}"));
    std::fs::write(&staging, bytes)?;
    std::fs::rename(&staging, path)
}

const NAMES_LEFT: &[&str] = &[
    "admiring", "adoring", "bold", "brave", "clever", "dazzling", "eager", "festive", "gallant",
    "happy", "jolly", "keen", "loving", "modest", "nifty", "quirky", "serene", "sharp",
    "vigilant", "zealous",
];

const NAMES_RIGHT: &[&str] = &[
    "albattani", "banach", "cartwright", "darwin", "euclid", "franklin", "galileo", "hamilton",
    "hopper", "hypatia", "kepler", "lovelace", "mclaren", "noether", "perlman", "ritchie",
    "swartz", "turing", "wilson", "wozniak",
];

/// Pick a human-friendly container name not present in `exclude`
pub fn generate_random_name(exclude: &[String]) -> String {
    let mut rng = rand::thread_rng();
    let mut retry = 0u32;
    loop {
        let mut name = format!(
            "{}_{}",
            NAMES_LEFT[rng.gen_range(0..NAMES_LEFT.len())],
            NAMES_RIGHT[rng.gen_range(0..NAMES_RIGHT.len())]
        );
        // Steve Wozniak is not boring
        if retry > 10 {
            name.push_str(&rng.gen_range(0..retry).to_string());
        }
        if !exclude.contains(&name) {
            return name;
        }
        retry += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counting_entropy_is_deterministic() {
        let a = CountingEntropy::default();
        let b = CountingEntropy::default();
        let first_a = gen_id(&a);
        let first_b = gen_id(&b);
        assert_eq!(first_a, first_b);
        assert_ne!(first_a, gen_id(&a));
    }

    #[test]
    fn test_gen_id_shape() {
        let id = gen_id(&SystemEntropy);
        assert!(is_hex_id(&id));
        assert!(is_short_hex_id(short_id(&id)));
    }

    #[test]
    fn test_random_name_respects_exclusions() {
        let mut exclude = Vec::new();
        for left in NAMES_LEFT {
            for right in NAMES_RIGHT {
                exclude.push(format!("{left}_{right}"));
            }
        }
        // every base combination is taken, generator must fall back to a
        // numbered name
        let name = generate_random_name(&exclude);
        assert!(!exclude.contains(&name));
    }
}
