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

use pest::Parser;
use pest_derive::Parser;
use serde::de::{Deserializer, Unexpected};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use thiserror::Error;

pub const DEFAULT_TAG: &str = "latest";

#[derive(Parser)]
#[grammar_inline = r#"
alphanum = { ASCII_ALPHANUMERIC }
idchar = { (alphanum | "_") }
separator = { "__" | "." | "_" | "-"+ }
component = { alphanum ~ (separator? ~ alphanum)* }
name = { component ~ ("/" ~ component)* }
tag = { idchar ~ (idchar | "." | "-"){0,127} }
reference = { SOI ~ name ~ (":" ~ tag)? ~ EOI }
"#]
struct ImageReferenceParser;

#[derive(Error, Debug)]
#[error("cannot parse image reference ({0})")]
pub struct ReferenceParseError(pub String);

/// A local image reference of the form `repository[:tag]`; a missing tag
/// reads as `latest`
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ImageReference {
    pub name: String,
    pub tag: String,
}

impl ImageReference {
    pub fn new(name: &str, tag: &str) -> ImageReference {
        ImageReference {
            name: name.to_string(),
            tag: tag.to_string(),
        }
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.name, self.tag)
    }
}

impl FromStr for ImageReference {
    type Err = ReferenceParseError;

    fn from_str(input: &str) -> Result<ImageReference, Self::Err> {
        let parsed = ImageReferenceParser::parse(Rule::reference, input)
            .map_err(|_| ReferenceParseError(input.to_string()))?;
        let root = parsed
            .into_iter()
            .next()
            .ok_or_else(|| ReferenceParseError(input.to_string()))?;
        let mut inner = root.into_inner();
        let name = inner
            .next()
            .ok_or_else(|| ReferenceParseError(input.to_string()))?;
        let tag = inner
            .next()
            .filter(|pair| pair.as_rule() == Rule::tag)
            .map(|pair| pair.as_str().to_string())
            .unwrap_or_else(|| DEFAULT_TAG.to_string());
        Ok(ImageReference {
            name: name.as_str().to_string(),
            tag,
        })
    }
}

impl Serialize for ImageReference {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.to_string().as_str())
    }
}

impl<'de> Deserialize<'de> for ImageReference {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let string = String::deserialize(deserializer)?;
        string.parse::<Self>().map_err(|error| {
            serde::de::Error::invalid_value(Unexpected::Str(&string), &error.to_string().as_str())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_tag() {
        let reference = ImageReference::from_str("hello").unwrap();
        assert_eq!(reference.name, "hello");
        assert_eq!(reference.tag, "latest");
        assert_eq!(reference.to_string(), "hello:latest");
    }

    #[test]
    fn test_explicit_tag() {
        let reference = ImageReference::from_str("hello:dev").unwrap();
        assert_eq!(reference.name, "hello");
        assert_eq!(reference.tag, "dev");
    }

    #[test]
    fn test_multi_component_name() {
        let reference = ImageReference::from_str("my-org/base_images/busybox:1.36").unwrap();
        assert_eq!(reference.name, "my-org/base_images/busybox");
        assert_eq!(reference.tag, "1.36");
    }

    #[test]
    fn test_rejects_double_tag() {
        assert!(ImageReference::from_str("x:y:z").is_err());
    }

    #[test]
    fn test_rejects_garbage() {
        assert!(ImageReference::from_str("").is_err());
        assert!(ImageReference::from_str(":tag").is_err());
        assert!(ImageReference::from_str("name:").is_err());
        assert!(ImageReference::from_str("name with spaces").is_err());
    }

    #[test]
    fn test_roundtrip_serde() {
        let reference = ImageReference::from_str("hello:dev").unwrap();
        let json = serde_json::to_string(&reference).unwrap();
        assert_eq!(json, r#""hello:dev""#);
        let back: ImageReference = serde_json::from_str(&json).unwrap();
        assert_eq!(back, reference);
    }
}
