//! Build images from a Dockerfile subset: FROM, ADD/COPY, CMD, ENV, WORKDIR

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

use crate::image::{Distribution, ImageError, Layer, Result};
use crate::util;
use oci_model::models::{History, ImageConfig, InnerConfig, RootFs};
use oci_model::reference::ImageReference;
use pest::Parser;
use pest_derive::Parser;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

#[derive(Parser)]
#[grammar_inline = r#"
ws = _{ " " | "\t" }
keyword = { ASCII_ALPHA_UPPER+ }
arg = { (!ws ~ ANY)+ }
instruction = { SOI ~ keyword ~ (ws+ ~ arg)* ~ ws* ~ EOI }
"#]
struct DockerfileParser;

#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Instruction {
    pub(crate) keyword: String,
    pub(crate) args: Vec<String>,
}

/// Split a Dockerfile into instructions: comments and blank lines are
/// dropped, `\` continuations folded
pub(crate) fn parse_dockerfile(input: &str) -> Result<Vec<Instruction>> {
    let mut logical_lines: Vec<String> = Vec::new();
    let mut pending: Option<String> = None;
    for line in input.lines() {
        let trimmed = line.trim();
        if pending.is_none() && (trimmed.is_empty() || trimmed.starts_with('#')) {
            continue;
        }
        let (fragment, continued) = match trimmed.strip_suffix('\\') {
            Some(fragment) => (fragment.trim_end(), true),
            None => (trimmed, false),
        };
        let mut line = pending.take().unwrap_or_default();
        if !line.is_empty() {
            line.push(' ');
        }
        line.push_str(fragment);
        if continued {
            pending = Some(line);
        } else {
            logical_lines.push(line);
        }
    }
    if let Some(line) = pending {
        logical_lines.push(line);
    }

    let mut instructions = Vec::with_capacity(logical_lines.len());
    for line in logical_lines {
        let parsed = DockerfileParser::parse(Rule::instruction, &line)
            .map_err(|_| ImageError::DockerfileParse(format!("malformed command ({line})")))?;
        let root = parsed
            .into_iter()
            .next()
            .ok_or_else(|| ImageError::DockerfileParse(format!("malformed command ({line})")))?;
        let mut keyword = String::new();
        let mut args = Vec::new();
        for pair in root.into_inner() {
            match pair.as_rule() {
                Rule::keyword => keyword = pair.as_str().to_string(),
                Rule::arg => args.push(pair.as_str().to_string()),
                _ => {}
            }
        }
        instructions.push(Instruction { keyword, args });
    }
    Ok(instructions)
}

struct BuildState {
    started: bool,
    layers: Vec<Layer>,
    history: Vec<History>,
    env: Vec<String>,
    cmd: Option<Vec<String>>,
    cwd: Option<String>,
    os: Option<String>,
    arch: Option<String>,
}

impl BuildState {
    fn new() -> BuildState {
        BuildState {
            started: false,
            layers: Vec::new(),
            history: Vec::new(),
            env: Vec::new(),
            cmd: None,
            cwd: None,
            os: None,
            arch: None,
        }
    }
}

/// Build an image from `context/Dockerfile` (or `dockerfile` when given) and
/// register it under each of `tags`
pub fn build_image(
    images: &mut Distribution,
    context: &Path,
    dockerfile: Option<&Path>,
    tags: &[&str],
) -> Result<Vec<ImageReference>> {
    if tags.is_empty() {
        return Err(ImageError::DockerfileParse(
            "at least one tag is required".to_string(),
        ));
    }
    let references = tags
        .iter()
        .map(|tag| ImageReference::from_str(tag).map_err(ImageError::from))
        .collect::<Result<Vec<_>>>()?;

    let dockerfile_path = match dockerfile {
        Some(path) if path.is_absolute() => path.to_path_buf(),
        Some(path) => context.join(path),
        None => context.join("Dockerfile"),
    };
    let source = std::fs::read_to_string(&dockerfile_path).map_err(|_| {
        ImageError::DockerfileParse(format!("dockerfile ({}) does not exist", dockerfile_path.display()))
    })?;
    let instructions = parse_dockerfile(&source)?;

    let mut state = BuildState::new();
    for instruction in instructions.iter() {
        apply(images, context, &mut state, instruction)?;
    }
    if !state.started {
        return Err(ImageError::DockerfileParse(
            "missing FROM instruction".to_string(),
        ));
    }
    if state.layers.is_empty() {
        return Err(ImageError::DockerfileParse(
            "image has no layers".to_string(),
        ));
    }

    let mut diff_ids = Vec::with_capacity(state.layers.len());
    for layer in state.layers.iter() {
        diff_ids.push(layer.diff_digest().cloned().ok_or_else(|| {
            ImageError::Unsupported("scratch layer in a built image".to_string())
        })?);
    }
    let config = ImageConfig {
        created: Some(images.clock().now()),
        author: None,
        architecture: state
            .arch
            .unwrap_or_else(|| util::get_current_arch().to_string()),
        os: state.os.unwrap_or_else(|| util::get_current_os().to_string()),
        config: Some(InnerConfig {
            env: Some(if state.env.is_empty() {
                vec![crate::image::distribution::DEFAULT_ENV.to_string()]
            } else {
                state.env
            }),
            cmd: Some(state.cmd.unwrap_or_else(|| {
                vec![crate::image::distribution::DEFAULT_CMD.to_string()]
            })),
            working_dir: Some(state.cwd.unwrap_or_else(|| {
                crate::image::distribution::DEFAULT_WORKDIR.to_string()
            })),
            ..InnerConfig::default()
        }),
        rootfs: RootFs::layers(diff_ids),
        history: state.history,
    };

    let first = references[0].clone();
    images.register_image(&first, state.layers, config)?;
    for reference in references[1..].iter() {
        images.tag_image(&first.to_string(), &reference.to_string())?;
    }
    info!(tags = ?tags, "built image");
    Ok(references)
}

fn apply(
    images: &mut Distribution,
    context: &Path,
    state: &mut BuildState,
    instruction: &Instruction,
) -> Result<()> {
    match instruction.keyword.as_str() {
        "FROM" => from(images, state, instruction),
        "ADD" | "COPY" => add(images, context, state, instruction),
        "CMD" => {
            if instruction.args.is_empty() {
                return Err(ImageError::DockerfileParse("CMD needs arguments".to_string()));
            }
            state.cmd = Some(instruction.args.clone());
            state.history.push(History {
                created: Some(images.clock().now()),
                created_by: Some(format!(
                    "/bin/sh -c #(nop)  CMD [\"{}\"]",
                    instruction.args.join(" ")
                )),
                empty_layer: Some(true),
                ..History::default()
            });
            Ok(())
        }
        "ENV" => {
            let [assignment] = instruction.args.as_slice() else {
                return Err(ImageError::DockerfileParse(
                    "use ENV <key>=<value>".to_string(),
                ));
            };
            if !assignment.contains('=') {
                return Err(ImageError::DockerfileParse(
                    "use ENV <key>=<value>".to_string(),
                ));
            }
            state.env.push(assignment.clone());
            Ok(())
        }
        "WORKDIR" => {
            let [dir] = instruction.args.as_slice() else {
                return Err(ImageError::DockerfileParse("use WORKDIR <dir>".to_string()));
            };
            state.cwd = Some(dir.clone());
            Ok(())
        }
        "RUN" => Err(ImageError::Unsupported(
            "RUN instructions are not supported".to_string(),
        )),
        other => Err(ImageError::DockerfileParse(format!(
            "unrecognized command ({other})"
        ))),
    }
}

fn from(images: &mut Distribution, state: &mut BuildState, instruction: &Instruction) -> Result<()> {
    let [reference] = instruction.args.as_slice() else {
        return Err(ImageError::DockerfileParse("use FROM <image>".to_string()));
    };
    if state.started {
        return Err(ImageError::DockerfileParse(
            "FROM is allowed only once".to_string(),
        ));
    }
    state.started = true;
    if reference == "scratch" {
        return Ok(());
    }
    let image = images.get_image(reference)?.clone();
    state.layers = image.layers;
    state.history = image.config.history;
    state.os = Some(image.config.os);
    state.arch = Some(image.config.architecture);
    if let Some(inner) = image.config.config {
        state.env = inner.env.unwrap_or_default();
        state.cmd = inner.cmd;
        state.cwd = inner.working_dir;
    }
    Ok(())
}

fn add(
    images: &mut Distribution,
    context: &Path,
    state: &mut BuildState,
    instruction: &Instruction,
) -> Result<()> {
    if !state.started {
        return Err(ImageError::DockerfileParse(
            "ADD before FROM".to_string(),
        ));
    }
    let [source, dest] = instruction.args.as_slice() else {
        return Err(ImageError::DockerfileParse(
            "use ADD <file> <dir_or_file>".to_string(),
        ));
    };
    if !dest.starts_with('/') {
        return Err(ImageError::DockerfileParse(format!(
            "destination ({dest}) must be absolute"
        )));
    }
    let source_path = context.join(source);
    if !source_path.is_file() {
        return Err(ImageError::DockerfileParse(format!(
            "file ({source}) not found in context"
        )));
    }

    let parent = state.layers.last().cloned();
    let store = images.layers_mut();
    let node_id = store.begin(parent.as_ref())?;
    let layer = (|| -> Result<Layer> {
        let changed = store.ingest(&node_id, &source_path, Some(dest))?;
        let paths: Option<Vec<String>> = match changed {
            // a plain file: the diff is exactly the path written
            Some(relative) => Some(vec![relative.to_string_lossy().to_string()]),
            // a tar source: the diff is the subtree it unpacked into
            None => {
                let trimmed = dest.trim_matches('/');
                if trimmed.is_empty() {
                    None
                } else {
                    Some(vec![trimmed.to_string()])
                }
            }
        };
        store.seal(&node_id, paths.as_deref())
    })();
    let layer = match layer {
        Ok(layer) => layer,
        Err(error) => {
            store.abandon(&node_id);
            return Err(error);
        }
    };
    state.history.push(History {
        created: Some(images.clock().now()),
        created_by: Some(format!(
            "/bin/sh -c #(nop) ADD file:{source} in {dest} "
        )),
        ..History::default()
    });
    state.layers.push(layer);
    Ok(())
}
