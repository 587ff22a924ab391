//! Subprocess adapter for the external low-level container runtime

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

use oci_model::runtime::RuntimeState;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::debug;

pub const RUNC_CMD: &str = zdataset::env_or_default!("ZOCI_RUNC_CMD", "runc");

#[derive(Error, Debug)]
pub enum RuncError {
    #[error("fail to spawn runtime process: {0}")]
    Spawn(std::io::Error),
    #[error("runtime command failed with exit code {code:?}, stderr: {stderr}")]
    CommandFailure { code: Option<i32>, stderr: String },
    #[error("runtime produced an unreadable state document: {0}")]
    BadState(serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RuncError>;

/// The calls the engine makes into the low-level runtime. Behind a trait so
/// tests can script statuses and exit codes without spawning anything.
pub trait ContainerRuntime {
    /// `runtime create <id> -b <bundle>`
    fn create(&self, runtime_id: &str, bundle: &Path) -> Result<()>;

    /// `runtime start <id>`
    fn start(&self, runtime_id: &str) -> Result<()>;

    /// `runtime delete [--force] <id>`
    fn delete(&self, runtime_id: &str, force: bool) -> Result<()>;

    /// `runtime state <id>`; `None` when the runtime does not know the
    /// container (it then reads as exited)
    fn state(&self, runtime_id: &str) -> Result<Option<RuntimeState>>;
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RuncHandle {
    executable: String,
}

impl Default for RuncHandle {
    fn default() -> RuncHandle {
        RuncHandle {
            executable: RUNC_CMD.to_string(),
        }
    }
}

impl RuncHandle {
    pub fn new(executable: &str) -> RuncHandle {
        RuncHandle {
            executable: executable.to_string(),
        }
    }

    fn use_command<F>(&self, f: F) -> Result<()>
    where
        F: FnOnce(&mut Command),
    {
        let mut command = Command::new(&self.executable);
        command.stdout(Stdio::null()).stderr(Stdio::piped());
        f(&mut command);
        debug!("running: {command:?}");
        let output = command.output().map_err(RuncError::Spawn)?;
        if output.status.success() {
            Ok(())
        } else {
            Err(RuncError::CommandFailure {
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            })
        }
    }
}

impl ContainerRuntime for RuncHandle {
    fn create(&self, runtime_id: &str, bundle: &Path) -> Result<()> {
        self.use_command(|c| {
            c.arg("create").arg(runtime_id).arg("-b").arg(bundle);
        })
    }

    fn start(&self, runtime_id: &str) -> Result<()> {
        self.use_command(|c| {
            c.arg("start").arg(runtime_id);
        })
    }

    fn delete(&self, runtime_id: &str, force: bool) -> Result<()> {
        self.use_command(|c| {
            c.arg("delete");
            if force {
                c.arg("--force");
            }
            c.arg(runtime_id);
        })
    }

    fn state(&self, runtime_id: &str) -> Result<Option<RuntimeState>> {
        let mut command = Command::new(&self.executable);
        command.arg("state").arg(runtime_id);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        debug!("running: {command:?}");
        let output = command.output().map_err(RuncError::Spawn)?;
        if !output.status.success() {
            // the runtime does not know this container
            return Ok(None);
        }
        let state = serde_json::from_slice(&output.stdout).map_err(RuncError::BadState)?;
        Ok(Some(state))
    }
}
