//! Wrapper around the external `kicad-cli` format-upgrade tool.
//!
//! Legacy `.lib` sources are converted into current `.kicad_sym` text by
//! invoking `kicad-cli sym upgrade`; merged `.pretty` directories that held
//! legacy `.mod` footprints are normalized with `kicad-cli fp upgrade`. A
//! missing binary is a recoverable condition reported as
//! [`ImportError::ConversionUnavailable`] so the caller can fall back to
//! legacy-format merging or skip the symbol portion with a warning.

use crate::error::ImportError;
use anyhow::{anyhow, Context, Result};
use log::warn;
use regex::Regex;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub struct UpgradeTool {
    program: PathBuf,
}

impl Default for UpgradeTool {
    fn default() -> Self {
        Self::new()
    }
}

impl UpgradeTool {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("kicad-cli"),
        }
    }

    /// Points the wrapper at a specific executable instead of relying on
    /// `PATH` lookup.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Converts one symbol library file to the current format.
    pub fn upgrade_symbol_library(&self, input: &Path, output: &Path) -> Result<()> {
        let args: Vec<OsString> = vec![
            OsString::from("sym"),
            OsString::from("upgrade"),
            input.into(),
            OsString::from("-o"),
            output.into(),
        ];
        self.invoke_with_retry(&args)
    }

    /// Normalizes every footprint inside a `.pretty` directory in place.
    pub fn upgrade_footprint_library(&self, pretty_dir: &Path) -> Result<()> {
        let args: Vec<OsString> = vec![
            OsString::from("fp"),
            OsString::from("upgrade"),
            pretty_dir.into(),
        ];
        self.invoke_with_retry(&args)
    }

    /// One automatic retry on tool failure. An absent binary is not retried;
    /// it will not appear between attempts.
    fn invoke_with_retry(&self, args: &[OsString]) -> Result<()> {
        match self.invoke(args) {
            Ok(()) => Ok(()),
            Err(err) if is_unavailable(&err) => Err(err),
            Err(err) => {
                warn!(
                    "{} failed, retrying once: {err:#}",
                    self.program.display()
                );
                self.invoke(args)
            }
        }
    }

    fn invoke(&self, args: &[OsString]) -> Result<()> {
        let output = Command::new(&self.program)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output();

        let output = match output {
            Ok(output) => output,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ImportError::ConversionUnavailable.into());
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("launch {}", self.program.display()));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!(
                "{} upgrade failed: {}",
                self.program.display(),
                stderr.trim()
            ));
        }

        Ok(())
    }
}

/// Reads the `(version N)` integer from a symbol library header. Legacy
/// line-format libraries carry no such header and compare as older than any
/// current-format text.
pub fn library_version(text: &str) -> Option<u64> {
    let pattern = Regex::new(r"\(\s*version\s+(\d+)\s*\)").ok()?;
    let captures = pattern.captures(text)?;
    captures.get(1)?.as_str().parse().ok()
}

fn is_unavailable(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ImportError>(),
        Some(ImportError::ConversionUnavailable)
    )
}
