//! Bridge to the external `easyeda2kicad` converter.
//!
//! EasyEDA parts are fetched by LCSC id instead of arriving as a zip, so the
//! whole conversion is delegated; this side only chooses the output library
//! prefix and reports tool availability clearly.

use anyhow::{anyhow, Context, Result};
use log::info;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

pub struct EasyedaImporter {
    program: PathBuf,
}

impl Default for EasyedaImporter {
    fn default() -> Self {
        Self::new()
    }
}

impl EasyedaImporter {
    pub fn new() -> Self {
        Self {
            program: PathBuf::from("easyeda2kicad"),
        }
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    /// Converts one component into `<lib_folder>/EasyEDA.*` aggregates.
    pub fn import(&self, lcsc_id: &str, lib_folder: &Path, overwrite: bool) -> Result<()> {
        let output = lib_folder.join("EasyEDA");
        let mut command = Command::new(&self.program);
        command
            .arg("--full")
            .arg("--lcsc_id")
            .arg(lcsc_id)
            .arg("--output")
            .arg(&output);
        if overwrite {
            command.arg("--overwrite");
        }

        let result = command
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .output();
        let result = match result {
            Ok(result) => result,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(anyhow!(
                    "easyeda2kicad is not installed; install it to import EasyEDA parts"
                ));
            }
            Err(err) => {
                return Err(err).with_context(|| format!("launch {}", self.program.display()))
            }
        };

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            return Err(anyhow!("easyeda2kicad failed: {}", stderr.trim()));
        }
        info!("imported EasyEDA component {lcsc_id}");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_tool_is_reported_clearly() {
        let dir = tempfile::tempdir().unwrap();
        let importer = EasyedaImporter::with_program("easyeda2kicad-definitely-not-installed");
        let err = importer.import("C123456", dir.path(), false).unwrap_err();
        assert!(err.to_string().contains("easyeda2kicad is not installed"));
    }
}
