//! Registration of imported libraries with an existing KiCad configuration.
//!
//! Operates on an explicitly supplied config directory; this tool never
//! discovers KiCad's paths on its own. Library tables are edited the same
//! way aggregates are merged: a textual insert before the closing paren,
//! validated by parsing, written via temp-then-rename.

use crate::merge;
use crate::sexp::{self, SExp};
use anyhow::{Context, Result};
use log::info;
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};

const SYM_TABLE: &str = "sym-lib-table";
const FP_TABLE: &str = "fp-lib-table";
const COMMON_JSON: &str = "kicad_common.json";

pub struct KicadSettings {
    config_dir: PathBuf,
}

impl KicadSettings {
    pub fn new(config_dir: impl Into<PathBuf>) -> Self {
        Self {
            config_dir: config_dir.into(),
        }
    }

    /// Adds a `(lib …)` entry to `sym-lib-table`. Returns `false` when an
    /// entry with that name already exists (left untouched).
    pub fn register_symbol_library(&self, name: &str, uri: &str) -> Result<bool> {
        self.register(SYM_TABLE, "sym_lib_table", name, uri)
    }

    /// Adds a `(lib …)` entry to `fp-lib-table`. Returns `false` when an
    /// entry with that name already exists.
    pub fn register_footprint_library(&self, name: &str, uri: &str) -> Result<bool> {
        self.register(FP_TABLE, "fp_lib_table", name, uri)
    }

    fn register(&self, file_name: &str, root_tag: &str, name: &str, uri: &str) -> Result<bool> {
        let path = self.config_dir.join(file_name);
        let text = if path.exists() {
            fs::read_to_string(&path)
                .with_context(|| format!("read library table {}", path.display()))?
        } else {
            format!("({root_tag}\n)\n")
        };

        let table = SExp::parse(&text)
            .with_context(|| format!("parse library table {}", path.display()))?;
        let present = table
            .children("lib")
            .any(|lib| lib.child_value("name") == Some(name));
        if present {
            info!("library {name} is already registered in {file_name}");
            return Ok(false);
        }

        let close = sexp::final_close_paren(&text)
            .with_context(|| format!("library table {} has no closing paren", path.display()))?;
        let entry = format!(
            "  (lib (name \"{name}\")(type \"KiCad\")(uri \"{uri}\")(options \"\")(descr \"\"))\n"
        );
        let mut updated = String::with_capacity(text.len() + entry.len());
        match text[..close].rfind('\n') {
            Some(newline) => {
                updated.push_str(&text[..newline + 1]);
                updated.push_str(&entry);
                updated.push_str(&text[newline + 1..]);
            }
            None => {
                updated.push_str(&text[..close]);
                updated.push('\n');
                updated.push_str(&entry);
                updated.push_str(&text[close..]);
            }
        }
        merge::write_atomic(&path, &updated)?;
        info!("registered library {name} in {file_name}");
        Ok(true)
    }

    pub fn get_global_path_variable(&self, name: &str) -> Result<Option<String>> {
        let path = self.config_dir.join(COMMON_JSON);
        if !path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("read {}", path.display()))?;
        let document: Value = serde_json::from_str(&raw)
            .with_context(|| format!("parse {}", path.display()))?;
        Ok(document
            .pointer(&format!("/environment/vars/{name}"))
            .and_then(Value::as_str)
            .map(str::to_string))
    }

    /// Sets one `environment.vars` entry, preserving every unrelated key in
    /// the document.
    pub fn set_global_path_variable(&self, name: &str, value: &str) -> Result<()> {
        let path = self.config_dir.join(COMMON_JSON);
        let mut document: Value = if path.exists() {
            let raw = fs::read_to_string(&path)
                .with_context(|| format!("read {}", path.display()))?;
            serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?
        } else {
            json!({})
        };

        let environment = document
            .as_object_mut()
            .context("kicad_common.json is not a JSON object")?
            .entry("environment")
            .or_insert_with(|| json!({}));
        let vars = environment
            .as_object_mut()
            .context("environment is not a JSON object")?
            .entry("vars")
            .or_insert_with(|| json!({}));
        vars.as_object_mut()
            .context("environment.vars is not a JSON object")?
            .insert(name.to_string(), Value::String(value.to_string()));

        let raw = serde_json::to_string_pretty(&document).context("serialize kicad_common.json")?;
        merge::write_atomic(&path, &raw)?;
        info!("set path variable {name} = {value}");
        Ok(())
    }
}
