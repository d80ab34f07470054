//! Footprint naming and the 3D-model reference rewrite.
//!
//! The rewrite is deliberately textual rather than parse-and-reserialize:
//! only the model path string and, when absent, one appended model block may
//! change. Every other byte of the footprint passes through untouched.

use crate::sexp;
use anyhow::{anyhow, Result};
use regex::Regex;

/// Name declared by the footprint content itself, from `(footprint "<name>"`
/// or the legacy `(module "<name>"`. Authoritative over the source file name.
pub fn footprint_name(content: &str) -> Option<String> {
    let pattern =
        Regex::new(r#"^\s*\(\s*(?:footprint|module)\s+(?:"((?:[^"\\]|\\.)*)"|([^\s()"]+))"#)
            .ok()?;
    let caps = pattern.captures(content)?;
    caps.get(1)
        .or_else(|| caps.get(2))
        .map(|m| m.as_str().to_string())
}

/// Filesystem-safe form of a component or footprint name.
pub fn clean_name(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|ch| {
            if matches!(ch, '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' | ' ') {
                '_'
            } else {
                ch
            }
        })
        .collect()
}

/// Points the footprint's 3D-model reference at `model_path`. Existing
/// `(model "…")` blocks keep their offset/scale/rotate customizations and
/// only the path string changes (every model block, if several). Without one,
/// an identity block is appended before the footprint's final closing paren.
pub fn link_model(content: &str, model_path: &str) -> Result<String> {
    let pattern = Regex::new(r#"(\(model[ \t\r\n]+)("(?:[^"\\]|\\.)*"|\S+)"#)?;
    if pattern.is_match(content) {
        return Ok(pattern
            .replace_all(content, |caps: &regex::Captures| {
                format!("{}\"{model_path}\"", &caps[1])
            })
            .into_owned());
    }

    let close = sexp::final_close_paren(content)
        .ok_or_else(|| anyhow!("footprint content has no closing paren"))?;
    let pad = " ".repeat(child_indent(content));
    let inner = format!("{pad}  ");
    let block = format!(
        "{pad}(model \"{model_path}\"\n{inner}(offset (xyz 0 0 0))\n{inner}(scale (xyz 1 1 1))\n{inner}(rotate (xyz 0 0 0))\n{pad})\n"
    );

    let mut out = String::with_capacity(content.len() + block.len());
    match content[..close].rfind('\n') {
        Some(newline) => {
            out.push_str(&content[..newline + 1]);
            out.push_str(&block);
            out.push_str(&content[newline + 1..]);
        }
        None => {
            out.push_str(&content[..close]);
            out.push('\n');
            out.push_str(&block);
            out.push_str(&content[close..]);
        }
    }
    Ok(out)
}

/// Leading whitespace of the footprint's first child line; the appended model
/// block adopts it.
fn child_indent(content: &str) -> usize {
    for line in content.lines().skip(1) {
        let trimmed = line.trim_start();
        if trimmed.starts_with('(') {
            return line.len() - trimmed.len();
        }
    }
    2
}
