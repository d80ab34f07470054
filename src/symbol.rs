//! Single-component extraction from symbol and description sources.
//!
//! Two source generations exist in the wild: the legacy line-oriented
//! `.lib`/`.dcm` formats and the current S-expression `.kicad_sym` format.
//! One extraction interface covers both, with the backend chosen by sniffing
//! the source text. Every backend enforces the same contract: the source must
//! hold exactly one component definition.

use crate::error::ImportError;
use crate::sexp;
use anyhow::{bail, Result};
use log::{debug, info};
use regex::Regex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SymbolFormat {
    /// Line-oriented `DEF … ENDDEF` library text.
    Legacy,
    /// S-expression `(kicad_symbol_lib …)` text.
    Current,
}

/// One component's symbol definition, cut out of its source library.
#[derive(Debug, Clone)]
pub struct SymbolBlock {
    /// Name declared in the definition itself; authoritative over any
    /// file-name hint.
    pub name: String,
    pub format: SymbolFormat,
    /// Comment run immediately preceding a legacy `DEF` line. Kept separate
    /// because it is only written when the entry is appended to an aggregate,
    /// not when it replaces an existing one.
    pub header: Option<String>,
    pub body: String,
}

/// One component's `.dcm` description entry.
#[derive(Debug, Clone)]
pub struct DescriptionBlock {
    pub name: String,
    pub header: Option<String>,
    pub body: String,
}

enum ScanState {
    Seeking,
    InComponent,
    Done,
}

/// Extracts the single component definition from symbol library text.
/// `hint` is the archive-derived device name, used for diagnostics only; the
/// name found in the content wins.
pub fn extract_symbol(text: &str, hint: &str) -> Result<SymbolBlock> {
    let block = if text.trim_start().starts_with('(') {
        extract_current_symbol(text, hint)?
    } else {
        extract_legacy_symbol(text, hint)?
    };
    if block.name != hint {
        debug!(
            "device name {} differs from archive hint {}, keeping {}",
            block.name, hint, block.name
        );
    }
    Ok(block)
}

fn extract_legacy_symbol(text: &str, hint: &str) -> Result<SymbolBlock> {
    let lines: Vec<&str> = text.lines().collect();
    let mut state = ScanState::Seeking;
    let mut header_start: Option<usize> = None;
    let mut start = 0usize;
    let mut end = 0usize;
    let mut name = String::new();

    for (idx, line) in lines.iter().enumerate() {
        match state {
            ScanState::Seeking => {
                if line.starts_with('#') {
                    if line.trim() == "#" && header_start.is_none() {
                        header_start = Some(idx);
                    }
                } else if let Some(rest) = line.strip_prefix("DEF ") {
                    match rest.split_whitespace().next() {
                        Some(found) => name = found.to_string(),
                        None => {
                            return Err(ImportError::ComponentNotFound {
                                source_name: hint.to_string(),
                            }
                            .into())
                        }
                    }
                    start = idx;
                    state = ScanState::InComponent;
                } else {
                    header_start = None;
                }
            }
            ScanState::InComponent => {
                if line.starts_with("DEF ") {
                    return Err(ImportError::MultipleComponents {
                        source_name: hint.to_string(),
                    }
                    .into());
                }
                if line.starts_with("ENDDEF") {
                    end = idx + 1;
                    state = ScanState::Done;
                }
            }
            ScanState::Done => {
                if line.starts_with("DEF ") {
                    return Err(ImportError::MultipleComponents {
                        source_name: hint.to_string(),
                    }
                    .into());
                }
            }
        }
    }

    match state {
        ScanState::Done => Ok(SymbolBlock {
            header: header_start.map(|first| join_lines(&lines[first..start])),
            body: join_lines(&lines[start..end]),
            name,
            format: SymbolFormat::Legacy,
        }),
        ScanState::InComponent => Err(ImportError::ComponentNotFound { source_name: name }.into()),
        ScanState::Seeking => Err(ImportError::ComponentNotFound {
            source_name: hint.to_string(),
        }
        .into()),
    }
}

fn extract_current_symbol(text: &str, hint: &str) -> Result<SymbolBlock> {
    let spans = sexp::entry_spans(text, "symbol");
    let span = match spans.len() {
        0 => {
            return Err(ImportError::ComponentNotFound {
                source_name: hint.to_string(),
            }
            .into())
        }
        1 => spans[0],
        _ => {
            return Err(ImportError::MultipleComponents {
                source_name: hint.to_string(),
            }
            .into())
        }
    };
    let body = &text[span.start..span.end];
    let name = match sexp::first_argument(body) {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => {
            return Err(ImportError::ComponentNotFound {
                source_name: hint.to_string(),
            }
            .into())
        }
    };
    Ok(SymbolBlock {
        name,
        format: SymbolFormat::Current,
        header: None,
        body: body.to_string(),
    })
}

/// Extracts the `$CMP … $ENDCMP` entry from `.dcm` text and renames it to
/// `device`. The entry's declared name must extend the device name; anything
/// else means the description belongs to a different part.
pub fn extract_description(text: &str, device: &str) -> Result<DescriptionBlock> {
    let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
    let mut state = ScanState::Seeking;
    let mut header_start: Option<usize> = None;
    let mut start = 0usize;
    let mut end = 0usize;

    for idx in 0..lines.len() {
        let line = lines[idx].clone();
        match state {
            ScanState::Seeking => {
                if line.starts_with('#') {
                    if line.trim() == "#" && header_start.is_none() {
                        header_start = Some(idx);
                    }
                } else if let Some(rest) = line.strip_prefix("$CMP ") {
                    let found = rest.trim();
                    if !found.starts_with(device) {
                        bail!("unexpected device {found} in description source");
                    }
                    lines[idx] = format!("$CMP {device}");
                    start = idx;
                    state = ScanState::InComponent;
                } else {
                    header_start = None;
                }
            }
            ScanState::InComponent => {
                if line.starts_with("$CMP ") {
                    return Err(ImportError::MultipleComponents {
                        source_name: device.to_string(),
                    }
                    .into());
                }
                if line.starts_with("$ENDCMP") {
                    end = idx + 1;
                    state = ScanState::Done;
                } else if let Some(rewritten) = normalize_attribute(&line) {
                    lines[idx] = rewritten;
                }
            }
            ScanState::Done => {
                if line.starts_with("$CMP ") {
                    return Err(ImportError::MultipleComponents {
                        source_name: device.to_string(),
                    }
                    .into());
                }
            }
        }
    }

    match state {
        ScanState::Done => {
            let borrowed: Vec<&str> = lines.iter().map(String::as_str).collect();
            Ok(DescriptionBlock {
                name: device.to_string(),
                header: header_start.map(|first| join_lines(&borrowed[first..start])),
                body: join_lines(&borrowed[start..end]),
            })
        }
        _ => Err(ImportError::ComponentNotFound {
            source_name: device.to_string(),
        }
        .into()),
    }
}

/// Collapses the separator of a `D <description>` or `F <datasheet>` line to
/// a single space. Bare `D`/`F` lines stay as they are.
fn normalize_attribute(line: &str) -> Option<String> {
    let (key, value) = line.split_once(char::is_whitespace)?;
    if key != "D" && key != "F" {
        return None;
    }
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    let normalized = format!("{key} {value}");
    (normalized != line).then_some(normalized)
}

/// Rewrites the symbol's footprint reference to `reference`
/// (`"<Vendor>:<footprint>"`). Legacy blocks carry it on the `F2` line;
/// current blocks in the `Footprint` property, which is added when missing.
pub fn set_footprint_reference(block: &mut SymbolBlock, reference: &str) -> Result<()> {
    match block.format {
        SymbolFormat::Legacy => {
            let pattern = Regex::new(r#"(?m)^(F2[ \t]+)("[^"]*"|\S+)"#)?;
            if pattern.is_match(&block.body) {
                block.body = pattern
                    .replacen(&block.body, 1, |caps: &regex::Captures| {
                        format!("{}\"{reference}\"", &caps[1])
                    })
                    .into_owned();
            } else {
                debug!("symbol {} has no F2 field to rewrite", block.name);
            }
        }
        SymbolFormat::Current => {
            let pattern = Regex::new(r#"(\(property[ \t\r\n]+"Footprint"[ \t\r\n]+)("(?:[^"\\]|\\.)*"|\S+)"#)?;
            if pattern.is_match(&block.body) {
                block.body = pattern
                    .replacen(&block.body, 1, |caps: &regex::Captures| {
                        format!("{}\"{reference}\"", &caps[1])
                    })
                    .into_owned();
            } else if let Some(close) = sexp::final_close_paren(&block.body) {
                info!("symbol {} has no Footprint property, adding one", block.name);
                let property = format!(
                    "  (property \"Footprint\" \"{reference}\" (at 0 0 0) (effects (font (size 1.27 1.27)) hide))\n"
                );
                block.body.insert_str(close, &property);
            }
        }
    }
    Ok(())
}

fn join_lines(lines: &[&str]) -> String {
    let mut joined = lines.join("\n");
    joined.push('\n');
    joined
}
