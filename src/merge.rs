//! Aggregate library merging.
//!
//! One component entry goes into a possibly large per-vendor aggregate file.
//! Legacy line formats are streamed line-by-line past the entry boundaries;
//! the current S-expression format is spliced by depth-balanced spans. Either
//! way the rewrite lands in a sibling temp file first and the final
//! `fs::rename` is the only operation that touches the aggregate itself, so
//! an interrupted merge always leaves the previous contents intact.

use crate::error::ImportError;
use crate::sexp;
use anyhow::{bail, Context, Result};
use log::info;
use regex::Regex;
use std::ffi::OsString;
use std::fmt;
use std::fs;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

const SYM_SKELETON: &str = "(kicad_symbol_lib (version 20211014) (generator partforge)\n)\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Entry already present and overwrite is disabled; aggregate untouched.
    Skipped,
    /// Aggregate did not exist before this merge.
    Created,
    /// Existing entry replaced in place.
    Updated,
    /// New entry appended to an existing aggregate.
    Added,
}

impl fmt::Display for MergeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = match self {
            MergeOutcome::Skipped => "skipped",
            MergeOutcome::Created => "created",
            MergeOutcome::Updated => "updated",
            MergeOutcome::Added => "added",
        };
        f.write_str(word)
    }
}

impl MergeOutcome {
    pub fn changed(self) -> bool {
        !matches!(self, MergeOutcome::Skipped)
    }
}

/// Which legacy line format an aggregate uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegacyKind {
    /// `.lib` symbol libraries, `DEF … ENDDEF`.
    SymbolLib,
    /// `.dcm` description libraries, `$CMP … $ENDCMP`.
    DocLib,
}

impl LegacyKind {
    fn start_marker(self) -> &'static str {
        match self {
            LegacyKind::SymbolLib => "DEF ",
            LegacyKind::DocLib => "$CMP ",
        }
    }

    fn end_marker(self) -> &'static str {
        match self {
            LegacyKind::SymbolLib => "ENDDEF",
            LegacyKind::DocLib => "$ENDCMP",
        }
    }

    fn skeleton(self) -> &'static [&'static str] {
        match self {
            LegacyKind::SymbolLib => &[
                "EESchema-LIBRARY Version 2.4",
                "#encoding utf-8",
                "# End Library",
            ],
            LegacyKind::DocLib => &["EESchema-DOCLIB  Version 2.0", "#End Doc Library"],
        }
    }
}

/// One entry ready to merge into a legacy aggregate. The header comment run
/// is written only when the entry is appended; a replacement leaves the old
/// entry's comments in place.
pub struct LegacyEntry<'a> {
    pub name: &'a str,
    pub header: Option<&'a str>,
    pub body: &'a str,
}

/// Merges one entry into a legacy line-format aggregate.
pub fn merge_legacy(
    aggregate: &Path,
    kind: LegacyKind,
    entry: &LegacyEntry<'_>,
    overwrite: bool,
) -> Result<MergeOutcome> {
    let created = ensure_legacy_skeleton(aggregate, kind)?;
    let temp = sibling_temp_path(aggregate)?;
    let outcome = match stream_legacy(aggregate, &temp, kind, entry, overwrite, created) {
        Ok(MergeOutcome::Skipped) => {
            let _ = fs::remove_file(&temp);
            return Ok(MergeOutcome::Skipped);
        }
        Ok(outcome) => outcome,
        Err(err) => {
            discard_failed_merge(&temp, aggregate, created);
            return Err(err.context(ImportError::AggregateWriteFailure {
                path: aggregate.to_path_buf(),
            }));
        }
    };
    if let Err(err) = fs::rename(&temp, aggregate) {
        discard_failed_merge(&temp, aggregate, created);
        return Err(
            anyhow::Error::new(err).context(ImportError::AggregateWriteFailure {
                path: aggregate.to_path_buf(),
            }),
        );
    }
    Ok(outcome)
}

/// Drops the temp file of a failed merge, and the aggregate itself when this
/// merge created it; a skeleton written for a merge that never landed must
/// not outlive the failure.
fn discard_failed_merge(temp: &Path, aggregate: &Path, created: bool) {
    let _ = fs::remove_file(temp);
    if created {
        let _ = fs::remove_file(aggregate);
    }
}

fn stream_legacy(
    aggregate: &Path,
    temp: &Path,
    kind: LegacyKind,
    entry: &LegacyEntry<'_>,
    overwrite: bool,
    created: bool,
) -> Result<MergeOutcome> {
    let terminal = Regex::new(r"(?i)^# *end ").context("compile terminal marker pattern")?;
    let reader = BufReader::new(fs::File::open(aggregate).context("open aggregate library")?);
    let mut writer = BufWriter::new(fs::File::create(temp).context("create merge temp file")?);

    let mut outcome = if created {
        MergeOutcome::Created
    } else {
        MergeOutcome::Added
    };
    let mut suppressing = false;
    let mut wrote_block = false;
    let mut terminal_seen = false;

    for line in reader.lines() {
        let line = line.context("read aggregate library")?;
        if terminal.is_match(&line) {
            terminal_seen = true;
            if !wrote_block {
                if let Some(header) = entry.header {
                    writer
                        .write_all(header.as_bytes())
                        .context("write merge temp file")?;
                }
                writer
                    .write_all(entry.body.as_bytes())
                    .context("write merge temp file")?;
            }
            writeln!(writer, "{line}").context("write merge temp file")?;
            break;
        }
        if suppressing {
            if line.starts_with(kind.end_marker()) {
                suppressing = false;
            }
            continue;
        }
        if let Some(rest) = line.strip_prefix(kind.start_marker()) {
            let existing = rest.split_whitespace().next().unwrap_or("");
            if existing == entry.name {
                if !overwrite {
                    info!("entry {} already present, skipping", entry.name);
                    return Ok(MergeOutcome::Skipped);
                }
                info!("overwriting existing entry {}", entry.name);
                writer
                    .write_all(entry.body.as_bytes())
                    .context("write merge temp file")?;
                wrote_block = true;
                suppressing = true;
                outcome = MergeOutcome::Updated;
                continue;
            }
        }
        writeln!(writer, "{line}").context("write merge temp file")?;
    }

    if !terminal_seen {
        bail!("aggregate library has no terminal marker");
    }
    writer.flush().context("flush merge temp file")?;
    Ok(outcome)
}

/// Merges one `(symbol "<name>" …)` entry into a current-format aggregate.
pub fn merge_current(
    aggregate: &Path,
    name: &str,
    body: &str,
    overwrite: bool,
) -> Result<MergeOutcome> {
    let created = ensure_current_skeleton(aggregate)?;
    let text = fs::read_to_string(aggregate)
        .with_context(|| format!("read aggregate library {}", aggregate.display()))?;

    match sexp::find_entry_span(&text, "symbol", Some(name)) {
        Some(span) => {
            if !overwrite {
                info!("entry {name} already present, skipping");
                return Ok(MergeOutcome::Skipped);
            }
            info!("overwriting existing entry {name}");
            let mut new_text = String::with_capacity(text.len() + body.len());
            new_text.push_str(&text[..span.start]);
            new_text.push_str(body);
            new_text.push_str(&text[span.end..]);
            write_aggregate(aggregate, &new_text)?;
            Ok(MergeOutcome::Updated)
        }
        None => {
            let close = sexp::final_close_paren(&text)
                .context("aggregate library has no closing paren")?;
            let mut new_text = String::with_capacity(text.len() + body.len());
            match text[..close].rfind('\n') {
                Some(newline) => {
                    new_text.push_str(&text[..newline + 1]);
                    new_text.push_str("  ");
                    new_text.push_str(body);
                    new_text.push('\n');
                    new_text.push_str(&text[newline + 1..]);
                }
                None => {
                    new_text.push_str(&text[..close]);
                    new_text.push_str("\n  ");
                    new_text.push_str(body);
                    new_text.push('\n');
                    new_text.push_str(&text[close..]);
                }
            }
            write_aggregate(aggregate, &new_text)?;
            Ok(if created {
                MergeOutcome::Created
            } else {
                MergeOutcome::Added
            })
        }
    }
}

/// Temp-then-rename write of a full aggregate, with failures wrapped in
/// [`ImportError::AggregateWriteFailure`] like the legacy stream merge.
fn write_aggregate(aggregate: &Path, text: &str) -> Result<()> {
    write_atomic(aggregate, text).map_err(|err| {
        err.context(ImportError::AggregateWriteFailure {
            path: aggregate.to_path_buf(),
        })
    })
}

/// Whole-file write for footprint and model payloads, same temp-then-rename
/// discipline as the library merges.
pub fn write_file(path: &Path, bytes: &[u8], overwrite: bool) -> Result<MergeOutcome> {
    let existed = path.exists();
    if existed && !overwrite {
        info!("file {} already present, skipping", path.display());
        return Ok(MergeOutcome::Skipped);
    }
    let temp = sibling_temp_path(path)?;
    if let Err(err) = fs::write(&temp, bytes) {
        let _ = fs::remove_file(&temp);
        return Err(
            anyhow::Error::new(err).context(ImportError::AggregateWriteFailure {
                path: path.to_path_buf(),
            }),
        );
    }
    if let Err(err) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(
            anyhow::Error::new(err).context(ImportError::AggregateWriteFailure {
                path: path.to_path_buf(),
            }),
        );
    }
    Ok(if existed {
        MergeOutcome::Updated
    } else {
        MergeOutcome::Created
    })
}

/// Writes text via a sibling temp file and a final rename.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let temp = sibling_temp_path(path)?;
    if let Err(err) = fs::write(&temp, contents) {
        let _ = fs::remove_file(&temp);
        return Err(anyhow::Error::new(err).context("write temp file"));
    }
    if let Err(err) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(anyhow::Error::new(err).context("finalize file"));
    }
    Ok(())
}

fn sibling_temp_path(path: &Path) -> Result<PathBuf> {
    let parent = path.parent().context("aggregate parent dir")?;
    if !parent.as_os_str().is_empty() {
        fs::create_dir_all(parent).context("create library dir")?;
    }
    let file_name = path.file_name().context("aggregate filename")?;
    let mut temp_name = OsString::from(file_name);
    temp_name.push(".tmp");
    let mut temp_path = parent.join(temp_name);
    if temp_path.exists() {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos();
        let mut temp_name = OsString::from(file_name);
        temp_name.push(format!(".{stamp}.tmp"));
        temp_path = parent.join(temp_name);
    }
    Ok(temp_path)
}

/// Missing or zero-length aggregates get the format's minimal valid skeleton
/// so the merge protocol always has a terminal marker to work against.
fn ensure_legacy_skeleton(path: &Path, kind: LegacyKind) -> Result<bool> {
    if aggregate_has_content(path)? {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).context("create library dir")?;
        }
    }
    let mut contents = String::new();
    for line in kind.skeleton() {
        contents.push_str(line);
        contents.push('\n');
    }
    fs::write(path, contents).context("create aggregate skeleton")?;
    Ok(true)
}

fn ensure_current_skeleton(path: &Path) -> Result<bool> {
    if aggregate_has_content(path)? {
        return Ok(false);
    }
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).context("create library dir")?;
        }
    }
    fs::write(path, SYM_SKELETON).context("create aggregate skeleton")?;
    Ok(true)
}

fn aggregate_has_content(path: &Path) -> Result<bool> {
    if !path.exists() {
        return Ok(false);
    }
    let meta = fs::metadata(path).context("stat aggregate library")?;
    Ok(meta.len() > 0)
}

/// Scoped backup of one aggregate. `begin` snapshots the file, `commit`
/// discards the snapshot, `rollback` restores it. A transaction dropped
/// without either rolls back, so an early return can never strand a
/// half-updated aggregate without its restore path.
pub struct MergeTransaction {
    original: PathBuf,
    backup: Option<PathBuf>,
    done: bool,
}

impl MergeTransaction {
    pub fn begin(path: &Path) -> Result<Self> {
        let backup = if path.exists() {
            let backup = backup_path(path);
            fs::copy(path, &backup)
                .with_context(|| format!("back up aggregate {}", path.display()))?;
            Some(backup)
        } else {
            None
        };
        Ok(Self {
            original: path.to_path_buf(),
            backup,
            done: false,
        })
    }

    pub fn commit(mut self) {
        if let Some(backup) = self.backup.take() {
            let _ = fs::remove_file(backup);
        }
        self.done = true;
    }

    pub fn rollback(mut self) -> Result<()> {
        self.done = true;
        self.restore()
    }

    fn restore(&mut self) -> Result<()> {
        match self.backup.take() {
            Some(backup) => fs::rename(&backup, &self.original)
                .with_context(|| format!("restore aggregate {}", self.original.display())),
            None => {
                // Nothing existed before; remove whatever this import left.
                if self.original.exists() {
                    fs::remove_file(&self.original).with_context(|| {
                        format!("remove created aggregate {}", self.original.display())
                    })?;
                }
                Ok(())
            }
        }
    }
}

impl Drop for MergeTransaction {
    fn drop(&mut self) {
        if !self.done {
            let _ = self.restore();
        }
    }
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(OsString::from).unwrap_or_default();
    name.push(".backup");
    path.with_file_name(name)
}
