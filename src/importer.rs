//! Per-archive import orchestration.
//!
//! One archive flows classify -> extract -> cross-link -> merge -> commit.
//! Extraction failures for one asset type never block the others; each
//! aggregate file is merged under its own backup transaction, so a failure
//! merging one aggregate rolls back that aggregate only. There is no
//! cross-file transaction spanning symbol, description, footprint, and model.

use crate::archive::{VendorArchive, VendorFormat};
use crate::error::ImportError;
use crate::footprint;
use crate::merge::{self, LegacyEntry, LegacyKind, MergeOutcome, MergeTransaction};
use crate::symbol::{self, SymbolBlock, SymbolFormat};
use crate::upgrade::{self, UpgradeTool};
use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

pub const DEFAULT_PATH_VARIABLE: &str = "${KICAD_3RD_PARTY}";

/// Archives below this size are vendor stubs or truncated downloads.
pub const MIN_ARCHIVE_BYTES: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportStage {
    Start,
    Classified,
    SymbolExtracted,
    FootprintExtracted,
    ModelLoaded,
    CrossLinked,
    Merged,
    Committed,
}

impl ImportStage {
    pub fn index(self) -> usize {
        match self {
            ImportStage::Start => 0,
            ImportStage::Classified => 1,
            ImportStage::SymbolExtracted => 2,
            ImportStage::FootprintExtracted => 3,
            ImportStage::ModelLoaded => 4,
            ImportStage::CrossLinked => 5,
            ImportStage::Merged => 6,
            ImportStage::Committed => 7,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ImportStage::Start => "Start",
            ImportStage::Classified => "Classified",
            ImportStage::SymbolExtracted => "SymbolExtracted",
            ImportStage::FootprintExtracted => "FootprintExtracted",
            ImportStage::ModelLoaded => "ModelLoaded",
            ImportStage::CrossLinked => "CrossLinked",
            ImportStage::Merged => "Merged",
            ImportStage::Committed => "Committed",
        }
    }
}

fn advance(stage: &mut ImportStage, next: ImportStage) {
    debug_assert!(next.index() > stage.index());
    debug!("stage {} -> {}", stage.label(), next.label());
    *stage = next;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerOp {
    DirCreated,
    FileTouched,
    FileModified,
    FileExtracted,
}

/// Ordered record of the filesystem operations one import performed.
/// Diagnostic only; rollback goes through [`MergeTransaction`], not this.
#[derive(Debug, Default)]
pub struct ImportLedger {
    entries: Vec<(PathBuf, LedgerOp)>,
}

impl ImportLedger {
    fn record(&mut self, path: &Path, op: LedgerOp) {
        self.entries.push((path.to_path_buf(), op));
    }

    pub fn entries(&self) -> &[(PathBuf, LedgerOp)] {
        &self.entries
    }
}

#[derive(Debug)]
pub struct ModelFile {
    pub file_name: String,
    pub bytes: Vec<u8>,
}

/// Everything extracted from one archive for one part.
#[derive(Debug, Default)]
pub struct ComponentRecord {
    pub name: String,
    pub symbol: Option<SymbolBlock>,
    pub description: Option<symbol::DescriptionBlock>,
    pub footprint_name: Option<String>,
    pub footprint_content: Option<String>,
    pub model: Option<ModelFile>,
}

impl ComponentRecord {
    /// A record with no symbol, no footprint, and no model cannot produce
    /// anything; the import aborts with [`ImportError::NoContent`].
    pub fn is_empty(&self) -> bool {
        self.symbol.is_none() && self.footprint_content.is_none() && self.model.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Symbol,
    Description,
    Footprint,
    Model,
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let word = match self {
            AssetKind::Symbol => "symbol",
            AssetKind::Description => "description",
            AssetKind::Footprint => "footprint",
            AssetKind::Model => "model",
        };
        f.write_str(word)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct AssetReport {
    pub kind: AssetKind,
    pub outcome: MergeOutcome,
}

/// Result of one successful (possibly degraded) archive import.
#[derive(Debug)]
pub struct ImportReport {
    pub archive: PathBuf,
    pub vendor: VendorFormat,
    pub name: String,
    pub assets: Vec<AssetReport>,
    pub warnings: Vec<String>,
    pub ledger: ImportLedger,
}

impl ImportReport {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }

    /// One status line per archive: `OK` or `Warning: …`, followed by each
    /// asset's disposition.
    pub fn status_line(&self) -> String {
        let summary: Vec<String> = self
            .assets
            .iter()
            .map(|asset| format!("{}: {}", asset.kind, asset.outcome))
            .collect();
        let summary = if summary.is_empty() {
            String::new()
        } else {
            format!(" ({})", summary.join(", "))
        };
        if self.warnings.is_empty() {
            format!("OK{summary}")
        } else {
            format!("Warning: {}{summary}", self.warnings.join("; "))
        }
    }
}

/// Outcome of importing every archive in a folder, in sorted order.
pub struct BatchReport {
    pub outcomes: Vec<(PathBuf, Result<ImportReport>)>,
}

impl BatchReport {
    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| outcome.is_err())
            .count()
    }
}

struct StagingGuard {
    path: PathBuf,
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.path);
    }
}

static TEMP_COUNTER: AtomicUsize = AtomicUsize::new(0);

fn make_temp_dir(lib_folder: &Path, label: &str) -> Result<PathBuf> {
    let temp_root = lib_folder.join("tmp");
    fs::create_dir_all(&temp_root).context("create temp root")?;
    let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let temp_dir = temp_root.join(format!("import-{nanos}-{counter}-{label}"));
    fs::create_dir_all(&temp_dir).context("create temp dir")?;
    Ok(temp_dir)
}

/// Imports vendor archives into one aggregate-library folder.
pub struct Importer {
    lib_folder: PathBuf,
    path_variable: String,
    overwrite: bool,
    upgrade_tool: UpgradeTool,
}

impl Importer {
    pub fn new(lib_folder: impl Into<PathBuf>) -> Self {
        Self {
            lib_folder: lib_folder.into(),
            path_variable: DEFAULT_PATH_VARIABLE.to_string(),
            overwrite: false,
            upgrade_tool: UpgradeTool::new(),
        }
    }

    pub fn overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn path_variable(mut self, variable: impl Into<String>) -> Self {
        self.path_variable = variable.into();
        self
    }

    pub fn upgrade_tool(mut self, tool: UpgradeTool) -> Self {
        self.upgrade_tool = tool;
        self
    }

    pub fn lib_folder(&self) -> &Path {
        &self.lib_folder
    }

    /// Runs the full pipeline for one archive. Returns `Err` only for
    /// archive-level failures (unreadable zip, unknown layout, no content);
    /// per-asset failures degrade to warnings in the report.
    pub fn import_archive(&self, path: &Path) -> Result<ImportReport> {
        info!("Import: {}", path.display());
        let mut stage = ImportStage::Start;
        let mut ledger = ImportLedger::default();
        let mut warnings: Vec<String> = Vec::new();

        let mut archive = VendorArchive::open(path)?;
        let (vendor, members) = archive.classify()?;
        info!("Identified {}", vendor.name());
        advance(&mut stage, ImportStage::Classified);

        if vendor == VendorFormat::Partial {
            warn!("archive contains incomplete data, importing the model only");
            warnings.push("only a 3D model was found".to_string());
        }

        let hint = footprint::clean_name(&archive.label());
        let mut record = ComponentRecord::default();
        let mut symbol_lib_version: Option<u64> = None;

        if let Some(member) = members.symbol.as_deref() {
            let text = archive.read_member_text(member)?;
            match self.prepare_symbol(&text, &hint) {
                Ok((block, version)) => {
                    info!("Loaded symbol: {}", block.name);
                    symbol_lib_version = version;
                    record.symbol = Some(block);
                }
                Err(err) => {
                    warn!("symbol extraction failed: {err:#}");
                    warnings.push(format!("symbol skipped ({err})"));
                }
            }
        }

        if let Some(member) = members.description.as_deref() {
            let device = record
                .symbol
                .as_ref()
                .map(|block| block.name.clone())
                .unwrap_or_else(|| hint.clone());
            let extracted = archive
                .read_member_text(member)
                .and_then(|text| symbol::extract_description(&text, &device));
            match extracted {
                Ok(block) => record.description = Some(block),
                Err(err) => {
                    warn!("description extraction failed: {err:#}");
                    warnings.push(format!("description skipped ({err})"));
                }
            }
        }
        advance(&mut stage, ImportStage::SymbolExtracted);

        let mut legacy_footprint = false;
        if let Some(dir) = members.footprint_dir.as_deref() {
            match archive.footprint_file_under(dir) {
                Some(member) => match archive.read_member_text(&member) {
                    Ok(content) => {
                        legacy_footprint = member.to_ascii_lowercase().ends_with(".mod");
                        let declared = footprint::footprint_name(&content);
                        let name = declared.unwrap_or_else(|| {
                            warn!("footprint {member} declares no name, using the file name");
                            member_stem(&member)
                        });
                        info!("Loaded footprint: {name}");
                        record.footprint_name = Some(footprint::clean_name(&name));
                        record.footprint_content = Some(content);
                    }
                    Err(err) => {
                        warn!("footprint read failed: {err:#}");
                        warnings.push(format!("footprint skipped ({err})"));
                    }
                },
                None => debug!("no footprint file under {dir}"),
            }
        }
        advance(&mut stage, ImportStage::FootprintExtracted);

        if let Some(member) = members.model.as_deref() {
            match archive.read_member_bytes(member) {
                Ok(bytes) => {
                    let file_name = member_file_name(member);
                    info!("Loaded 3D model: {file_name}");
                    record.model = Some(ModelFile { file_name, bytes });
                    advance(&mut stage, ImportStage::ModelLoaded);
                }
                Err(err) => {
                    warn!("model read failed: {err:#}");
                    warnings.push(format!("model skipped ({err})"));
                }
            }
        }

        record.name = record
            .symbol
            .as_ref()
            .map(|block| block.name.clone())
            .or_else(|| record.footprint_name.clone())
            .or_else(|| {
                record
                    .model
                    .as_ref()
                    .map(|model| member_stem(&model.file_name))
            })
            .unwrap_or_else(|| hint.clone());
        if record.is_empty() {
            return Err(ImportError::NoContent.into());
        }

        if let (Some(block), Some(fp_name)) = (record.symbol.as_mut(), &record.footprint_name) {
            let reference = format!("{}:{}", vendor.name(), fp_name);
            symbol::set_footprint_reference(block, &reference)?;
        }
        if let (Some(content), Some(model)) = (&record.footprint_content, &record.model) {
            let model_path = format!(
                "{}/{}.3dshapes/{}",
                self.path_variable,
                vendor.name(),
                model.file_name
            );
            match footprint::link_model(content, &model_path) {
                Ok(linked) => record.footprint_content = Some(linked),
                Err(err) => {
                    warn!("model link failed: {err:#}");
                    warnings.push(format!("model reference not linked ({err})"));
                }
            }
        }
        advance(&mut stage, ImportStage::CrossLinked);

        let assets =
            self.commit_record(vendor, &record, symbol_lib_version, &mut ledger, &mut warnings);
        advance(&mut stage, ImportStage::Merged);

        if legacy_footprint {
            let pretty_dir = self.lib_folder.join(format!("{}.pretty", vendor.name()));
            if let Err(err) = self.upgrade_tool.upgrade_footprint_library(&pretty_dir) {
                warn!("footprint upgrade failed: {err:#}");
                warnings.push("footprint imported in legacy format".to_string());
            }
        }
        advance(&mut stage, ImportStage::Committed);
        info!("Import successful");

        Ok(ImportReport {
            archive: path.to_path_buf(),
            vendor,
            name: record.name,
            assets,
            warnings,
            ledger,
        })
    }

    /// Imports every `*.zip` directly inside `folder`, sorted by name.
    /// A failure for one archive never stops the rest of the batch.
    pub fn import_folder(&self, folder: &Path) -> Result<BatchReport> {
        if !folder.is_dir() {
            anyhow::bail!("download folder {} does not exist", folder.display());
        }
        let mut archives: Vec<PathBuf> = WalkDir::new(folder)
            .max_depth(1)
            .follow_links(false)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter(|entry| {
                entry
                    .path()
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .map(|ext| ext.eq_ignore_ascii_case("zip"))
                    .unwrap_or(false)
            })
            .filter(|entry| {
                entry
                    .metadata()
                    .map(|meta| meta.len() >= MIN_ARCHIVE_BYTES)
                    .unwrap_or(false)
            })
            .map(|entry| entry.into_path())
            .collect();
        archives.sort();

        let mut outcomes = Vec::with_capacity(archives.len());
        for archive in archives {
            let outcome = self.import_archive(&archive);
            if let Err(err) = &outcome {
                warn!("import of {} failed: {err:#}", archive.display());
            }
            outcomes.push((archive, outcome));
        }
        Ok(BatchReport { outcomes })
    }

    /// Yields the symbol block plus the source library's header version.
    /// Legacy text goes through the upgrade tool first; an unavailable tool
    /// falls back to merging in the legacy format, any other tool failure
    /// skips the symbol portion.
    fn prepare_symbol(&self, text: &str, hint: &str) -> Result<(SymbolBlock, Option<u64>)> {
        if text.trim_start().starts_with('(') {
            let block = symbol::extract_symbol(text, hint)?;
            return Ok((block, upgrade::library_version(text)));
        }
        match self.upgrade_in_staging(text) {
            Ok(upgraded) => {
                let block = symbol::extract_symbol(&upgraded, hint)?;
                Ok((block, upgrade::library_version(&upgraded)))
            }
            Err(err)
                if matches!(
                    err.downcast_ref::<ImportError>(),
                    Some(ImportError::ConversionUnavailable)
                ) =>
            {
                warn!("format upgrade tool unavailable, merging in legacy format");
                let block = symbol::extract_symbol(text, hint)?;
                Ok((block, None))
            }
            Err(err) => Err(err),
        }
    }

    fn upgrade_in_staging(&self, text: &str) -> Result<String> {
        let staging = make_temp_dir(&self.lib_folder, "sym")?;
        let _guard = StagingGuard {
            path: staging.clone(),
        };
        let input = staging.join("input.lib");
        let output = staging.join("output.kicad_sym");
        fs::write(&input, text).context("stage symbol library")?;
        self.upgrade_tool.upgrade_symbol_library(&input, &output)?;
        fs::read_to_string(&output).context("read upgraded symbol library")
    }

    fn commit_record(
        &self,
        vendor: VendorFormat,
        record: &ComponentRecord,
        symbol_lib_version: Option<u64>,
        ledger: &mut ImportLedger,
        warnings: &mut Vec<String>,
    ) -> Vec<AssetReport> {
        let mut assets = Vec::new();

        if let Some(block) = &record.symbol {
            let (path, result) = match block.format {
                SymbolFormat::Legacy => {
                    let path = self.lib_folder.join(format!("{}.lib", vendor.name()));
                    let entry = LegacyEntry {
                        name: &block.name,
                        header: block.header.as_deref(),
                        body: &block.body,
                    };
                    let result = self.commit_merge(&path, |path| {
                        merge::merge_legacy(path, LegacyKind::SymbolLib, &entry, self.overwrite)
                    });
                    (path, result)
                }
                SymbolFormat::Current => {
                    let path = self
                        .lib_folder
                        .join(format!("{}.kicad_sym", vendor.name()));
                    if let Some(incoming) = symbol_lib_version {
                        self.refresh_aggregate(&path, incoming, warnings);
                    }
                    let result = self.commit_merge(&path, |path| {
                        merge::merge_current(path, &block.name, &block.body, self.overwrite)
                    });
                    (path, result)
                }
            };
            record_asset(
                AssetKind::Symbol,
                &path,
                LedgerOp::FileModified,
                result,
                ledger,
                warnings,
                &mut assets,
            );
        }

        if let Some(block) = &record.description {
            let path = self.lib_folder.join(format!("{}.dcm", vendor.name()));
            let entry = LegacyEntry {
                name: &block.name,
                header: block.header.as_deref(),
                body: &block.body,
            };
            let result = self.commit_merge(&path, |path| {
                merge::merge_legacy(path, LegacyKind::DocLib, &entry, self.overwrite)
            });
            record_asset(
                AssetKind::Description,
                &path,
                LedgerOp::FileModified,
                result,
                ledger,
                warnings,
                &mut assets,
            );
        }

        if let (Some(content), Some(name)) = (&record.footprint_content, &record.footprint_name) {
            let dir = self.lib_folder.join(format!("{}.pretty", vendor.name()));
            if !dir.exists() {
                ledger.record(&dir, LedgerOp::DirCreated);
            }
            let path = dir.join(format!("{name}.kicad_mod"));
            let result = self.commit_merge(&path, |path| {
                merge::write_file(path, content.as_bytes(), self.overwrite)
            });
            record_asset(
                AssetKind::Footprint,
                &path,
                LedgerOp::FileTouched,
                result,
                ledger,
                warnings,
                &mut assets,
            );
        }

        if let Some(model) = &record.model {
            let dir = self.lib_folder.join(format!("{}.3dshapes", vendor.name()));
            if !dir.exists() {
                ledger.record(&dir, LedgerOp::DirCreated);
            }
            let path = dir.join(&model.file_name);
            let result = self.commit_merge(&path, |path| {
                merge::write_file(path, &model.bytes, self.overwrite)
            });
            record_asset(
                AssetKind::Model,
                &path,
                LedgerOp::FileExtracted,
                result,
                ledger,
                warnings,
                &mut assets,
            );
        }

        assets
    }

    /// Runs one merge under a backup transaction, so an error restores the
    /// aggregate before it propagates.
    fn commit_merge<F>(&self, path: &Path, merge: F) -> Result<MergeOutcome>
    where
        F: FnOnce(&Path) -> Result<MergeOutcome>,
    {
        let tx = MergeTransaction::begin(path)?;
        match merge(path) {
            Ok(outcome) => {
                tx.commit();
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback() {
                    warn!("rollback of {} failed: {rollback_err:#}", path.display());
                }
                Err(err)
            }
        }
    }

    /// Brings an older aggregate's library header up to the incoming
    /// library's version before merging into it. Best effort: a missing tool
    /// just leaves the old header in place.
    fn refresh_aggregate(&self, path: &Path, incoming: u64, warnings: &mut Vec<String>) {
        if !path.exists() {
            return;
        }
        let Ok(existing) = fs::read_to_string(path) else {
            return;
        };
        let existing_version = upgrade::library_version(&existing).unwrap_or(0);
        if existing_version >= incoming {
            return;
        }
        debug!(
            "aggregate {} is at version {existing_version}, incoming is {incoming}",
            path.display()
        );
        let upgraded = make_temp_dir(&self.lib_folder, "agg").and_then(|staging| {
            let _guard = StagingGuard {
                path: staging.clone(),
            };
            let output = staging.join("upgraded.kicad_sym");
            self.upgrade_tool.upgrade_symbol_library(path, &output)?;
            fs::read_to_string(&output).context("read upgraded aggregate")
        });
        match upgraded {
            Ok(text) => {
                if let Err(err) = merge::write_atomic(path, &text) {
                    warn!("aggregate upgrade write failed: {err:#}");
                    warnings.push(format!("aggregate {} not upgraded", path.display()));
                }
            }
            Err(err)
                if matches!(
                    err.downcast_ref::<ImportError>(),
                    Some(ImportError::ConversionUnavailable)
                ) =>
            {
                debug!("upgrade tool unavailable, keeping aggregate header as is");
            }
            Err(err) => {
                warn!("aggregate upgrade failed: {err:#}");
                warnings.push(format!("aggregate {} not upgraded", path.display()));
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn record_asset(
    kind: AssetKind,
    path: &Path,
    op: LedgerOp,
    result: Result<MergeOutcome>,
    ledger: &mut ImportLedger,
    warnings: &mut Vec<String>,
    assets: &mut Vec<AssetReport>,
) {
    match result {
        Ok(outcome) => {
            if outcome.changed() {
                ledger.record(path, op);
            }
            assets.push(AssetReport { kind, outcome });
        }
        Err(err) => {
            warn!("{kind} merge failed: {err:#}");
            warnings.push(format!("{kind} merge failed ({err})"));
        }
    }
}

fn member_file_name(member: &str) -> String {
    member.rsplit('/').next().unwrap_or(member).to_string()
}

fn member_stem(member: &str) -> String {
    let name = member.rsplit('/').next().unwrap_or(member);
    match name.rfind('.') {
        Some(dot) if dot > 0 => name[..dot].to_string(),
        _ => name.to_string(),
    }
}
