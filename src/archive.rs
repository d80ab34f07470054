use crate::error::ImportError;
use anyhow::{Context, Result};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Model file suffixes, in preference order.
pub const MODEL_SUFFIXES: [&str; 3] = [".step", ".stp", ".wrl"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VendorFormat {
    Octopart,
    Samacsys,
    UltraLibrarian,
    Snapeda,
    Partial,
}

impl VendorFormat {
    /// Aggregate library stem: `Octopart.kicad_sym`, `Octopart.pretty`, ...
    pub fn name(self) -> &'static str {
        match self {
            VendorFormat::Octopart => "Octopart",
            VendorFormat::Samacsys => "Samacsys",
            VendorFormat::UltraLibrarian => "UltraLibrarian",
            VendorFormat::Snapeda => "Snapeda",
            VendorFormat::Partial => "Partial",
        }
    }
}

/// Member locations the classifier resolved for one archive. Directory
/// prefixes end with `/`; an empty prefix means the archive root.
#[derive(Debug, Clone, Default)]
pub struct ArchiveMembers {
    pub symbol: Option<String>,
    pub description: Option<String>,
    pub footprint_dir: Option<String>,
    pub model: Option<String>,
}

/// An opened vendor zip plus a sorted index of its member paths. The sorted
/// index makes every "first match" below deterministic regardless of the
/// order entries were zipped in.
pub struct VendorArchive {
    path: PathBuf,
    archive: zip::ZipArchive<fs::File>,
    index: Vec<String>,
}

impl VendorArchive {
    pub fn open(path: &Path) -> Result<Self> {
        let file = fs::File::open(path)
            .with_context(|| format!("open archive {}", path.display()))?;
        let archive = zip::ZipArchive::new(file)
            .with_context(|| format!("read archive {}", path.display()))?;
        let mut index: Vec<String> = archive
            .file_names()
            .filter(|name| !is_ignored_member(name))
            .map(str::to_string)
            .collect();
        index.sort();
        Ok(Self {
            path: path.to_path_buf(),
            archive,
            index,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Archive file stem, used in status lines and as a device-name hint.
    pub fn label(&self) -> String {
        self.path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string())
    }

    pub fn member_names(&self) -> &[String] {
        &self.index
    }

    pub fn read_member_text(&mut self, name: &str) -> Result<String> {
        let bytes = self.read_member_bytes(name)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    pub fn read_member_bytes(&mut self, name: &str) -> Result<Vec<u8>> {
        let mut file = self
            .archive
            .by_name(name)
            .with_context(|| format!("archive member {name}"))?;
        let mut bytes = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut bytes)
            .with_context(|| format!("read archive member {name}"))?;
        Ok(bytes)
    }

    /// Decides which vendor layout this archive uses and where its pieces
    /// live. Ordered rules, first match wins; read-only.
    pub fn classify(&self) -> Result<(VendorFormat, ArchiveMembers)> {
        if let (Some(symbol), Some(description)) = (
            self.member_named("device.lib"),
            self.member_named("device.dcm"),
        ) {
            let members = ArchiveMembers {
                symbol: Some(symbol),
                description: Some(description),
                footprint_dir: self.find_dir(|part| part.ends_with(".pretty")),
                model: self.file_with_suffix("", &MODEL_SUFFIXES),
            };
            return Ok((VendorFormat::Octopart, members));
        }

        if let Some(dir) = self.find_dir(|part| part == "KiCad") {
            let members = ArchiveMembers {
                symbol: self.file_with_suffix(&dir, &[".kicad_sym", ".lib"]),
                description: self.file_with_suffix(&dir, &[".dcm"]),
                footprint_dir: Some(dir),
                model: self.file_with_suffix("", &MODEL_SUFFIXES),
            };
            return Ok((VendorFormat::Samacsys, members));
        }

        if let Some(dir) = self.find_dir(|part| part == "KiCAD") {
            let members = ArchiveMembers {
                symbol: self.file_with_suffix(&dir, &[".kicad_sym", ".lib"]),
                description: self.file_with_suffix(&dir, &[".dcm"]),
                footprint_dir: self.find_dir_under(&dir, |part| part.ends_with(".pretty")),
                model: self.file_with_suffix("", &MODEL_SUFFIXES),
            };
            return Ok((VendorFormat::UltraLibrarian, members));
        }

        if let Some(symbol) = self.file_with_suffix("", &[".kicad_sym", ".lib"]) {
            let members = ArchiveMembers {
                symbol: Some(symbol),
                description: self.file_with_suffix("", &[".dcm"]),
                footprint_dir: self.footprint_parent(),
                model: self.file_with_suffix("", &MODEL_SUFFIXES),
            };
            return Ok((VendorFormat::Snapeda, members));
        }

        if let Some(model) = self.file_with_suffix("", &MODEL_SUFFIXES) {
            let members = ArchiveMembers {
                model: Some(model),
                ..ArchiveMembers::default()
            };
            return Ok((VendorFormat::Partial, members));
        }

        Err(ImportError::UnknownFormat.into())
    }

    /// First footprint file under `dir`, preferring the current format over
    /// the legacy one when both ship in the same archive.
    pub fn footprint_file_under(&self, dir: &str) -> Option<String> {
        self.file_with_suffix(dir, &[".kicad_mod", ".mod"])
    }

    /// First member whose file name is exactly `file_name`, at any depth.
    fn member_named(&self, file_name: &str) -> Option<String> {
        let suffix = format!("/{file_name}");
        self.index
            .iter()
            .find(|member| member.as_str() == file_name || member.ends_with(&suffix))
            .cloned()
    }

    /// First file member under `prefix` ending with one of `suffixes`.
    /// Suffix order is the priority order, not index order.
    fn file_with_suffix(&self, prefix: &str, suffixes: &[&str]) -> Option<String> {
        for suffix in suffixes {
            let found = self.index.iter().find(|name| {
                name.starts_with(prefix)
                    && !name.ends_with('/')
                    && name.to_ascii_lowercase().ends_with(suffix)
            });
            if let Some(name) = found {
                return Some(name.clone());
            }
        }
        None
    }

    /// Prefix (ending in `/`) of the first directory whose name satisfies
    /// the predicate, anywhere in the archive.
    fn find_dir(&self, matches: impl Fn(&str) -> bool) -> Option<String> {
        self.find_dir_under("", matches)
    }

    fn find_dir_under(&self, prefix: &str, matches: impl Fn(&str) -> bool) -> Option<String> {
        for name in &self.index {
            if !name.starts_with(prefix) {
                continue;
            }
            let parts: Vec<&str> = name.split('/').collect();
            for (idx, part) in parts.iter().enumerate() {
                let is_dir = idx + 1 < parts.len() || name.ends_with('/');
                if is_dir && !part.is_empty() && matches(part) {
                    let mut dir = parts[..=idx].join("/");
                    dir.push('/');
                    if dir.starts_with(prefix) {
                        return Some(dir);
                    }
                }
            }
        }
        None
    }

    /// Parent prefix of the first footprint file in the archive.
    fn footprint_parent(&self) -> Option<String> {
        let file = self.file_with_suffix("", &[".kicad_mod", ".mod"])?;
        match file.rfind('/') {
            Some(pos) => Some(file[..=pos].to_string()),
            None => Some(String::new()),
        }
    }
}

fn is_ignored_member(name: &str) -> bool {
    name.split('/').any(|part| {
        part.eq_ignore_ascii_case("__MACOSX")
            || part.eq_ignore_ascii_case(".ds_store")
            || part.eq_ignore_ascii_case("thumbs.db")
            || part == ".git"
            || part == ".svn"
    })
}
