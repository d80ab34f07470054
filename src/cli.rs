use crate::config::AppConfig;
use crate::easyeda::EasyedaImporter;
use crate::importer::{ImportReport, Importer};
use crate::settings::KicadSettings;
use crate::watch::ImportWatcher;
use anyhow::{bail, Context, Result};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Default, PartialEq)]
pub struct ImportArgs {
    pub download_file: Option<PathBuf>,
    pub download_folder: Option<PathBuf>,
    pub lib_folder: Option<PathBuf>,
    pub overwrite: bool,
    pub path_variable: Option<String>,
    pub easyeda: Option<String>,
    pub kicad_config: Option<PathBuf>,
    pub watch: bool,
}

#[derive(Debug, PartialEq)]
pub enum CliAction {
    Help,
    Version,
    Import(ImportArgs),
}

pub fn run() -> Result<i32> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_args(&args)? {
        CliAction::Help => {
            print_help();
            Ok(0)
        }
        CliAction::Version => {
            println!("partforge v{}", env!("CARGO_PKG_VERSION"));
            Ok(0)
        }
        CliAction::Import(import) => {
            let config = AppConfig::load_or_create().unwrap_or_default();
            execute(import, &config)
        }
    }
}

/// Accepts both `--flag value` and `--flag=value`.
pub fn parse_args(args: &[String]) -> Result<CliAction> {
    let mut parsed = ImportArgs::default();
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) => (flag, Some(value.to_string())),
            None => (arg.as_str(), None),
        };
        match flag {
            "--help" | "-h" => return Ok(CliAction::Help),
            "--version" | "-V" => return Ok(CliAction::Version),
            "--download-file" => {
                parsed.download_file = Some(PathBuf::from(take_value(flag, inline, &mut iter)?));
            }
            "--download-folder" => {
                parsed.download_folder = Some(PathBuf::from(take_value(flag, inline, &mut iter)?));
            }
            "--lib-folder" => {
                parsed.lib_folder = Some(PathBuf::from(take_value(flag, inline, &mut iter)?));
            }
            "--path-variable" => {
                parsed.path_variable = Some(take_value(flag, inline, &mut iter)?);
            }
            "--easyeda" => {
                parsed.easyeda = Some(take_value(flag, inline, &mut iter)?);
            }
            "--kicad-config" => {
                parsed.kicad_config = Some(PathBuf::from(take_value(flag, inline, &mut iter)?));
            }
            "--overwrite-if-exists" => {
                reject_inline(flag, &inline)?;
                parsed.overwrite = true;
            }
            "--watch" => {
                reject_inline(flag, &inline)?;
                parsed.watch = true;
            }
            other => bail!("unknown option {other} (see --help)"),
        }
    }
    Ok(CliAction::Import(parsed))
}

fn take_value(
    flag: &str,
    inline: Option<String>,
    iter: &mut std::slice::Iter<'_, String>,
) -> Result<String> {
    if let Some(value) = inline {
        return Ok(value);
    }
    match iter.next() {
        Some(value) => Ok(value.clone()),
        None => bail!("{flag} requires a value"),
    }
}

fn reject_inline(flag: &str, inline: &Option<String>) -> Result<()> {
    if inline.is_some() {
        bail!("{flag} does not take a value");
    }
    Ok(())
}

fn execute(args: ImportArgs, config: &AppConfig) -> Result<i32> {
    let lib_folder = args
        .lib_folder
        .or_else(|| config.lib_folder.clone())
        .context("--lib-folder is required")?;
    let overwrite = args.overwrite || config.overwrite_if_exists;
    let path_variable = args
        .path_variable
        .unwrap_or_else(|| config.path_variable.clone());
    let kicad_config = args.kicad_config.or_else(|| config.kicad_config_dir.clone());
    let download_folder = args
        .download_folder
        .clone()
        .or_else(|| config.source_folder.clone());

    if args.easyeda.is_some() && (args.download_file.is_some() || args.download_folder.is_some()) {
        bail!("--easyeda cannot be combined with --download-file or --download-folder");
    }
    if args.easyeda.is_none() {
        match (&args.download_file, &download_folder) {
            (Some(_), Some(_)) => {
                bail!("--download-file and --download-folder are mutually exclusive")
            }
            (None, None) => bail!("one of --download-file or --download-folder is required"),
            _ => {}
        }
    }
    if args.watch && download_folder.is_none() {
        bail!("--watch requires --download-folder");
    }
    fs::create_dir_all(&lib_folder)
        .with_context(|| format!("create library folder {}", lib_folder.display()))?;

    if let Some(lcsc_id) = &args.easyeda {
        EasyedaImporter::new().import(lcsc_id, &lib_folder, overwrite)?;
        println!("{lcsc_id}: OK");
        if let Some(config_dir) = &kicad_config {
            register_vendor(&KicadSettings::new(config_dir), &lib_folder, &path_variable, "EasyEDA")?;
        }
        return Ok(0);
    }

    let importer = Importer::new(&lib_folder)
        .overwrite(overwrite)
        .path_variable(path_variable.clone());
    let mut failed = 0usize;
    let mut vendors: BTreeSet<&'static str> = BTreeSet::new();

    if let Some(file) = &args.download_file {
        match importer.import_archive(file) {
            Ok(report) => {
                println!("{}: {}", display_name(file), report.status_line());
                vendors.insert(report.vendor.name());
            }
            Err(err) => {
                println!("{}: {err:#}", display_name(file));
                failed += 1;
            }
        }
    } else if let Some(folder) = &download_folder {
        let batch = importer.import_folder(folder)?;
        for (path, outcome) in &batch.outcomes {
            match outcome {
                Ok(report) => {
                    println!("{}: {}", display_name(path), report.status_line());
                    vendors.insert(report.vendor.name());
                }
                Err(err) => println!("{}: {err:#}", display_name(path)),
            }
        }
        failed = batch.failed();
    }

    if let Some(config_dir) = &kicad_config {
        let settings = KicadSettings::new(config_dir);
        settings.set_global_path_variable(
            variable_name(&path_variable),
            &lib_folder.to_string_lossy(),
        )?;
        for vendor in &vendors {
            register_vendor(&settings, &lib_folder, &path_variable, vendor)?;
        }
    }

    if let (true, Some(folder)) = (args.watch, download_folder) {
        let interval = Duration::from_secs(config.watch_interval_secs.max(1));
        let mut watcher = ImportWatcher::new(&folder);
        watcher.mark_existing();
        println!(
            "Watching {} every {}s, press Ctrl-C to stop",
            folder.display(),
            interval.as_secs()
        );
        watcher.run(&importer, interval, print_watch_result);
    }

    Ok(if failed > 0 { 1 } else { 0 })
}

fn print_watch_result(path: &Path, outcome: &Result<ImportReport>) {
    match outcome {
        Ok(report) => println!("{}: {}", display_name(path), report.status_line()),
        Err(err) => println!("{}: {err:#}", display_name(path)),
    }
}

/// Registers a vendor's symbol and footprint aggregates with KiCad, for
/// whichever of them exist on disk.
fn register_vendor(
    settings: &KicadSettings,
    lib_folder: &Path,
    path_variable: &str,
    vendor: &str,
) -> Result<()> {
    if lib_folder.join(format!("{vendor}.kicad_sym")).exists() {
        settings.register_symbol_library(vendor, &format!("{path_variable}/{vendor}.kicad_sym"))?;
    }
    if lib_folder.join(format!("{vendor}.pretty")).is_dir() {
        settings.register_footprint_library(vendor, &format!("{path_variable}/{vendor}.pretty"))?;
    }
    Ok(())
}

/// `${KICAD_3RD_PARTY}` -> `KICAD_3RD_PARTY`.
fn variable_name(path_variable: &str) -> &str {
    path_variable
        .trim_start_matches("${")
        .trim_end_matches('}')
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

fn print_help() {
    println!("partforge v{}", env!("CARGO_PKG_VERSION"));
    println!("Imports vendor component archives into KiCad aggregate libraries.");
    println!();
    println!("Usage: partforge [options]");
    println!();
    println!("Options:");
    println!("  --download-file <path>    Import a single vendor zip archive");
    println!("  --download-folder <path>  Import every zip archive in a folder");
    println!("  --lib-folder <path>       Destination library folder (required)");
    println!("  --overwrite-if-exists     Replace entries that already exist");
    println!("  --path-variable <name>    Path variable for model references");
    println!("                            (default ${{KICAD_3RD_PARTY}})");
    println!("  --easyeda <lcsc-id>       Import an EasyEDA part via easyeda2kicad");
    println!("  --kicad-config <path>     Register libraries in this KiCad config dir");
    println!("  --watch                   Keep polling --download-folder for new zips");
    println!("  --help, -h                Show this help");
    println!("  --version, -V             Show the version");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|value| value.to_string()).collect()
    }

    #[test]
    fn parses_flag_value_and_flag_equals_value() {
        let action = parse_args(&args(&[
            "--download-file",
            "part.zip",
            "--lib-folder=/tmp/libs",
            "--overwrite-if-exists",
        ]))
        .unwrap();
        let CliAction::Import(parsed) = action else {
            panic!("expected import action");
        };
        assert_eq!(parsed.download_file.as_deref(), Some(Path::new("part.zip")));
        assert_eq!(parsed.lib_folder.as_deref(), Some(Path::new("/tmp/libs")));
        assert!(parsed.overwrite);
        assert!(!parsed.watch);
    }

    #[test]
    fn help_and_version_short_circuit() {
        assert_eq!(parse_args(&args(&["--help"])).unwrap(), CliAction::Help);
        assert_eq!(parse_args(&args(&["-V"])).unwrap(), CliAction::Version);
    }

    #[test]
    fn missing_value_and_unknown_flags_are_rejected() {
        assert!(parse_args(&args(&["--download-file"])).is_err());
        assert!(parse_args(&args(&["--frobnicate"])).is_err());
        assert!(parse_args(&args(&["--watch=yes"])).is_err());
    }

    #[test]
    fn execute_requires_a_source_and_a_lib_folder() {
        let config = AppConfig::default();
        let err = execute(ImportArgs::default(), &config).unwrap_err();
        assert!(err.to_string().contains("--lib-folder"));

        let dir = tempfile::tempdir().unwrap();
        let err = execute(
            ImportArgs {
                lib_folder: Some(dir.path().to_path_buf()),
                ..ImportArgs::default()
            },
            &config,
        )
        .unwrap_err();
        assert!(err.to_string().contains("--download-file"));
    }

    #[test]
    fn file_and_folder_are_mutually_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::default();
        let err = execute(
            ImportArgs {
                lib_folder: Some(dir.path().to_path_buf()),
                download_file: Some(dir.path().join("a.zip")),
                download_folder: Some(dir.path().to_path_buf()),
                ..ImportArgs::default()
            },
            &config,
        )
        .unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn easyeda_conflicts_only_with_explicit_download_flags() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            source_folder: Some(dir.path().join("downloads")),
            ..AppConfig::default()
        };
        let err = execute(
            ImportArgs {
                lib_folder: Some(dir.path().join("libs")),
                download_folder: Some(dir.path().join("downloads")),
                easyeda: Some("C123456".into()),
                ..ImportArgs::default()
            },
            &config,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cannot be combined"));

        // A folder coming only from config must not trip the conflict check.
        let outcome = execute(
            ImportArgs {
                lib_folder: Some(dir.path().join("libs")),
                easyeda: Some("C123456".into()),
                ..ImportArgs::default()
            },
            &config,
        );
        if let Err(err) = outcome {
            assert!(!err.to_string().contains("cannot be combined"));
        }
    }

    #[test]
    fn config_supplies_fallback_values() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig {
            lib_folder: Some(dir.path().join("libs")),
            source_folder: Some(dir.path().join("missing-downloads")),
            ..AppConfig::default()
        };
        // The folder from config is used and found missing, proving the
        // fallback was taken.
        let err = execute(ImportArgs::default(), &config).unwrap_err();
        assert!(err.to_string().contains("download folder"));
    }

    #[test]
    fn variable_name_strips_the_wrapper() {
        assert_eq!(variable_name("${KICAD_3RD_PARTY}"), "KICAD_3RD_PARTY");
        assert_eq!(variable_name("PLAIN"), "PLAIN");
    }
}
