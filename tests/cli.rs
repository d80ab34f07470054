//! Binary-level tests for argument handling and exit codes.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

const CURRENT_SYM: &str = concat!(
    "(kicad_symbol_lib (version 20211014) (generator test)\n",
    "  (symbol \"CP2102N\" (in_bom yes)\n",
    "    (property \"Reference\" \"U\" (at 0 0 0))\n",
    "    (property \"Footprint\" \"old\" (at 0 0 0))\n",
    "  )\n",
    ")\n",
);

/// Deflate-resistant filler so small fixtures still clear the archive
/// size floor after compression.
fn noise(len: usize) -> Vec<u8> {
    let mut state = 1u32;
    (0..len)
        .map(|_| {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            state.to_le_bytes()[3]
        })
        .collect()
}

fn build_zip(dir: &Path, name: &str, entries: &[(&str, &[u8])]) -> PathBuf {
    let path = dir.join(name);
    let file = fs::File::create(&path).unwrap();
    let mut writer = zip::ZipWriter::new(file);
    let options = zip::write::SimpleFileOptions::default();
    for (member, contents) in entries {
        writer.start_file(*member, options).unwrap();
        writer.write_all(contents).unwrap();
    }
    writer.finish().unwrap();
    path
}

/// A command whose config and data dirs live inside `home`, so the user's
/// real configuration never leaks into a test.
fn partforge(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("partforge").unwrap();
    cmd.env("HOME", home);
    cmd
}

#[test]
fn help_prints_usage() {
    let home = tempfile::tempdir().unwrap();
    partforge(home.path())
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage: partforge"))
        .stdout(predicate::str::contains("--download-file"));
}

#[test]
fn version_prints_the_crate_version() {
    let home = tempfile::tempdir().unwrap();
    partforge(home.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn unknown_option_is_rejected() {
    let home = tempfile::tempdir().unwrap();
    partforge(home.path())
        .arg("--frobnicate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown option --frobnicate"));
}

#[test]
fn missing_source_is_an_error() {
    let home = tempfile::tempdir().unwrap();
    let lib = home.path().join("lib");
    partforge(home.path())
        .args(["--lib-folder"])
        .arg(&lib)
        .assert()
        .failure()
        .stderr(predicate::str::contains("--download-file"));
}

#[test]
fn single_archive_import_reports_ok() {
    let home = tempfile::tempdir().unwrap();
    let lib = home.path().join("lib");
    let archive = build_zip(
        home.path(),
        "cp2102n.zip",
        &[("CP2102N.kicad_sym", CURRENT_SYM.as_bytes())],
    );

    partforge(home.path())
        .args(["--download-file"])
        .arg(&archive)
        .args(["--lib-folder"])
        .arg(&lib)
        .assert()
        .success()
        .stdout(predicate::str::contains("cp2102n.zip: OK"));
    assert!(lib.join("Snapeda.kicad_sym").exists());
}

#[test]
fn failed_archive_in_a_folder_sets_the_exit_code() {
    let home = tempfile::tempdir().unwrap();
    let lib = home.path().join("lib");
    let source = home.path().join("downloads");
    fs::create_dir_all(&source).unwrap();
    let padding = noise(2048);
    build_zip(&source, "junk.zip", &[("README.txt", padding.as_slice())]);

    partforge(home.path())
        .args(["--download-folder"])
        .arg(&source)
        .args(["--lib-folder"])
        .arg(&lib)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("unrecognized archive layout"));
}

#[test]
fn kicad_config_registration_follows_an_import() {
    let home = tempfile::tempdir().unwrap();
    let lib = home.path().join("lib");
    let config_dir = home.path().join("kicad");
    fs::create_dir_all(&config_dir).unwrap();
    let archive = build_zip(
        home.path(),
        "cp2102n.zip",
        &[("CP2102N.kicad_sym", CURRENT_SYM.as_bytes())],
    );

    partforge(home.path())
        .args(["--download-file"])
        .arg(&archive)
        .args(["--lib-folder"])
        .arg(&lib)
        .args(["--kicad-config"])
        .arg(&config_dir)
        .assert()
        .success();

    let table = fs::read_to_string(config_dir.join("sym-lib-table")).unwrap();
    assert!(table.contains("(name \"Snapeda\")"));
    assert!(table.contains("${KICAD_3RD_PARTY}/Snapeda.kicad_sym"));

    let common = fs::read_to_string(config_dir.join("kicad_common.json")).unwrap();
    assert!(common.contains("KICAD_3RD_PARTY"));
}
