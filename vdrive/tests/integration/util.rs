// vim: tw=80
use std::{fs, path::PathBuf, process::Command};

use assert_cmd::prelude::*;
use tempfile::{Builder, TempDir};

pub fn vdrive() -> Command {
    Command::cargo_bin("vdrive").unwrap()
}

/// Write a drive description into a fresh temporary directory.
///
/// The directory lives as long as the returned `TempDir`.
pub fn description(prefix: &str, yaml: &str) -> (PathBuf, TempDir) {
    let tempdir = Builder::new()
        .prefix(prefix)
        .tempdir()
        .unwrap();
    let path = tempdir.path().join("vd.yaml");
    fs::write(&path, yaml).unwrap();
    (path, tempdir)
}
