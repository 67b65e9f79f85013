// vim: tw=80
use std::fs;

use assert_cmd::prelude::*;
use pretty_assertions::assert_eq;
use predicates::prelude::*;
use rstest::rstest;
use vdrive_core::{nonpaged::NonPagedMetadata, *};

use super::*;

/// A drive that has just dropped its second edge
fn swapped_out(checkpoints: &str) -> String {
    format!(r#"
id: 8
mode: PassThruFirst
edges:
  - path_state: Enabled
    server_id: 101
checkpoints: {checkpoints}
"#)
}

#[rstest]
#[case::copy("copy", "[null, null]", "checkpoint 1: unused")]
#[case::dest_failed("dest-failed", "[4096, 8192]",
                    "checkpoint 1: 0x1000 edge 0")]
#[case::dest_failed_rebuilt("dest-failed", "[null, 8192]",
                            "checkpoint 1: unused")]
#[case::copy_failed("copy-failed", "[4096, null]",
                    "checkpoint 1: 0x1000 edge 0")]
fn outcome(#[case] result: &str, #[case] checkpoints: &str,
           #[case] second_slot: &str)
{
    let (path, _tempdir) = description(concat!(module_path!(), "."),
                                       &swapped_out(checkpoints));
    vdrive()
        .arg("complete")
        .arg(&path)
        .arg(result)
        .assert()
        .success()
        .stdout(predicate::str::contains("checkpoint 0: 0x0 edge 1"))
        .stdout(predicate::str::contains(second_slot))
        .stdout(predicate::str::contains("rebuild logging: 0b0010"));
}

/// If neither drive finished rebuilding, the metadata can't be trusted.
#[test]
fn copy_failed_inconsistent() {
    let (path, _tempdir) = description(concat!(module_path!(), "."),
                                       &swapped_out("[4096, 8192]"));
    vdrive()
        .arg("complete")
        .arg(&path)
        .arg("copy-failed")
        .assert()
        .failure();
}

/// Only the edge that is no longer in use may be named
#[test]
fn wrong_edge() {
    let (path, _tempdir) = description(concat!(module_path!(), "."),
                                       &swapped_out("[null, null]"));
    vdrive()
        .arg("complete")
        .arg(&path)
        .args(["copy", "--edge", "0"])
        .assert()
        .failure();
}

#[test]
fn still_a_mirror() {
    let (path, _tempdir) = description(concat!(module_path!(), "."), COPYING);
    vdrive()
        .arg("complete")
        .arg(&path)
        .args(["copy", "--edge", "0"])
        .assert()
        .failure();
}

#[test]
fn dump() {
    let (path, tempdir) = description(concat!(module_path!(), "."),
                                      &swapped_out("[4096, 8192]"));
    let dump = tempdir.path().join("np.bin");
    vdrive()
        .arg("complete")
        .arg(&path)
        .arg("dest-failed")
        .arg("--dump")
        .arg(&dump)
        .assert()
        .success();
    let buf = fs::read(&dump).unwrap();
    let np: NonPagedMetadata = bincode::deserialize(&buf).unwrap();
    assert_eq!(np.rebuild.checkpoint(EdgeIndex::Second), 0);
    assert_eq!(np.rebuild.checkpoint(EdgeIndex::First), 4096);
    assert!(np.rebuild.is_rebuild_logging(EdgeIndex::Second));
    assert!(!np.rebuild.is_rebuild_logging(EdgeIndex::First));
}
