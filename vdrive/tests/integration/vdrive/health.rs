// vim: tw=80
use assert_cmd::prelude::*;
use predicates::prelude::*;

use super::*;

#[test]
fn proactive_spare_needed() {
    let (path, _tempdir) = description(concat!(module_path!(), "."),
                                       EOL_PASS_THRU);
    vdrive()
        .arg("health")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("mode:                   pass-thru-first"))
        .stdout(predicate::str::contains("permanent spare needed: false"))
        .stdout(predicate::str::contains("proactive spare needed: true"))
        .stdout(predicate::str::contains("proactive spare edge:   1"));
}

#[test]
fn permanent_spare_needed() {
    let (path, _tempdir) = description(concat!(module_path!(), "."),
                                       BROKEN_PASS_THRU);
    vdrive()
        .arg("health")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("health:                 Broken"))
        .stdout(predicate::str::contains("permanent spare needed: true"))
        .stdout(predicate::str::contains("proactive spare needed: false"));
}

/// A mirror that finished copying swaps out its source
#[test]
fn copy_complete() {
    let (path, _tempdir) = description(concat!(module_path!(), "."), r#"
mode: MirrorFirst
edges:
  - path_state: Enabled
    server_id: 100
  - path_state: Enabled
    server_id: 101
"#);
    vdrive()
        .arg("health")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("copy complete:          true"))
        .stdout(predicate::str::contains("swap-out edge:          0"));
}

#[test]
fn missing_file() {
    vdrive()
        .args(["health", "/nonexistent/vd.yaml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("cannot read"));
}

#[test]
fn unknown_mode() {
    let (path, _tempdir) = description(concat!(module_path!(), "."),
                                       "mode: Unknown\n");
    vdrive()
        .arg("health")
        .arg(&path)
        .assert()
        .failure();
}
