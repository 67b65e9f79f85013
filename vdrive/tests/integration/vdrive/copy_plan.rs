// vim: tw=80
use assert_cmd::prelude::*;
use predicates::prelude::*;

use super::*;

#[test]
fn from_the_start() {
    let (path, _tempdir) = description(concat!(module_path!(), "."), COPYING);
    vdrive()
        .arg("copy-plan")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::is_match(
                r"(?m)^user\s+74\s+0x0\s+0x100000$").unwrap())
        .stdout(predicate::str::is_match(
                r"(?m)^metadata\s+1\s+0x100000\s+0x100800$").unwrap());
}

/// A smaller consumption budget means more, smaller requests
#[test]
fn smaller_budget() {
    let (path, _tempdir) = description(concat!(module_path!(), "."), COPYING);
    vdrive()
        .arg("copy-plan")
        .arg(&path)
        .args(["-o", "copy_consumption_mb=4"])
        .assert()
        .success()
        .stdout(predicate::str::is_match(
                r"(?m)^user\s+171\s+0x0\s+0x100000$").unwrap());
}

/// Only the metadata remains to be copied
#[test]
fn metadata_only() {
    let yaml = COPYING.replace("[null, 0]", "[null, 1048576]");
    let (path, _tempdir) = description(concat!(module_path!(), "."), &yaml);
    vdrive()
        .arg("copy-plan")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("user").not())
        .stdout(predicate::str::is_match(
                r"(?m)^metadata\s+1\s+0x100000\s+0x100800$").unwrap());
}

#[test]
fn fully_rebuilt() {
    let yaml = COPYING.replace("[null, 0]", "[null, null]");
    let (path, _tempdir) = description(concat!(module_path!(), "."), &yaml);
    vdrive()
        .arg("copy-plan")
        .arg(&path)
        .assert()
        .success()
        .stdout("edge 1 is fully rebuilt\n");
}

#[test]
fn pass_thru() {
    let (path, _tempdir) = description(concat!(module_path!(), "."),
                                       EOL_PASS_THRU);
    vdrive()
        .arg("copy-plan")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("is not copying"));
}
