// vim: tw=80
use assert_cmd::prelude::*;
use predicates::prelude::*;

use super::*;

/// Once the End-Of-Life trigger time has passed, the monitor asks the job
/// service for a proactive spare.
#[test]
fn proactive_copy_requested() {
    let (path, _tempdir) = description(concat!(module_path!(), "."),
                                       EOL_PASS_THRU);
    vdrive()
        .arg("monitor")
        .arg(&path)
        .args(["-o", "proactive_copy_trigger_time=0"])
        .assert()
        .success()
        .stdout(predicate::str::contains("run EvaluateDownstreamHealth: Done"))
        .stdout(predicate::str::contains(
                "run NeedProactiveSpare: MoreProcessing"))
        .stdout(predicate::str::contains("swap request: ProactiveCopy edge 1"));
}

/// Before the trigger time, the monitor just keeps waiting.
#[test]
fn proactive_copy_waits() {
    let (path, _tempdir) = description(concat!(module_path!(), "."),
                                       EOL_PASS_THRU);
    vdrive()
        .arg("monitor")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("run NeedProactiveSpare: Done"))
        .stdout(predicate::str::contains("swap request").not());
}

/// A failed drive is left to the raid group
#[test]
fn broken() {
    let (path, _tempdir) = description(concat!(module_path!(), "."),
                                       BROKEN_PASS_THRU);
    vdrive()
        .arg("monitor")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("raid group DownstreamHealthBroken"))
        .stdout(predicate::str::contains("swap request").not());
}

#[test]
fn bad_option() {
    let (path, _tempdir) = description(concat!(module_path!(), "."),
                                       EOL_PASS_THRU);
    vdrive()
        .arg("monitor")
        .arg(&path)
        .args(["-o", "chunk_size=0"])
        .assert()
        .failure();
    vdrive()
        .arg("monitor")
        .arg(&path)
        .args(["-o", "frobnicate=1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid option"));
}
