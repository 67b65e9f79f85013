// vim: tw=80
use assert_cmd::prelude::*;
use predicates::prelude::*;
use rstest::rstest;

use super::*;

#[rstest]
#[case::proactive_copy("proactive-copy", "1",
                       "ProactiveCopy edge 1: allowed")]
#[case::wrong_edge("proactive-copy", "0",
                   "ProactiveCopy edge 0: refused")]
#[case::permanent_spare("permanent-spare", "0",
    "PermanentSpare edge 0: refused: A permanent spare is not required")]
#[case::swap_out_primary("complete-copy", "0", "CompleteCopy edge 0: refused")]
fn eol_pass_thru(#[case] command: &str, #[case] edge: &str,
                 #[case] expected: &str)
{
    let (path, _tempdir) = description(concat!(module_path!(), "."),
                                       EOL_PASS_THRU);
    vdrive()
        .arg("validate")
        .arg(&path)
        .args([command, edge])
        .assert()
        .success()
        .stdout(predicate::str::contains(expected));
}

#[rstest]
#[case::source("0", "CompleteCopy edge 0: allowed")]
#[case::destination("1",
    "CompleteCopy edge 1: refused: The current configuration mode doesn't \
     support the request")]
fn copy_complete(#[case] edge: &str, #[case] expected: &str) {
    let (path, _tempdir) = description(concat!(module_path!(), "."), r#"
mode: MirrorFirst
edges:
  - path_state: Enabled
    server_id: 100
  - path_state: Enabled
    server_id: 101
"#);
    vdrive()
        .arg("validate")
        .arg(&path)
        .args(["complete-copy", edge, "--no-confirm"])
        .assert()
        .success()
        .stdout(predicate::str::contains(expected));
}

#[test]
fn bad_edge() {
    let (path, _tempdir) = description(concat!(module_path!(), "."),
                                       EOL_PASS_THRU);
    vdrive()
        .arg("validate")
        .arg(&path)
        .args(["proactive-copy", "2"])
        .assert()
        .failure();
}
