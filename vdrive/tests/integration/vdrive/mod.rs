// vim: tw=80
use super::util::{description, vdrive};

mod complete;
mod copy_plan;
mod health;
mod monitor;
mod validate;

/// A pass-thru drive that is End-Of-Life, with no spare attached
const EOL_PASS_THRU: &str = r#"
id: 3
mode: PassThruFirst
edges:
  - path_state: Enabled
    server_id: 100
    attr:
      eol: true
"#;

/// A pass-thru drive whose only drive has failed
const BROKEN_PASS_THRU: &str = r#"
id: 4
mode: PassThruFirst
edges:
  - path_state: Broken
    server_id: 100
"#;

/// A mirror that hasn't started copying onto its second edge yet
const COPYING: &str = r#"
id: 5
mode: MirrorFirst
edges:
  - path_state: Enabled
    server_id: 100
    attr:
      eol: true
  - path_state: Enabled
    server_id: 101
checkpoints: [null, 0]
"#;
