// vim: tw=80
use std::time::Duration;

use futures::FutureExt;
use pretty_assertions::assert_eq;
use rstest::rstest;
use tempfile::Builder;

use vdrive_core::{
    services::*,
    swap::SwapCompletion,
    virtual_drive::DriveDescription,
    *
};

use super::*;

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

#[test]
fn proactive_spare_needed() {
    let (vd, _mem) = drive(EOL_PASS_THRU);
    assert_eq!(vd.check_if_proactive_spare_needed(),
               (true, Some(EdgeIndex::Second)));
}

#[test]
fn proactive_spare_not_needed_while_rebuilding() {
    let (vd, _mem) = drive(&format!("{EOL_PASS_THRU}checkpoints: [0, null]\n"));
    assert_eq!(vd.check_if_proactive_spare_needed(), (false, None));
}

#[test]
fn swap_out_source_after_copy() {
    let (vd, _mem) = drive(r#"
mode: MirrorFirst
edges:
  - path_state: Enabled
    server_id: 100
  - path_state: Enabled
    server_id: 101
"#);
    assert!(vd.is_copy_complete());
    assert_eq!(t!(vd.get_swap_out_edge_index()), Some(EdgeIndex::First));
}

#[test]
fn metadata_copy_skips_permit() {
    let (mut vd, mem) = drive(r#"
mode: MirrorFirst
edges:
  - path_state: Enabled
    server_id: 100
  - path_state: Enabled
    server_id: 101
checkpoints: [null, 1048576]
"#);
    let lba = vd.rg().geometry.logical_capacity();
    let mut ctx = RebuildContext {
        start_lba: lba,
        block_count: vd.get_copy_block_count(lba),
        positions: EdgeIndex::Second.bit(),
        lun_id: OBJECT_ID_INVALID,
        state: RebuildState::Unknown,
    };
    let r = vd.copy_send_event_to_check_lba(&mut ctx).now_or_never().unwrap();
    assert_eq!(t!(r), Status::MoreProcessing);
    let journal = mem.journal();
    assert!(journal.events.is_empty());
    assert_eq!(journal.rebuilds.len(), 1);
    assert_eq!(journal.rebuilds[0].state, RebuildState::RebuildIo);
}

/// A pass-thru drive whose only drive has failed
const FAILED_PASS_THRU: &str = r#"
mode: PassThruFirst
edges:
  - path_state: Broken
    server_id: 100
"#;

const NO_SPARES: SwapCompletion = SwapCompletion {
    command: SwapCommand::PermanentSpare,
    swap_idx: EdgeIndex::First,
    status: JobError::PresentlyNoSpares,
    operation_confirmation: false,
};

/// "No spares" is logged once, however many times the job service says it,
/// and the monitor persists the fact that it was logged.
#[tokio::test]
async fn no_spares_logged_once() {
    let (mut vd, mem) = drive(FAILED_PASS_THRU);
    for _ in 0..2 {
        assert_eq!(t!(vd.request_permanent_spare()), Status::MoreProcessing);
        t!(vd.handle_swap_request_completion(NO_SPARES));
        vd.swap_command_complete();
        assert!(vd.flags().no_spare_reported());
        drain(&mut vd, &mem).await;
    }
    assert!(vd.has_no_spare_been_reported());
    let journal = mem.journal();
    assert_eq!(journal.swap_requests.len(), 2);
    assert_eq!(journal.event_codes(), vec![EventCode::SpareNoSparesAvailable]);
    assert!(t!(journal.persisted()).flags.no_spare_reported());
    assert_eq!(journal.nonpaged_writes.len(), 1);
    assert!(journal.conditions.is_empty());
}

/// After a restart, only the persisted flag remembers that "no spares" was
/// logged.
#[tokio::test]
async fn no_spares_not_relogged_after_restart() {
    let (mut vd, mem) = drive(FAILED_PASS_THRU);
    assert_eq!(t!(vd.request_permanent_spare()), Status::MoreProcessing);
    t!(vd.handle_swap_request_completion(NO_SPARES));
    vd.swap_command_complete();
    drain(&mut vd, &mem).await;
    drop(vd);

    let desc = t!(DriveDescription::from_yaml(FAILED_PASS_THRU));
    let mut vd = t!(VirtualDrive::from_description(desc, mem.services()));
    vd.rg_mut().np = t!(mem.journal().persisted());
    assert!(vd.has_no_spare_been_reported());
    assert!(!vd.flags().no_spare_reported());
    assert_eq!(t!(vd.request_permanent_spare()), Status::MoreProcessing);
    t!(vd.handle_swap_request_completion(NO_SPARES));
    vd.swap_command_complete();
    drain(&mut vd, &mem).await;
    assert_eq!(mem.journal().event_codes(),
               vec![EventCode::SpareNoSparesAvailable]);
}

/// The job service's user copy is started by the monitor.
#[tokio::test]
async fn user_copy_started_by_monitor() {
    let (mut vd, mem) = drive(r#"
mode: PassThruFirst
edges:
  - path_state: Enabled
    server_id: 100
  - path_state: Enabled
    server_id: 200
"#);
    t!(vd.initiate_user_copy(SwapCommand::UserCopyTo, true));
    assert!(!vd.flags().swap_request_in_progress());
    assert_eq!(drain(&mut vd, &mem).await, vec![Condition::StartUserCopy]);
    assert!(vd.flags().swap_request_in_progress());
    assert!(vd.flags().user_copy_started());
    assert!(vd.rg().clustered.swap_job_in_progress());
    assert_eq!(mem.journal().reschedules, vec![Duration::ZERO]);
}

/// When both mirror edges are gone, the nominal primary is removed.
#[rstest]
#[case::both_broken("Broken", "Broken")]
#[case::disabled_and_broken("Disabled", "Broken")]
#[case::broken_and_disabled("Broken", "Disabled")]
fn swap_out_tie_break(#[case] first: &str, #[case] second: &str) {
    let (vd, _mem) = drive(&format!(r#"
mode: MirrorSecond
edges:
  - path_state: {first}
    server_id: 100
  - path_state: {second}
    server_id: 101
"#));
    assert_eq!(t!(vd.get_swap_out_edge_index()), Some(EdgeIndex::Second));
}

#[test]
fn description_from_file() {
    let tempdir = t!(Builder::new().prefix("description_from_file").tempdir());
    let path = tempdir.path().join("vd.yaml");
    t!(std::fs::write(&path, EOL_PASS_THRU));
    let yaml = t!(std::fs::read_to_string(&path));
    let desc = t!(DriveDescription::from_yaml(&yaml));
    assert_eq!(desc.id, 3);
    assert!(desc.edges[0].attr.eol);
}
