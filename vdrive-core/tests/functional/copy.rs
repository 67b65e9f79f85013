// vim: tw=80
use itertools::Itertools;
use pretty_assertions::assert_eq;
use rstest::rstest;

use vdrive_core::{services::*, *};

use super::*;

const COPYING: &str = r#"
mode: MirrorFirst
edges:
  - path_state: Enabled
    server_id: 100
  - path_state: Enabled
    server_id: 101
checkpoints: [null, 0]
"#;

fn context(vd: &VirtualDrive, lba: LbaT) -> RebuildContext {
    RebuildContext {
        start_lba: lba,
        block_count: vd.get_copy_block_count(lba),
        positions: EdgeIndex::Second.bit(),
        lun_id: OBJECT_ID_INVALID,
        state: RebuildState::Unknown,
    }
}

/// Successive requests tile the whole drive, and never straddle the end of
/// the user area.
#[tokio::test]
async fn requests_tile_the_drive() {
    let (mut vd, mem) = drive(COPYING);
    let exported = vd.rg().geometry.logical_capacity();
    let paged_end = vd.rg().geometry.paged_end();
    let mut lba = 0;
    while lba < paged_end {
        let mut ctx = context(&vd, lba);
        t!(vd.copy_send_event_to_check_lba(&mut ctx).await);
        lba += ctx.block_count;
    }
    assert_eq!(lba, paged_end);
    let journal = mem.journal();
    assert!(journal.needs_rebuild_cleared.is_empty());
    assert!(journal.rebuilds.iter()
        .tuple_windows()
        .all(|(a, b)| a.start_lba + a.block_count == b.start_lba));
    assert!(journal.rebuilds.iter()
        .all(|c| c.start_lba >= exported ||
             c.start_lba + c.block_count <= exported));
    // One permit request per user-area range
    let user = journal.rebuilds.iter()
        .filter(|c| c.start_lba < exported)
        .count();
    assert_eq!(journal.events.len(), user);
    assert!(journal.events.iter().all(|e| e.kind == EventKind::PermitRequest));
}

/// What happens to a range depends on how much of it upstream has consumed.
#[rstest]
#[case::all_consumed(true, 0, 1, 0, 14336)]
#[case::consumed_prefix(true, 4096, 1, 0, 10240)]
#[case::unconsumed_prefix(false, 4096, 0, 1, 4096)]
#[case::unconsumed(false, 0, 0, 1, 14336)]
#[tokio::test]
async fn permit(#[case] start_consumed: bool, #[case] unconsumed: BlockT,
                #[case] rebuilds: usize, #[case] cleared: usize,
                #[case] blocks: BlockT)
{
    let (mut vd, mem) = drive(COPYING);
    mem.push_reply(EventReply {
        start_consumed,
        unconsumed_blocks: unconsumed,
        ..EventReply::ok()
    });
    let mut ctx = context(&vd, 0);
    assert_eq!(ctx.block_count, 14336);
    let r = vd.copy_send_event_to_check_lba(&mut ctx).await;
    assert_eq!(t!(r), Status::MoreProcessing);
    assert_eq!(ctx.block_count, blocks);
    let journal = mem.journal();
    assert_eq!(journal.rebuilds.len(), rebuilds);
    assert_eq!(journal.needs_rebuild_cleared.len(), cleared);
}

#[rstest]
#[case::busy(EventReply::with_status(EventStatus::Busy))]
#[case::denied(EventReply::denied())]
#[tokio::test]
async fn permit_refused(#[case] reply: EventReply) {
    let (mut vd, mem) = drive(COPYING);
    mem.push_reply(reply);
    let mut ctx = context(&vd, 0);
    let r = vd.copy_send_event_to_check_lba(&mut ctx).await;
    assert_eq!(r, Err(Error::Busy));
    assert!(mem.journal().rebuilds.is_empty());

    // The scheduler retries, and upstream relents
    let r = vd.copy_send_event_to_check_lba(&mut ctx).await;
    assert_eq!(t!(r), Status::MoreProcessing);
    assert_eq!(mem.journal().rebuilds.len(), 1);
}

#[tokio::test]
async fn one_client_at_a_time() {
    let (mut vd, mem) = drive(COPYING);
    mem.journal().client_boundary = Some(1000);
    let mut ctx = context(&vd, 0);
    t!(vd.copy_send_event_to_check_lba(&mut ctx).await);
    assert_eq!(ctx.block_count, 1000);
    let journal = mem.journal();
    assert_eq!(journal.events[0].extent, Extent::new(0, 1000));
    assert_eq!(journal.rebuilds[0].block_count, 1000);
}

/// A media error in user space is marked for verify, and the copy moves on.
#[tokio::test]
async fn media_error() {
    let (mut vd, mem) = drive(COPYING);
    mem.push_rebuild_outcome(IoOutcome::MediaError);
    let mut ctx = context(&vd, 0);
    let r = vd.copy_send_event_to_check_lba(&mut ctx).await;
    assert_eq!(t!(r), Status::MoreProcessing);
    assert!(!vd.flags().copy_mark_verify_in_progress());
    let kinds = mem.journal().events.iter()
        .map(|e| e.kind)
        .collect::<Vec<_>>();
    assert_eq!(kinds, vec![EventKind::PermitRequest, EventKind::MarkVerify]);
}

/// A media error in the metadata can't be verified away.
#[tokio::test]
async fn metadata_media_error() {
    let (mut vd, mem) = drive(COPYING);
    mem.push_rebuild_outcome(IoOutcome::MediaError);
    let lba = vd.rg().geometry.logical_capacity();
    let mut ctx = context(&vd, lba);
    let r = vd.copy_send_event_to_check_lba(&mut ctx).await;
    assert_eq!(r, Err(Error::IoFailedNotRetryable));
    assert!(mem.journal().events.is_empty());
}
