// vim: tw=80
//! Whole swaps, from the first sign of trouble to the job service's final
//! acknowledgement
use std::time::Duration;

use pretty_assertions::assert_eq;

use vdrive_core::{
    config_mode::ConfigMode,
    edge::PathState,
    nonpaged::RebuildInfo,
    services::*,
    swap::{SwapCompletion, SwapValidation},
    validation::SwapStatus,
    *
};

use super::*;

/// Advance the destination's checkpoint the way the raid group's rebuild
/// would, copying every range that the virtual drive hands out.
async fn copy_everything(vd: &mut VirtualDrive, dest: EdgeIndex) {
    let paged_end = vd.rg().geometry.paged_end();
    let exported = vd.rg().exported_capacity();
    let mut lba = 0;
    let mut halfway = false;
    while lba < paged_end {
        let mut ctx = RebuildContext {
            start_lba: lba,
            block_count: vd.get_copy_block_count(lba),
            positions: dest.bit(),
            lun_id: OBJECT_ID_INVALID,
            state: RebuildState::Unknown,
        };
        let status = t!(vd.copy_send_event_to_check_lba(&mut ctx).await);
        assert_eq!(status, Status::MoreProcessing);
        lba += ctx.block_count;
        let mut checkpoints = [None; 2];
        checkpoints[dest.idx()] = Some(lba);
        vd.rg_mut().np.rebuild = RebuildInfo::from_parts(checkpoints,
                                                          [false; 2]);
        if lba >= exported / 2 && !halfway {
            t!(vd.run_condition(Condition::BackgroundMonitorOperation).await);
            halfway = true;
        }
    }
    vd.rg_mut().np.rebuild = RebuildInfo::default();
}

fn reconstruction(mem: &InMemory, pvd: ObjectId)
    -> Vec<(ReconstructionState, u32)>
{
    mem.journal().notifications.iter()
        .filter(|(id, _)| *id == pvd)
        .filter_map(|(_, n)| match n {
            Notification::DataReconstruction { state, percent } =>
                Some((*state, *percent)),
            _ => None
        }).collect()
}

/// An End-Of-Life drive is proactively copied to a spare, and then swapped
/// out.
#[test_log::test(tokio::test)]
async fn proactive_copy() {
    let (mut vd, mem) = drive(r#"
id: 5
mode: PassThruFirst
edges:
  - path_state: Enabled
    server_id: 100
    attr:
      eol: true
config:
  proactive_copy_trigger_time: 0
"#);

    // The monitor notices the End-Of-Life drive and asks for a spare
    mem.set_condition(Condition::EvaluateDownstreamHealth);
    let ran = drain(&mut vd, &mem).await;
    assert_eq!(ran, vec![Condition::EvaluateDownstreamHealth,
                         Condition::NeedProactiveSpare]);
    {
        let journal = mem.journal();
        assert_eq!(journal.swap_requests.len(), 1);
        let request = journal.swap_requests[0];
        assert_eq!(request.command, SwapCommand::ProactiveCopy);
        assert_eq!(request.swap_idx, EdgeIndex::Second);
        assert_eq!(request.mirror_idx, Some(EdgeIndex::First));
        assert!(request.is_proactive_copy);
    }

    // The job service swaps the spare in and makes the drive a mirror
    let validation = SwapValidation {
        command: SwapCommand::ProactiveCopy,
        swap_idx: EdgeIndex::Second,
        confirmation_enabled: true,
    };
    assert_eq!(t!(vd.validate_swap_in_command(validation).await), Ok(()));
    assert_eq!(vd.swap_in_edge(), Some(EdgeIndex::Second));
    vd.rg_mut().edge_mut(EdgeIndex::Second).server_id = 200;
    vd.handle_edge_state_change(EdgeIndex::Second, PathState::Enabled);
    vd.set_new_mode(ConfigMode::MirrorFirst);
    t!(vd.change_configuration_mode());
    drain(&mut vd, &mem).await;
    assert_eq!(vd.mode(), ConfigMode::MirrorFirst);
    assert!(vd.np().flags.swapped_in());
    assert!(vd.np().flags.mark_nr_required());
    assert_eq!(t!(mem.journal().persisted()).flags, vd.np().flags);
    assert!(mem.journal().notifications.contains(&(5,
        Notification::SwapInfo {
            orig_pvd: 100,
            spare_pvd: 200,
            command: SwapCommand::ProactiveCopy,
            vd: 5
        })));
    let completion = SwapCompletion {
        command: SwapCommand::ProactiveCopy,
        swap_idx: EdgeIndex::Second,
        status: JobError::NoError,
        operation_confirmation: true,
    };
    t!(vd.handle_swap_request_completion(completion));
    assert_eq!(drain(&mut vd, &mem).await,
               vec![Condition::SwapOperationComplete]);
    vd.swap_command_complete();
    assert!(vd.rg().attributes.proactive_sparing);

    // The raid group marks the spare for rebuild, and the copy runs
    vd.rg_mut().np.rebuild = RebuildInfo::from_parts([None, Some(0)],
                                                     [false; 2]);
    assert!(!vd.is_copy_complete());
    t!(vd.run_condition(Condition::BackgroundMonitorOperation).await);
    copy_everything(&mut vd, EdgeIndex::Second).await;
    assert!(vd.is_copy_complete());
    t!(vd.run_condition(Condition::BackgroundMonitorOperation).await);
    assert_eq!(reconstruction(&mem, 100), vec![
        (ReconstructionState::Start, 0),
        (ReconstructionState::InProgress, 50),
        (ReconstructionState::InProgress, 100),
        (ReconstructionState::End, 100),
    ]);

    // The finished copy asks for the source to be swapped out
    mem.set_condition(Condition::EvaluateDownstreamHealth);
    let ran = drain(&mut vd, &mem).await;
    assert_eq!(ran, vec![Condition::EvaluateDownstreamHealth,
                         Condition::IsCopyComplete]);
    {
        let journal = mem.journal();
        assert_eq!(journal.swap_requests.len(), 2);
        let request = journal.swap_requests[1];
        assert_eq!(request.command, SwapCommand::CompleteCopy);
        assert_eq!(request.swap_idx, EdgeIndex::First);
    }

    // The job service detaches the old drive
    let validation = SwapValidation {
        command: SwapCommand::CompleteCopy,
        swap_idx: EdgeIndex::First,
        confirmation_enabled: true,
    };
    assert_eq!(vd.validate_swap_out_command(validation), Ok(()));
    vd.handle_edge_state_change(EdgeIndex::First, PathState::Invalid);
    vd.set_new_mode(ConfigMode::PassThruSecond);
    t!(vd.change_configuration_mode());
    drain(&mut vd, &mem).await;
    assert_eq!(vd.mode(), ConfigMode::PassThruSecond);
    assert_eq!(mem.journal().degraded_needs_rebuild, Some(false));
    t!(vd.set_checkpoint_copy_complete());
    let ran = drain(&mut vd, &mem).await;
    assert!(ran.contains(&Condition::SetRebuildCheckpointToEndMarker));
    assert_eq!(vd.set_checkpoint_copy_complete(), Err(Error::GenericFailure));
    t!(vd.swap_out_validate_nonpaged_metadata(EdgeIndex::First));
    assert_eq!(vd.rg().checkpoint(EdgeIndex::First), 0);
    assert_eq!(vd.rg().checkpoint(EdgeIndex::Second), END_MARKER);
    assert!(vd.rg().is_rebuild_logging(EdgeIndex::First));

    let completion = SwapCompletion {
        command: SwapCommand::CompleteCopy,
        swap_idx: EdgeIndex::First,
        status: JobError::NoError,
        operation_confirmation: true,
    };
    t!(vd.handle_swap_request_completion(completion));
    let ran = drain(&mut vd, &mem).await;
    assert!(ran.contains(&Condition::CopyComplete));
    vd.swap_command_complete();

    assert!(!vd.flags().swap_request_in_progress());
    assert!(!vd.rg().attributes.proactive_sparing);
    assert!(!vd.rg().clustered.swap_job_in_progress());
    let journal = mem.journal();
    assert!(journal.conditions.is_empty());
    assert_eq!(t!(journal.persisted()).rebuild, vd.np().rebuild);
    assert_eq!(t!(journal.persisted()).flags, vd.np().flags);
    assert_eq!(journal.event_codes(), vec![EventCode::CopyCompleted]);
}

/// A drive that has been missing long enough gets a permanent spare.
#[test_log::test(tokio::test(start_paused = true))]
async fn permanent_spare() {
    let (mut vd, mem) = drive(r#"
id: 6
mode: PassThruFirst
edges:
  - path_state: Broken
    server_id: 100
config:
  permanent_spare_trigger_time: 10
"#);

    // The drive failed.  The raid group fails the virtual drive, whose
    // failed-state monitor waits for a replacement.
    mem.set_condition(Condition::EvaluateDownstreamHealth);
    drain(&mut vd, &mem).await;
    vd.rg_mut().lifecycle = LifecycleState::Fail;
    mem.set_condition(Condition::NeedReplacementDrive);
    drain(&mut vd, &mem).await;
    assert!(mem.journal().swap_requests.is_empty());
    assert!(mem.is_condition_set(Condition::NeedReplacementDrive));

    tokio::time::advance(Duration::from_secs(11)).await;
    assert_eq!(drain(&mut vd, &mem).await,
               vec![Condition::NeedReplacementDrive]);
    {
        let journal = mem.journal();
        assert_eq!(journal.swap_requests.len(), 1);
        let request = journal.swap_requests[0];
        assert_eq!(request.command, SwapCommand::PermanentSpare);
        assert_eq!(request.swap_idx, EdgeIndex::First);
        assert_eq!(request.mirror_idx, None);
    }

    // The job service swaps a spare into the failed position
    let validation = SwapValidation {
        command: SwapCommand::PermanentSpare,
        swap_idx: EdgeIndex::First,
        confirmation_enabled: true,
    };
    assert_eq!(t!(vd.validate_swap_in_command(validation).await), Ok(()));
    t!(vd.save_original_pvd_object_id());
    assert_eq!(vd.orig_pvd(), 100);
    vd.rg_mut().edge_mut(EdgeIndex::First).server_id = 300;
    vd.handle_edge_state_change(EdgeIndex::First, PathState::Enabled);
    vd.rg_mut().lifecycle = LifecycleState::Ready;
    vd.rg_mut().np.rebuild = RebuildInfo::from_parts([Some(0), None],
                                                     [false; 2]);
    vd.set_new_mode(ConfigMode::PassThruFirst);
    t!(vd.change_configuration_mode());
    let completion = SwapCompletion {
        command: SwapCommand::PermanentSpare,
        swap_idx: EdgeIndex::First,
        status: JobError::NoError,
        operation_confirmation: true,
    };
    t!(vd.handle_swap_request_completion(completion));
    drain(&mut vd, &mem).await;
    vd.swap_command_complete();

    assert!(!vd.timers().need_replacement_drive.is_running());
    assert!(vd.np().flags.degraded_needs_rebuild());
    let journal = mem.journal();
    assert_eq!(journal.degraded_needs_rebuild, Some(true));
    assert_eq!(t!(journal.persisted()).flags, vd.np().flags);
    assert!(journal.notifications.contains(&(6, Notification::SwapInfo {
        orig_pvd: 100,
        spare_pvd: 300,
        command: SwapCommand::PermanentSpare,
        vd: 6
    })));
    assert!(journal.conditions.is_empty());
}

/// The destination fails mid-copy.  The copy is abandoned, the destination
/// swapped out, and the source keeps going alone.
#[tokio::test]
async fn destination_fails() {
    let (mut vd, mem) = drive(r#"
id: 8
mode: MirrorFirst
edges:
  - path_state: Enabled
    server_id: 100
    attr:
      eol: true
  - path_state: Enabled
    server_id: 101
checkpoints: [null, 65536]
np_flags:
  swapped_in: true
config:
  permanent_spare_trigger_time: 0
"#);
    t!(vd.run_condition(Condition::BackgroundMonitorOperation).await);

    vd.handle_edge_state_change(EdgeIndex::Second, PathState::Broken);
    assert_eq!(mem.journal().aborts, 3);
    let ran = drain(&mut vd, &mem).await;
    assert_eq!(ran, vec![Condition::EvaluateDownstreamHealth,
                         Condition::NeedReplacementDrive,
                         Condition::AbortCopy]);
    // The raid group starts rebuild logging to the failed destination
    vd.rg_mut().np.rebuild = RebuildInfo::from_parts([None, Some(65536)],
                                                     [false, true]);
    {
        let journal = mem.journal();
        assert_eq!(journal.events.last().map(|e| e.kind),
                   Some(EventKind::AbortCopyRequest));
        assert_eq!(journal.event_codes(),
                   vec![EventCode::CopyDestinationDriveRemoved]);
        assert_eq!(journal.swap_requests.len(), 1);
        assert_eq!(journal.swap_requests[0].command, SwapCommand::AbortCopy);
        assert_eq!(journal.swap_requests[0].swap_idx, EdgeIndex::Second);
    }

    let validation = SwapValidation {
        command: SwapCommand::AbortCopy,
        swap_idx: EdgeIndex::Second,
        confirmation_enabled: true,
    };
    assert_eq!(vd.validate_swap_out_command(validation), Ok(()));
    t!(vd.run_condition(Condition::BackgroundMonitorOperation).await);
    assert_eq!(reconstruction(&mem, 100), vec![
        (ReconstructionState::Start, 0),
        (ReconstructionState::End, 0),
    ]);

    vd.handle_edge_state_change(EdgeIndex::Second, PathState::Invalid);
    vd.set_new_mode(ConfigMode::PassThruFirst);
    t!(vd.change_configuration_mode());
    drain(&mut vd, &mem).await;
    t!(vd.set_checkpoint_copy_failed());
    let ran = drain(&mut vd, &mem).await;
    assert!(ran.contains(
        &Condition::DestDriveFailedSetRebuildCheckpointToEndMarker));
    t!(vd.swap_out_validate_nonpaged_metadata(EdgeIndex::Second));
    assert_eq!(t!(mem.journal().persisted()).rebuild, vd.np().rebuild);

    let completion = SwapCompletion {
        command: SwapCommand::AbortCopy,
        swap_idx: EdgeIndex::Second,
        status: JobError::NoError,
        operation_confirmation: true,
    };
    t!(vd.handle_swap_request_completion(completion));
    drain(&mut vd, &mem).await;
    vd.swap_command_complete();
    assert_eq!(vd.mode(), ConfigMode::PassThruFirst);
    assert!(!vd.flags().swap_request_in_progress());
    // The surviving drive is still End-Of-Life, so it wants another spare
    assert_eq!(vd.check_if_proactive_spare_needed(),
               (true, Some(EdgeIndex::Second)));
}

/// Cleanup runs once, however many times the monitor fires.
#[tokio::test]
async fn cleanup_is_idempotent() {
    let (mut vd, mem) = drive(r#"
mode: PassThruFirst
edges:
  - path_state: Broken
    server_id: 100
"#);
    assert_eq!(t!(vd.request_permanent_spare()), Status::MoreProcessing);
    let completion = SwapCompletion {
        command: SwapCommand::PermanentSpare,
        swap_idx: EdgeIndex::First,
        status: JobError::NoSuitableSpare,
        operation_confirmation: true,
    };
    t!(vd.handle_swap_request_completion(completion));
    for _ in 0..3 {
        t!(vd.run_condition(Condition::SwapOperationComplete).await);
    }
    vd.swap_command_complete();
    assert_eq!(mem.journal().event_codes(),
               vec![EventCode::SpareNoSuitableSpareAvailable]);
}

/// A proactive copy can't start while the source is still rebuilding.
#[tokio::test]
async fn proactive_copy_refused_while_degraded() {
    let (mut vd, mem) = drive(r#"
mode: PassThruFirst
edges:
  - path_state: Enabled
    server_id: 100
    attr:
      eol: true
checkpoints: [4096, null]
"#);
    let validation = SwapValidation {
        command: SwapCommand::ProactiveCopy,
        swap_idx: EdgeIndex::Second,
        confirmation_enabled: true,
    };
    for _ in 0..2 {
        let r = t!(vd.validate_swap_in_command(validation).await);
        assert_eq!(r, Err(SwapStatus::VirtualDriveDegraded));
    }
    assert_eq!(vd.swap_in_edge(), None);
    assert_eq!(mem.journal().event_codes(),
               vec![EventCode::ProactiveSpareRequestDenied]);
}

/// A failed metadata write leaves the in-core flags alone.
#[tokio::test]
async fn metadata_write_fails() {
    let (mut vd, mem) = drive(r#"
mode: PassThruFirst
edges:
  - path_state: Enabled
    server_id: 100
    attr:
      eol: true
  - path_state: Enabled
    server_id: 200
"#);
    vd.set_copy_request_type(SwapCommand::ProactiveCopy);
    vd.set_new_mode(ConfigMode::MirrorFirst);
    t!(vd.change_configuration_mode());
    mem.journal().fail_metadata_writes = true;
    let r = vd.run_condition(Condition::ConfigurationChange).await;
    assert_eq!(r, Err(Error::MetadataWrite));
    assert!(!vd.np().flags.swapped_in());
    assert!(mem.is_condition_set(Condition::ConfigurationChange));
}
