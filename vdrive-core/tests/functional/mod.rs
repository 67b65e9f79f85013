// vim: tw=80
//! End-to-end tests of a virtual drive wired to the in-memory collaborators.
//!
//! The tests play the parts of the job service and the generic raid group:
//! they answer the virtual drive's requests, change edge states, and advance
//! rebuild checkpoints the way those objects would.

use vdrive_core::{
    mem::InMemory,
    services::*,
    virtual_drive::{DriveDescription, VirtualDrive},
};

macro_rules! t {
    ($e:expr) => (match $e {
        Ok(e) => e,
        Err(e) => panic!("{} failed with {:?}", stringify!($e), e),
    })
}

mod copy;
mod lifecycle;
mod scenarios;

/// Build a virtual drive from a YAML description.  Its persisted non-paged
/// record starts out equal to the in-core one.
fn drive(yaml: &str) -> (VirtualDrive, InMemory) {
    let desc = t!(DriveDescription::from_yaml(yaml));
    let mem = InMemory::new();
    let vd = t!(VirtualDrive::from_description(desc, mem.services()));
    mem.journal().nonpaged = vd.np().encode_body();
    (vd, mem)
}

/// Run the monitor until no condition changes.
///
/// Each pass runs every set condition once.  The virtual drive's own
/// conditions go to `run_condition`; the raid group's are simply cleared.
/// Returns the virtual drive conditions that ran, in order.
async fn drain(vd: &mut VirtualDrive, mem: &InMemory) -> Vec<Condition> {
    let mut ran = Vec::new();
    for _ in 0..8 {
        let before: Vec<Condition> = mem.journal().conditions.iter()
            .cloned()
            .collect();
        if before.is_empty() {
            break;
        }
        for cond in before.iter().cloned() {
            if cond.is_virtual_drive_condition() {
                t!(vd.run_condition(cond).await);
                ran.push(cond);
            } else {
                mem.clear_condition(cond);
            }
        }
        let after: Vec<Condition> = mem.journal().conditions.iter()
            .cloned()
            .collect();
        if after == before {
            break;
        }
    }
    ran
}
