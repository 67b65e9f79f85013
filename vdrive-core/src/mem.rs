// vim: tw=80
//! In-memory collaborators
//!
//! A single shared [`Journal`] stands in for every collaborator of a virtual
//! drive.  It persists non-paged writes into an in-memory record, answers
//! upstream events from a script, and records everything else it is asked to
//! do.  Used by the functional tests and the `vdrive` CLI.

use std::{
    collections::{BTreeSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use futures::future;
use tracing::trace;

use crate::{
    nonpaged::*,
    services::*,
    types::*,
    virtual_drive::Services,
};

/// Everything the in-memory collaborators know and have been asked to do
#[derive(Debug)]
pub struct Journal {
    /// Persisted non-paged record body
    pub nonpaged: Vec<u8>,
    pub nonpaged_writes: Vec<(usize, usize)>,
    pub paged_writes: Vec<(u64, u64, PagedEntry)>,
    /// Fail every metadata write with `MetadataWrite`
    pub fail_metadata_writes: bool,
    pub swap_requests: Vec<SwapRequest>,
    pub events: Vec<Event>,
    /// Scripted replies to upstream events, consumed in order.  Once empty,
    /// every event is allowed and every range consumed.
    pub replies: VecDeque<EventReply>,
    /// Upstream client boundary for `limit_to_one_client`
    pub client_boundary: Option<LbaT>,
    pub degraded_needs_rebuild: Option<bool>,
    pub rebuilds: Vec<RebuildContext>,
    pub needs_rebuild_cleared: Vec<RebuildContext>,
    /// Scripted rebuild outcomes, consumed in order.  Once empty, every
    /// rebuild succeeds.
    pub rebuild_outcomes: VecDeque<IoOutcome>,
    pub aborts: u32,
    pub notifications: Vec<(ObjectId, Notification)>,
    pub percent_rebuilt: Vec<(ObjectId, u32)>,
    pub event_log: Vec<EventLogEntry>,
    /// Conditions that are currently set
    pub conditions: BTreeSet<Condition>,
    pub reschedules: Vec<Duration>,
}

impl Default for Journal {
    fn default() -> Self {
        Journal {
            nonpaged: NonPagedMetadata::default().encode_body(),
            nonpaged_writes: Vec::new(),
            paged_writes: Vec::new(),
            fail_metadata_writes: false,
            swap_requests: Vec::new(),
            events: Vec::new(),
            replies: VecDeque::new(),
            client_boundary: None,
            degraded_needs_rebuild: None,
            rebuilds: Vec::new(),
            needs_rebuild_cleared: Vec::new(),
            rebuild_outcomes: VecDeque::new(),
            aborts: 0,
            notifications: Vec::new(),
            percent_rebuilt: Vec::new(),
            event_log: Vec::new(),
            conditions: BTreeSet::new(),
            reschedules: Vec::new(),
        }
    }
}

impl Journal {
    /// Decode the persisted non-paged record
    pub fn persisted(&self) -> Result<NonPagedMetadata> {
        NonPagedMetadata::decode_body(&self.nonpaged)
    }

    /// Event log codes, in the order they were written
    pub fn event_codes(&self) -> Vec<EventCode> {
        self.event_log.iter().map(|e| e.code).collect()
    }
}

/// Handle to a shared [`Journal`].  Every clone refers to the same journal.
#[derive(Clone, Debug, Default)]
pub struct InMemory(Arc<Mutex<Journal>>);

impl InMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an already-persisted non-paged record
    pub fn with_nonpaged(np: &NonPagedMetadata) -> Self {
        let mem = Self::default();
        mem.journal().nonpaged = np.encode_body();
        mem
    }

    /// Build a full set of collaborators that all share this journal.
    pub fn services(&self) -> Services {
        Services {
            metadata: Box::new(self.clone()),
            jobs: Box::new(self.clone()),
            upstream: Box::new(self.clone()),
            rebuild: Box::new(self.clone()),
            notifier: Box::new(self.clone()),
            event_log: Box::new(self.clone()),
            scheduler: Box::new(self.clone()),
        }
    }

    /// Lock the journal, recovering it if a previous holder panicked.
    pub fn journal(&self) -> MutexGuard<'_, Journal> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a reply for the next upstream event
    pub fn push_reply(&self, reply: EventReply) {
        self.journal().replies.push_back(reply);
    }

    pub fn push_rebuild_outcome(&self, outcome: IoOutcome) {
        self.journal().rebuild_outcomes.push_back(outcome);
    }

    /// Take the lowest-ordered condition that is set, leaving it set
    pub fn next_condition(&self) -> Option<Condition> {
        self.journal().conditions.iter().next().cloned()
    }

    pub fn is_condition_set(&self, cond: Condition) -> bool {
        self.journal().conditions.contains(&cond)
    }
}

impl MetadataStore for InMemory {
    fn write_nonpaged(&self, offset: usize, data: Vec<u8>)
        -> BoxFut<Result<()>>
    {
        let mut j = self.journal();
        let end = offset + data.len();
        let r = if j.fail_metadata_writes || end > j.nonpaged.len() {
            Err(Error::MetadataWrite)
        } else {
            j.nonpaged[offset..end].copy_from_slice(&data);
            j.nonpaged_writes.push((offset, data.len()));
            Ok(())
        };
        trace!(offset, len = data.len(), ?r, "write_nonpaged");
        Box::pin(future::ready(r))
    }

    fn write_paged_default(&self, chunk_offset: u64, repeat: u64,
                           entry: PagedEntry) -> BoxFut<Result<()>>
    {
        let mut j = self.journal();
        let r = if j.fail_metadata_writes {
            Err(Error::MetadataWrite)
        } else {
            j.paged_writes.push((chunk_offset, repeat, entry));
            Ok(())
        };
        Box::pin(future::ready(r))
    }
}

impl JobService for InMemory {
    fn submit_swap(&self, request: SwapRequest) -> Result<()> {
        trace!(?request, "submit_swap");
        self.journal().swap_requests.push(request);
        Ok(())
    }
}

impl Upstream for InMemory {
    fn send_event(&self, event: Event) -> BoxFut<EventReply> {
        let mut j = self.journal();
        j.events.push(event);
        let reply = j.replies.pop_front().unwrap_or_else(EventReply::ok);
        trace!(?event, ?reply, "send_event");
        Box::pin(future::ready(reply))
    }

    fn set_path_attr_degraded_needs_rebuild(&self, set: bool) {
        self.journal().degraded_needs_rebuild = Some(set);
    }

    fn limit_to_one_client(&self, lba: LbaT, blocks: BlockT)
        -> Option<BlockT>
    {
        match self.journal().client_boundary {
            Some(b) if lba < b && lba + blocks > b => Some(b - lba),
            _ => None
        }
    }
}

impl RebuildIo for InMemory {
    fn rebuild(&self, ctx: RebuildContext, _break_context: bool)
        -> BoxFut<IoOutcome>
    {
        let mut j = self.journal();
        j.rebuilds.push(ctx);
        let outcome = j.rebuild_outcomes.pop_front()
            .unwrap_or(IoOutcome::Success);
        Box::pin(future::ready(outcome))
    }

    fn clear_needs_rebuild(&self, ctx: RebuildContext) -> BoxFut<Result<()>> {
        self.journal().needs_rebuild_cleared.push(ctx);
        Box::pin(future::ok(()))
    }

    fn abort_stripe_locks(&self) {
        self.journal().aborts += 1;
    }

    fn abort_paged(&self) {
        self.journal().aborts += 1;
    }

    fn abort_monitor_ops(&self) {
        self.journal().aborts += 1;
    }
}

impl Notifier for InMemory {
    fn send(&self, object_id: ObjectId, notification: Notification)
        -> Result<()>
    {
        self.journal().notifications.push((object_id, notification));
        Ok(())
    }

    fn set_percent_rebuilt(&self, pvd: ObjectId, percent: u32)
        -> BoxFut<Result<()>>
    {
        self.journal().percent_rebuilt.push((pvd, percent));
        Box::pin(future::ok(()))
    }
}

impl EventLog for InMemory {
    fn write(&self, entry: EventLogEntry) -> Result<()> {
        self.journal().event_log.push(entry);
        Ok(())
    }
}

impl Scheduler for InMemory {
    fn set_condition(&self, cond: Condition) {
        self.journal().conditions.insert(cond);
    }

    fn clear_condition(&self, cond: Condition) {
        self.journal().conditions.remove(&cond);
    }

    fn reschedule(&self, delay: Duration) {
        self.journal().reschedules.push(delay);
    }
}

// LCOV_EXCL_STOP
