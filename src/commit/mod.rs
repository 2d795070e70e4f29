//! # Commit orchestration
//!
//! A commit writes the overlay's edits for one or more [`ConfigGroup`]s to the device. Each
//! group is planned independently:
//!
//! 1. every touched section of the group is merged over its canonical value,
//! 2. the merged records are wrapped in the device's edit transaction
//!    (`begin_edit_settings`, the writes, `commit_edit_settings`),
//! 3. every admin packet is sent with `want_ack` and tracked by request id.
//!
//! A group succeeds once every one of its packets is acknowledged. A NACK rejects the group,
//! the deadline times it out, a dropped link loses it. Groups never roll each other back.
//!
//! The connection task owns an [`AckTracker`] and one [`CommitRun`] per in-flight commit and
//! feeds them acknowledgements as they are decoded.

use std::collections::{BTreeMap, HashMap};

use log::{debug, warn};
use tokio::time::Instant;

use crate::device::sections::{self, ConfigGroup, SectionKey};
use crate::device::DeviceSnapshot;
use crate::errors::CommitError;
use crate::metrics;
use crate::overlay::{EditOverlay, SectionEdits};
use crate::protobuf::meshtastic::admin_message::PayloadVariant as AdminPayload;
use crate::protobuf::meshtastic::AdminMessage;

/// Writes for one group, in send order
#[derive(Debug, Clone, PartialEq)]
pub struct GroupPlan {
    pub group: ConfigGroup,
    pub sections: Vec<SectionKey>,
    pub writes: Vec<AdminMessage>,
    /// The overlay edits each write was built from
    pub edits: Vec<(SectionKey, SectionEdits)>,
}

impl GroupPlan {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }
}

/// Merge the overlay's edits for `group` and build the admin writes. A group with no touched
/// sections plans to nothing.
pub fn plan_group(
    group: ConfigGroup,
    overlay: &EditOverlay,
    snapshot: &DeviceSnapshot,
) -> Result<GroupPlan, CommitError> {
    let touched = overlay.touched_sections(group);
    if touched.is_empty() {
        return Ok(GroupPlan {
            group,
            sections: Vec::new(),
            writes: Vec::new(),
            edits: Vec::new(),
        });
    }
    let mut writes = Vec::with_capacity(touched.len() + 2);
    let mut edits = Vec::with_capacity(touched.len());
    writes.push(sections::admin(AdminPayload::BeginEditSettings(true)));
    for key in &touched {
        let canonical = snapshot.section_value(*key).ok_or_else(|| {
            CommitError::InvalidEdit(format!("{} has not been reported by the device", key))
        })?;
        let merged = overlay.merge_for_commit(*key, &canonical);
        writes.push(sections::build_write(*key, merged)?);
        if let Some(e) = overlay.section_edits(*key) {
            edits.push((*key, e));
        }
    }
    writes.push(sections::admin(AdminPayload::CommitEditSettings(true)));
    Ok(GroupPlan {
        group,
        sections: touched,
        writes,
        edits,
    })
}

/// Per-group outcome of a commit
#[derive(Debug, Clone, PartialEq)]
pub struct CommitReport {
    pub outcomes: BTreeMap<ConfigGroup, Result<(), CommitError>>,
}

impl CommitReport {
    pub fn is_success(&self) -> bool {
        self.outcomes.values().all(Result::is_ok)
    }

    pub fn outcome(&self, group: ConfigGroup) -> Option<&Result<(), CommitError>> {
        self.outcomes.get(&group)
    }

    pub fn failed_groups(&self) -> Vec<ConfigGroup> {
        self.outcomes
            .iter()
            .filter(|(_, r)| r.is_err())
            .map(|(g, _)| *g)
            .collect()
    }
}

struct Pending<T> {
    target: T,
    sent_at: Instant,
    deadline: Instant,
}

/// Outstanding acknowledgements keyed by request id.
pub struct AckTracker<T> {
    pending: HashMap<u32, Pending<T>>,
}

impl<T> Default for AckTracker<T> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
        }
    }
}

impl<T> AckTracker<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, request_id: u32, target: T, sent_at: Instant, deadline: Instant) {
        if self
            .pending
            .insert(
                request_id,
                Pending {
                    target,
                    sent_at,
                    deadline,
                },
            )
            .is_some()
        {
            warn!("Request id {} was already awaiting an ack; replaced", request_id);
        }
    }

    /// Remove and return the waiter for `request_id` with its send time.
    pub fn resolve(&mut self, request_id: u32) -> Option<(T, Instant)> {
        self.pending.remove(&request_id).map(|p| (p.target, p.sent_at))
    }

    /// Remove every waiter whose deadline has passed.
    pub fn expire(&mut self, now: Instant) -> Vec<(u32, T)> {
        let ids: Vec<u32> = self
            .pending
            .iter()
            .filter(|(_, p)| p.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.pending.remove(&id).map(|p| (id, p.target)))
            .collect()
    }

    pub fn retain(&mut self, mut keep: impl FnMut(&T) -> bool) {
        self.pending.retain(|_, p| keep(&p.target));
    }

    pub fn drain(&mut self) -> Vec<(u32, T)> {
        self.pending.drain().map(|(id, p)| (id, p.target)).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

struct GroupState {
    sections: Vec<SectionKey>,
    outstanding: usize,
    outcome: Option<Result<(), CommitError>>,
}

/// Progress of one commit across its groups.
pub struct CommitRun {
    pub id: u64,
    /// Clear the live overlay sections of each group that succeeds
    pub clears_overlay: bool,
    groups: BTreeMap<ConfigGroup, GroupState>,
    by_request: HashMap<u32, ConfigGroup>,
    committed: HashMap<SectionKey, SectionEdits>,
}

impl CommitRun {
    pub fn new(id: u64, clears_overlay: bool) -> Self {
        Self {
            id,
            clears_overlay,
            groups: BTreeMap::new(),
            by_request: HashMap::new(),
            committed: HashMap::new(),
        }
    }

    /// Remember the edits a section's write was built from.
    pub fn record_edits(&mut self, key: SectionKey, edits: SectionEdits) {
        self.committed.insert(key, edits);
    }

    pub fn committed_edits(&self, key: SectionKey) -> Option<&SectionEdits> {
        self.committed.get(&key)
    }

    /// Register a group and its sections before any of its packets go out.
    pub fn begin_group(&mut self, group: ConfigGroup, sections: Vec<SectionKey>) {
        self.groups.insert(
            group,
            GroupState {
                sections,
                outstanding: 0,
                outcome: None,
            },
        );
    }

    pub fn expect_ack(&mut self, group: ConfigGroup, request_id: u32) {
        if let Some(state) = self.groups.get_mut(&group) {
            state.outstanding += 1;
            self.by_request.insert(request_id, group);
        }
    }

    /// Settle a group that has not settled yet. Returns false if it already had an outcome.
    pub fn settle(&mut self, group: ConfigGroup, outcome: Result<(), CommitError>) -> bool {
        let Some(state) = self.groups.get_mut(&group) else {
            return false;
        };
        if state.outcome.is_some() {
            return false;
        }
        match &outcome {
            Ok(()) => metrics::inc_groups_acked(),
            Err(CommitError::Timeout) => metrics::inc_groups_timed_out(),
            Err(CommitError::ConnectionLost) => metrics::inc_groups_lost(),
            Err(_) => metrics::inc_groups_rejected(),
        }
        debug!("Commit {} group {} settled: {:?}", self.id, group, outcome);
        state.outcome = Some(outcome);
        true
    }

    /// Record an ack. Returns the group and its sections when this was its last one.
    pub fn on_ack(&mut self, request_id: u32) -> Option<(ConfigGroup, Vec<SectionKey>)> {
        let group = self.by_request.remove(&request_id)?;
        let state = self.groups.get_mut(&group)?;
        if state.outcome.is_some() {
            return None;
        }
        state.outstanding = state.outstanding.saturating_sub(1);
        if state.outstanding > 0 {
            return None;
        }
        let sections = state.sections.clone();
        self.settle(group, Ok(()));
        Some((group, sections))
    }

    /// Record a NACK. Returns the group it rejected, if it was still open.
    pub fn on_nack(&mut self, request_id: u32, reason: String) -> Option<ConfigGroup> {
        let group = self.by_request.remove(&request_id)?;
        self.settle(group, Err(CommitError::Rejected(reason))).then_some(group)
    }

    pub fn on_timeout(&mut self, request_id: u32) -> Option<ConfigGroup> {
        let group = self.by_request.remove(&request_id)?;
        self.settle(group, Err(CommitError::Timeout)).then_some(group)
    }

    /// Settle every open group with `err`.
    pub fn fail_open(&mut self, err: CommitError) {
        let open: Vec<ConfigGroup> = self
            .groups
            .iter()
            .filter(|(_, s)| s.outcome.is_none())
            .map(|(g, _)| *g)
            .collect();
        for group in open {
            self.settle(group, Err(err.clone()));
        }
        self.by_request.clear();
    }

    pub fn is_finished(&self) -> bool {
        self.groups.values().all(|s| s.outcome.is_some())
    }

    pub fn into_report(self) -> CommitReport {
        CommitReport {
            outcomes: self
                .groups
                .into_iter()
                .map(|(g, s)| (g, s.outcome.unwrap_or(Err(CommitError::ConnectionLost))))
                .collect(),
        }
    }
}
