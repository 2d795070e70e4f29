//! Per-connection task.
//!
//! The task owns all mutable state of one radio: the codec, the [`DeviceStore`], the
//! [`EditOverlay`], commit runs and the acknowledgement table. It reacts to three sources in a
//! `select!` loop: bytes from the link, commands from the manager, and a short tick that
//! drives deadlines (configure timeout, ack timeouts, heartbeat, waypoint expiry). After every
//! change it publishes a fresh [`DeviceView`] through its watch channel.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, MissedTickBehavior};

use super::{ConnectionState, DeviceView, EventSink, ManagerEvent, SessionSettings};
use crate::commit::{plan_group, AckTracker, CommitReport, CommitRun};
use crate::device::sections::{self, ConfigGroup, SectionKey};
use crate::device::DeviceStore;
use crate::errors::{CommitError, SendError, StateError, TransportError};
use crate::logutil::escape_log;
use crate::meshtastic::{routing_error_name, DeviceMessage, FrameCodec, OutboundRequest, TextMessage};
use crate::metrics;
use crate::overlay::{EditOverlay, EditValue, SectionEdits};
use crate::protobuf::meshtastic::admin_message::PayloadVariant as AdminPayload;
use crate::transport::{ConnectionHandle, Link, LinkEvent, TransportTarget};

const TICK: Duration = Duration::from_millis(50);
const WAYPOINT_SWEEP: Duration = Duration::from_secs(1);
const CONFIGURE_TIMEOUT_REASON: &str = "Configuration timed out. Are you sure this is a Meshtastic device?";

pub(crate) enum LinkSource {
    Open(TransportTarget),
    Ready(Link, mpsc::Receiver<LinkEvent>),
}

pub(crate) enum SessionCommand {
    Edit {
        key: SectionKey,
        field: String,
        value: EditValue,
        reply: oneshot::Sender<Result<(), StateError>>,
    },
    ResetSection {
        key: SectionKey,
        reply: oneshot::Sender<()>,
    },
    Commit {
        groups: Vec<ConfigGroup>,
        /// Edits to commit instead of the live overlay
        document: Option<EditOverlay>,
        reply: oneshot::Sender<Result<CommitReport, CommitError>>,
    },
    Send {
        request: OutboundRequest,
        reply: oneshot::Sender<Result<u32, SendError>>,
    },
    Shutdown {
        done: oneshot::Sender<()>,
    },
}

enum AckTarget {
    Commit(u64),
    Send {
        request: OutboundRequest,
        reply: oneshot::Sender<Result<u32, SendError>>,
    },
}

struct ActiveRun {
    run: CommitRun,
    reply: oneshot::Sender<Result<CommitReport, CommitError>>,
}

/// Open the transport, retrying per the reconnect schedule.
pub(crate) async fn open_with_retries(
    target: &TransportTarget,
    settings: &SessionSettings,
) -> Result<(Link, mpsc::Receiver<LinkEvent>), TransportError> {
    let attempts = settings.reconnect.open_attempts.max(1);
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match Link::open(target, settings.open_timeout, settings.link_options()).await {
            Ok(opened) => return Ok(opened),
            Err(e) if attempt < attempts => {
                let delay = settings.reconnect.backoff(attempt as usize - 1);
                warn!(
                    "Open of {} failed (attempt {}/{}): {}; retrying in {:?}",
                    target.handle(),
                    attempt,
                    attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

pub(crate) struct Session {
    handle: ConnectionHandle,
    settings: SessionSettings,
    codec: FrameCodec,
    store: DeviceStore,
    overlay: Arc<EditOverlay>,
    state: ConnectionState,
    link: Option<Link>,
    acks: AckTracker<AckTarget>,
    runs: HashMap<u64, ActiveRun>,
    next_run: u64,
    config_id: u32,
    configure_deadline: Option<Instant>,
    last_heartbeat: Instant,
    last_sweep: Instant,
    view_tx: watch::Sender<DeviceView>,
    events: EventSink,
}

impl Session {
    pub(crate) fn new(
        handle: ConnectionHandle,
        settings: SessionSettings,
        view_tx: watch::Sender<DeviceView>,
        events: EventSink,
    ) -> Self {
        let now = Instant::now();
        Self {
            codec: FrameCodec::new(settings.max_frame_len),
            handle,
            settings,
            store: DeviceStore::new(),
            overlay: Arc::new(EditOverlay::new()),
            state: ConnectionState::Pending,
            link: None,
            acks: AckTracker::new(),
            runs: HashMap::new(),
            next_run: 1,
            config_id: 0,
            configure_deadline: None,
            last_heartbeat: now,
            last_sweep: now,
            view_tx,
            events,
        }
    }

    /// Task entry point: obtain the link, then serve it until it closes or is shut down.
    pub(crate) async fn start(
        mut self,
        source: LinkSource,
        commands: mpsc::UnboundedReceiver<SessionCommand>,
        opened: oneshot::Sender<Result<(), TransportError>>,
    ) {
        let (link, link_events) = match source {
            LinkSource::Ready(link, events) => (link, events),
            LinkSource::Open(target) => match open_with_retries(&target, &self.settings).await {
                Ok(pair) => pair,
                Err(e) => {
                    error!("Failed to open {}: {}", self.handle, e);
                    self.set_state(ConnectionState::Failed(e.to_string()));
                    let _ = opened.send(Err(e));
                    return;
                }
            },
        };
        self.link = Some(link);
        let _ = opened.send(Ok(()));
        self.run(link_events, commands).await;
        debug!("{}: connection task finished", self.handle);
    }

    async fn run(
        &mut self,
        mut link_events: mpsc::Receiver<LinkEvent>,
        mut commands: mpsc::UnboundedReceiver<SessionCommand>,
    ) {
        self.request_config(true);
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = link_events.recv() => match event {
                    Some(LinkEvent::Bytes(bytes)) => self.on_bytes(&bytes),
                    Some(LinkEvent::Closed(e)) => {
                        self.on_link_lost(e);
                        break;
                    }
                    None => {
                        self.on_link_lost(TransportError::Unplugged("link task ended".into()));
                        break;
                    }
                },
                cmd = commands.recv() => match cmd {
                    Some(SessionCommand::Shutdown { done }) => {
                        self.shutdown();
                        let _ = done.send(());
                        break;
                    }
                    Some(cmd) => self.on_command(cmd),
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                _ = tick.tick() => {
                    if !self.on_tick(Instant::now()) {
                        break;
                    }
                }
            }
        }
    }

    // ---- publishing ----

    fn publish(&self) {
        self.view_tx.send_replace(DeviceView {
            state: self.state.clone(),
            snapshot: self.store.snapshot(),
            overlay: Arc::clone(&self.overlay),
        });
    }

    fn emit(&self, event: ManagerEvent) {
        self.events.emit(event);
    }

    fn set_state(&mut self, state: ConnectionState) {
        if self.state == state {
            return;
        }
        info!("{}: {} -> {}", self.handle, self.state, state);
        self.state = state.clone();
        self.publish();
        self.emit(ManagerEvent::StateChanged {
            handle: self.handle.clone(),
            state,
        });
    }

    fn snapshot_changed(&self) {
        self.publish();
        self.emit(ManagerEvent::SnapshotUpdated {
            handle: self.handle.clone(),
        });
    }

    fn overlay_changed(&self) {
        self.publish();
        self.emit(ManagerEvent::OverlayChanged {
            handle: self.handle.clone(),
        });
    }

    // ---- outbound ----

    fn send_request(&mut self, request: &OutboundRequest) -> Result<Option<u32>, SendError> {
        let link = self
            .link
            .as_ref()
            .ok_or_else(|| SendError::State(StateError::NotConnected(self.handle.to_string())))?;
        let encoded = self.codec.encode(request)?;
        link.send(encoded.bytes)?;
        metrics::inc_packets_sent();
        Ok(encoded.request_id)
    }

    /// Ask the device for its full state. `arm_timeout` starts the configure deadline.
    fn request_config(&mut self, arm_timeout: bool) {
        let mut id: u32 = rand::random();
        if id == 0 {
            id = 1;
        }
        self.config_id = id;
        info!("{}: requesting configuration (want_config_id=0x{:08x})", self.handle, id);
        if let Err(e) = self.send_request(&OutboundRequest::WantConfig(id)) {
            warn!("{}: config request failed: {}", self.handle, e);
        }
        if arm_timeout {
            self.configure_deadline = Some(Instant::now() + self.settings.configure_timeout);
        }
    }

    // ---- inbound ----

    fn on_bytes(&mut self, bytes: &[u8]) {
        self.codec.push(bytes);
        let mut changed = false;
        while let Some(item) = self.codec.next_event() {
            match item {
                Ok(msg) => changed |= self.on_message(msg),
                Err(e) => warn!("{}: dropping frame: {}", self.handle, e),
            }
        }
        if changed {
            self.snapshot_changed();
        }
    }

    /// Returns whether the store changed.
    fn on_message(&mut self, msg: DeviceMessage) -> bool {
        match msg {
            DeviceMessage::ConfigComplete(id) => {
                if id != self.config_id {
                    debug!("{}: ignoring config complete for stale id 0x{:08x}", self.handle, id);
                    return false;
                }
                self.store.mark_config_complete();
                self.configure_deadline = None;
                if self.state == ConnectionState::Pending {
                    let node = self.store.snapshot().my_node_num.unwrap_or(0);
                    self.set_state(ConnectionState::Connected(node));
                }
                true
            }
            DeviceMessage::Rebooted => {
                warn!("{}: device rebooted; requesting configuration again", self.handle);
                let arm = self.state == ConnectionState::Pending;
                self.request_config(arm);
                false
            }
            DeviceMessage::Ack { request_id, .. } => {
                self.on_ack(request_id);
                false
            }
            DeviceMessage::Nack { request_id, error, .. } => {
                self.on_nack(request_id, routing_error_name(error));
                false
            }
            DeviceMessage::MyInfo(ref info) => {
                self.codec.set_local_node(info.my_node_num);
                self.store.apply_inbound(&msg, Utc::now())
            }
            DeviceMessage::Text(ref text) => {
                debug!("{}: text from !{:08x}: {}", self.handle, text.from, escape_log(&text.text));
                let changed = self.store.apply_inbound(&msg, Utc::now());
                if changed {
                    self.emit(ManagerEvent::TextReceived {
                        handle: self.handle.clone(),
                        message: text.clone(),
                    });
                }
                changed
            }
            other => self.store.apply_inbound(&other, Utc::now()),
        }
    }

    fn on_ack(&mut self, request_id: u32) {
        let Some((target, sent_at)) = self.acks.resolve(request_id) else {
            trace!("{}: ack for untracked id {}", self.handle, request_id);
            return;
        };
        metrics::observe_ack_latency(sent_at.into_std());
        match target {
            AckTarget::Commit(run_id) => {
                let settled = self.runs.get_mut(&run_id).and_then(|a| a.run.on_ack(request_id));
                if let Some((group, keys)) = settled {
                    self.group_acked(run_id, group, keys);
                }
                self.finish_run_if_done(run_id);
            }
            AckTarget::Send { request, reply } => {
                debug!("{}: packet {} acknowledged", self.handle, request_id);
                if let Some(msg) = self.local_echo(&request, request_id) {
                    let now = Utc::now();
                    let mut changed = self.store.apply_inbound(&msg, now);
                    changed |= self.store.evict_expired_waypoints(now) > 0;
                    if changed {
                        self.snapshot_changed();
                    }
                }
                let _ = reply.send(Ok(request_id));
            }
        }
    }

    fn on_nack(&mut self, request_id: u32, reason: String) {
        let Some((target, _)) = self.acks.resolve(request_id) else {
            trace!("{}: nack for untracked id {}", self.handle, request_id);
            return;
        };
        warn!("{}: device rejected packet {}: {}", self.handle, request_id, reason);
        match target {
            AckTarget::Commit(run_id) => {
                if let Some(active) = self.runs.get_mut(&run_id) {
                    active.run.on_nack(request_id, reason);
                }
                self.finish_run_if_done(run_id);
            }
            AckTarget::Send { reply, .. } => {
                let _ = reply.send(Err(SendError::Rejected(reason)));
            }
        }
    }

    /// What an acknowledged pass-through packet changes in the local store
    fn local_echo(&self, request: &OutboundRequest, id: u32) -> Option<DeviceMessage> {
        let from = self.store.snapshot().my_node_num.unwrap_or(0);
        match request {
            OutboundRequest::Text { to, channel, text } => Some(DeviceMessage::Text(TextMessage {
                id,
                from,
                to: *to,
                channel: *channel,
                text: text.clone(),
            })),
            OutboundRequest::Waypoint { waypoint, .. } => Some(DeviceMessage::Waypoint {
                from,
                waypoint: waypoint.clone(),
            }),
            OutboundRequest::Admin(admin) => match &admin.payload_variant {
                Some(AdminPayload::SetOwner(user)) => Some(DeviceMessage::User {
                    from,
                    user: user.clone(),
                }),
                _ => None,
            },
            _ => None,
        }
    }

    // ---- commands ----

    fn on_command(&mut self, cmd: SessionCommand) {
        match cmd {
            SessionCommand::Edit {
                key,
                field,
                value,
                reply,
            } => {
                let result = Arc::make_mut(&mut self.overlay).set_field(key, &field, value);
                if result.is_ok() {
                    trace!("{}: edit {}.{}", self.handle, key, field);
                    self.overlay_changed();
                }
                let _ = reply.send(result);
            }
            SessionCommand::ResetSection { key, reply } => {
                if self.overlay.is_touched(key) {
                    Arc::make_mut(&mut self.overlay).clear_section(key);
                    self.overlay_changed();
                }
                let _ = reply.send(());
            }
            SessionCommand::Commit {
                groups,
                document,
                reply,
            } => self.start_commit(groups, document, reply),
            SessionCommand::Send { request, reply } => {
                if !self.state.is_connected() {
                    let _ = reply.send(Err(StateError::NotConnected(self.handle.to_string()).into()));
                    return;
                }
                match self.send_request(&request) {
                    Ok(Some(id)) => {
                        let now = Instant::now();
                        let deadline = now + self.settings.send_ack_timeout;
                        self.acks.track(id, AckTarget::Send { request, reply }, now, deadline);
                    }
                    Ok(None) => {
                        let _ = reply.send(Ok(0));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            SessionCommand::Shutdown { done } => {
                self.shutdown();
                let _ = done.send(());
            }
        }
    }

    fn start_commit(
        &mut self,
        groups: Vec<ConfigGroup>,
        document: Option<EditOverlay>,
        reply: oneshot::Sender<Result<CommitReport, CommitError>>,
    ) {
        if !self.state.is_connected() {
            let _ = reply.send(Err(CommitError::NoActiveConnection));
            return;
        }
        let run_id = self.next_run;
        self.next_run += 1;
        let snapshot = self.store.snapshot();
        let mut run = CommitRun::new(run_id, document.is_none());

        let mut plans = Vec::new();
        {
            let source: &EditOverlay = document.as_ref().unwrap_or(&*self.overlay);
            for group in groups {
                match plan_group(group, source, &snapshot) {
                    Ok(plan) => {
                        run.begin_group(group, plan.sections.clone());
                        for (key, edits) in &plan.edits {
                            run.record_edits(*key, edits.clone());
                        }
                        if plan.is_empty() {
                            run.settle(group, Ok(()));
                        } else {
                            plans.push(plan);
                        }
                    }
                    Err(e) => {
                        warn!("{}: cannot commit {}: {}", self.handle, group, e);
                        run.begin_group(group, Vec::new());
                        run.settle(group, Err(e));
                    }
                }
            }
        }

        let now = Instant::now();
        let deadline = now + self.settings.commit_ack_timeout;
        for plan in plans {
            info!(
                "{}: commit {} writing {} ({} packets)",
                self.handle,
                run_id,
                plan.group,
                plan.writes.len()
            );
            for write in plan.writes {
                match self.send_request(&OutboundRequest::Admin(write)) {
                    Ok(Some(id)) => {
                        run.expect_ack(plan.group, id);
                        self.acks.track(id, AckTarget::Commit(run_id), now, deadline);
                    }
                    Ok(None) => {}
                    Err(e) => {
                        run.settle(plan.group, Err(commit_error(e)));
                        break;
                    }
                }
            }
        }

        self.runs.insert(run_id, ActiveRun { run, reply });
        self.finish_run_if_done(run_id);
    }

    /// Every write of `group` was acknowledged: drop the edits that were written and read the
    /// stored values back. A section edited again while the writes were in flight keeps its
    /// edits.
    fn group_acked(&mut self, run_id: u64, group: ConfigGroup, keys: Vec<SectionKey>) {
        info!("{}: commit {} group {} acknowledged", self.handle, run_id, group);
        let committed: Vec<(SectionKey, SectionEdits)> = match self.runs.get(&run_id) {
            Some(active) if active.run.clears_overlay => keys
                .iter()
                .filter_map(|k| active.run.committed_edits(*k).map(|e| (*k, e.clone())))
                .collect(),
            _ => Vec::new(),
        };
        let mut cleared = false;
        for (key, edits) in &committed {
            if !self.overlay.is_touched(*key) {
                continue;
            }
            if Arc::make_mut(&mut self.overlay).clear_if_unchanged(*key, edits) {
                cleared = true;
            } else {
                debug!("{}: {} edited during commit {}; keeping newer edits", self.handle, key, run_id);
            }
        }
        if cleared {
            self.overlay_changed();
        }
        for key in keys {
            if let Err(e) = self.send_request(&OutboundRequest::Admin(sections::build_read(key))) {
                warn!("{}: could not request {} after commit: {}", self.handle, key, e);
            }
        }
    }

    fn finish_run_if_done(&mut self, run_id: u64) {
        let finished = self.runs.get(&run_id).map_or(false, |a| a.run.is_finished());
        if !finished {
            return;
        }
        let Some(active) = self.runs.remove(&run_id) else {
            return;
        };
        self.acks
            .retain(|t| !matches!(t, AckTarget::Commit(id) if *id == run_id));
        let report = active.run.into_report();
        if !report.is_success() {
            warn!(
                "{}: commit {} failed for {:?}",
                self.handle,
                run_id,
                report.failed_groups()
            );
        }
        self.emit(ManagerEvent::CommitFinished {
            handle: self.handle.clone(),
            report: report.clone(),
        });
        let _ = active.reply.send(Ok(report));
    }

    // ---- timers ----

    /// Returns false when the task should stop.
    fn on_tick(&mut self, now: Instant) -> bool {
        if let Some(deadline) = self.configure_deadline {
            if now >= deadline && self.state == ConnectionState::Pending {
                error!("{}: {}", self.handle, CONFIGURE_TIMEOUT_REASON);
                self.teardown(CommitError::ConnectionLost);
                self.set_state(ConnectionState::Failed(CONFIGURE_TIMEOUT_REASON.to_string()));
                return false;
            }
        }

        for (id, target) in self.acks.expire(now) {
            match target {
                AckTarget::Commit(run_id) => {
                    warn!("{}: commit {} write {} not acknowledged in time", self.handle, run_id, id);
                    if let Some(active) = self.runs.get_mut(&run_id) {
                        active.run.on_timeout(id);
                    }
                    self.finish_run_if_done(run_id);
                }
                AckTarget::Send { reply, .. } => {
                    warn!("{}: packet {} not acknowledged in time", self.handle, id);
                    let _ = reply.send(Err(SendError::Timeout));
                }
            }
        }

        if let Some(every) = self.settings.heartbeat {
            if self.state.is_connected() && now.duration_since(self.last_heartbeat) >= every {
                self.last_heartbeat = now;
                trace!("{}: heartbeat", self.handle);
                if let Err(e) = self.send_request(&OutboundRequest::Heartbeat) {
                    warn!("{}: heartbeat failed: {}", self.handle, e);
                }
            }
        }

        if now.duration_since(self.last_sweep) >= WAYPOINT_SWEEP {
            self.last_sweep = now;
            let evicted = self.store.evict_expired_waypoints(Utc::now());
            if evicted > 0 {
                debug!("{}: evicted {} expired waypoints", self.handle, evicted);
                self.snapshot_changed();
            }
        }
        true
    }

    // ---- teardown ----

    /// Resolve every in-flight request with `err` and forget the device.
    fn teardown(&mut self, err: CommitError) {
        let run_ids: Vec<u64> = self.runs.keys().copied().collect();
        for run_id in run_ids {
            if let Some(active) = self.runs.get_mut(&run_id) {
                active.run.fail_open(err.clone());
            }
            self.finish_run_if_done(run_id);
        }
        for (_, target) in self.acks.drain() {
            if let AckTarget::Send { reply, .. } = target {
                let _ = reply.send(Err(SendError::ConnectionLost));
            }
        }
        self.store.clear();
        self.overlay = Arc::new(EditOverlay::new());
        self.codec.reset();
        self.configure_deadline = None;
        if let Some(mut link) = self.link.take() {
            link.close();
        }
    }

    fn on_link_lost(&mut self, err: TransportError) {
        warn!("{}: link lost: {}", self.handle, err);
        let next = match self.state {
            ConnectionState::Pending => ConnectionState::Failed(err.to_string()),
            _ => ConnectionState::Disconnected,
        };
        self.teardown(CommitError::ConnectionLost);
        self.publish();
        self.set_state(next);
    }

    /// Explicit disconnect: tell the device we are leaving, then tear down.
    fn shutdown(&mut self) {
        if self.link.is_some() {
            if let Err(e) = self.send_request(&OutboundRequest::Disconnect) {
                debug!("{}: disconnect notice not sent: {}", self.handle, e);
            }
        }
        self.teardown(CommitError::ConnectionLost);
        self.publish();
        self.set_state(ConnectionState::Disconnected);
    }
}

fn commit_error(e: SendError) -> CommitError {
    match e {
        SendError::Transport(t) => CommitError::Transport(t),
        SendError::Codec(c) => CommitError::InvalidEdit(c.to_string()),
        SendError::Rejected(r) => CommitError::Rejected(r),
        SendError::Timeout => CommitError::Timeout,
        SendError::State(_) | SendError::ConnectionLost => CommitError::ConnectionLost,
    }
}
