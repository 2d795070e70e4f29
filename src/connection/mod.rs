//! # Connection manager
//!
//! Owns every radio connection of the process. Each connection runs in its own tokio task
//! (see [`session`]) that owns the codec, the device store, the edit overlay and the table of
//! outstanding acknowledgements. The manager only keeps a routing table (handle → command
//! channel + published view) and the primary selection behind one mutex.
//!
//! Queries ([`ConnectionManager::get_snapshot`], [`ConnectionManager::get_pending_changes`], ...)
//! read the latest view the task published and never wait on the task. Commands travel to the
//! task and are answered over a oneshot channel.
//!
//! ```rust,no_run
//! use meshsync::connection::{ConnectionManager, SessionSettings};
//! use meshsync::device::sections::{ConfigGroup, SectionKey};
//! use meshsync::overlay::EditValue;
//! use meshsync::transport::TransportTarget;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let manager = ConnectionManager::new(SessionSettings::default());
//!     let target = TransportTarget::parse("/dev/ttyUSB0", 115200, true, false);
//!     let handle = manager.connect(target, true).await?;
//!     manager.wait_connected(&handle, Duration::from_secs(5)).await?;
//!
//!     let lora: SectionKey = "lora".parse()?;
//!     manager.edit_field(&handle, lora, "txPower", EditValue::Set(27.into())).await?;
//!     let report = manager.commit_primary(&[ConfigGroup::Radio]).await?;
//!     println!("committed: {}", report.is_success());
//!     Ok(())
//! }
//! ```

pub mod session;

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, info, warn};
use serde::Serialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::bulk::BulkConfigDocument;
use crate::commit::CommitReport;
use crate::config::{Config, ReconnectConfig};
use crate::device::sections::{self, ConfigGroup, SectionKey};
use crate::device::DeviceSnapshot;
use crate::errors::{CommitError, ConnectError, SendError, StateError, TransportError};
use crate::meshtastic::{OutboundRequest, TextMessage, BROADCAST_ADDR};
use crate::overlay::{EditOverlay, EditValue};
use crate::protobuf::meshtastic::admin_message::PayloadVariant as AdminPayload;
use crate::protobuf::meshtastic::{User, Waypoint};
use crate::transport::{Link, LinkOptions, TransportTarget};

pub use crate::transport::ConnectionHandle;

use session::{LinkSource, Session, SessionCommand};

/// How long `disconnect` waits for the task to wind down before aborting it
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Pending,
    /// Configured; carries the device's node number
    Connected(u32),
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected(_))
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Pending => f.write_str("pending"),
            ConnectionState::Connected(n) => write!(f, "connected (!{:08x})", n),
            ConnectionState::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// Immutable view of one connection as last published by its task.
#[derive(Debug, Clone)]
pub struct DeviceView {
    pub state: ConnectionState,
    pub snapshot: Arc<DeviceSnapshot>,
    pub overlay: Arc<EditOverlay>,
}

impl DeviceView {
    fn with_state(state: ConnectionState) -> Self {
        Self {
            state,
            snapshot: Arc::new(DeviceSnapshot::default()),
            overlay: Arc::new(EditOverlay::new()),
        }
    }

    pub fn pending_changes(&self, key: SectionKey) -> i64 {
        self.overlay
            .pending_changes(key, self.snapshot.section_value(key).as_ref())
    }
}

impl Default for DeviceView {
    fn default() -> Self {
        Self::with_state(ConnectionState::Disconnected)
    }
}

/// Notifications delivered to subscribers, in receipt order per handle.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerEvent {
    StateChanged {
        handle: ConnectionHandle,
        state: ConnectionState,
    },
    SnapshotUpdated {
        handle: ConnectionHandle,
    },
    OverlayChanged {
        handle: ConnectionHandle,
    },
    CommitFinished {
        handle: ConnectionHandle,
        report: CommitReport,
    },
    TextReceived {
        handle: ConnectionHandle,
        message: TextMessage,
    },
}

/// Fan-out of manager events to every live subscriber.
#[derive(Clone, Default)]
pub(crate) struct EventSink {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<ManagerEvent>>>>,
}

impl EventSink {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ManagerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: ManagerEvent) {
        self.lock().retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn lock(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<ManagerEvent>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Timing and sizing for connection tasks.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub open_timeout: Duration,
    pub configure_timeout: Duration,
    pub commit_ack_timeout: Duration,
    pub send_ack_timeout: Duration,
    /// `None` disables the heartbeat
    pub heartbeat: Option<Duration>,
    pub reconnect: ReconnectConfig,
    pub max_frame_len: usize,
    pub outbound_queue: usize,
}

impl SessionSettings {
    pub fn link_options(&self) -> LinkOptions {
        LinkOptions {
            outbound_queue: self.outbound_queue,
            ..LinkOptions::default()
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SessionSettings {
    fn from(config: &Config) -> Self {
        let t = &config.timeouts;
        Self {
            open_timeout: Duration::from_millis(t.open_timeout_ms),
            configure_timeout: Duration::from_millis(t.configure_timeout_ms),
            commit_ack_timeout: Duration::from_millis(t.commit_ack_timeout_ms),
            send_ack_timeout: Duration::from_millis(t.send_ack_timeout_ms),
            heartbeat: (t.heartbeat_secs > 0).then(|| Duration::from_secs(t.heartbeat_secs)),
            reconnect: config.reconnect.clone(),
            max_frame_len: config.codec.max_frame_len,
            outbound_queue: config.codec.outbound_queue,
        }
    }
}

struct Route {
    commands: mpsc::UnboundedSender<SessionCommand>,
    view: watch::Receiver<DeviceView>,
    task: JoinHandle<()>,
}

impl Route {
    fn is_live(&self) -> bool {
        let state = self.view.borrow().state.clone();
        matches!(state, ConnectionState::Pending | ConnectionState::Connected(_)) && !self.task.is_finished()
    }
}

#[derive(Default)]
struct Routes {
    routes: HashMap<ConnectionHandle, Route>,
    primary: Option<ConnectionHandle>,
}

pub struct ConnectionManager {
    settings: SessionSettings,
    routes: Mutex<Routes>,
    events: EventSink,
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new(SessionSettings::default())
    }
}

impl ConnectionManager {
    pub fn new(settings: SessionSettings) -> Self {
        Self {
            settings,
            routes: Mutex::new(Routes::default()),
            events: EventSink::default(),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---- connection lifecycle ----

    /// Open `target` and start its connection task. Returns once the transport is open; the
    /// connection is `Pending` until the device finishes reporting its configuration (see
    /// [`wait_connected`](Self::wait_connected)).
    pub async fn connect(&self, target: TransportTarget, set_primary: bool) -> Result<ConnectionHandle, ConnectError> {
        let handle = target.handle();
        info!("Connecting to {}", handle);
        let opened = self.start(handle.clone(), LinkSource::Open(target), set_primary)?;
        Self::await_open(&handle, opened).await?;
        Ok(handle)
    }

    /// Attach an already connected byte stream under the handle `key`.
    pub async fn connect_stream<S>(
        &self,
        key: impl Into<ConnectionHandle>,
        stream: S,
        set_primary: bool,
    ) -> Result<ConnectionHandle, ConnectError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let handle = key.into();
        let live = self.routes().routes.get(&handle).map_or(false, Route::is_live);
        if live {
            return Err(StateError::AlreadyConnected(handle.to_string()).into());
        }
        let (link, events) = Link::from_stream(handle.clone(), stream, self.settings.link_options());
        let opened = self.start(handle.clone(), LinkSource::Ready(link, events), set_primary)?;
        Self::await_open(&handle, opened).await?;
        Ok(handle)
    }

    async fn await_open(
        handle: &ConnectionHandle,
        opened: oneshot::Receiver<Result<(), TransportError>>,
    ) -> Result<(), TransportError> {
        match opened.await {
            Ok(result) => result,
            Err(_) => Err(TransportError::OpenFailed {
                target: handle.to_string(),
                reason: "connection task ended".to_string(),
            }),
        }
    }

    fn start(
        &self,
        handle: ConnectionHandle,
        source: LinkSource,
        set_primary: bool,
    ) -> Result<oneshot::Receiver<Result<(), TransportError>>, StateError> {
        let (view_tx, view_rx) = watch::channel(DeviceView::with_state(ConnectionState::Pending));
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (opened_tx, opened_rx) = oneshot::channel();
        let replaced = {
            let mut routes = self.routes();
            if routes.routes.get(&handle).map_or(false, Route::is_live) {
                return Err(StateError::AlreadyConnected(handle.to_string()));
            }
            // Announced before the task exists so it precedes every event the task emits
            self.events.emit(ManagerEvent::StateChanged {
                handle: handle.clone(),
                state: ConnectionState::Pending,
            });
            let session = Session::new(handle.clone(), self.settings.clone(), view_tx, self.events.clone());
            let task = tokio::spawn(session.start(source, cmd_rx, opened_tx));
            let old = routes.routes.insert(
                handle.clone(),
                Route {
                    commands: cmd_tx,
                    view: view_rx,
                    task,
                },
            );
            if set_primary {
                routes.primary = Some(handle.clone());
            }
            old
        };
        if let Some(old) = replaced {
            debug!("{}: replacing stale route", handle);
            old.task.abort();
        }
        Ok(opened_rx)
    }

    /// Wait until `handle` is configured. Fails if the connection fails, drops, or the wait
    /// exceeds `timeout`.
    pub async fn wait_connected(&self, handle: &ConnectionHandle, timeout: Duration) -> Result<u32, StateError> {
        let mut view = self
            .routes()
            .routes
            .get(handle)
            .map(|r| r.view.clone())
            .ok_or_else(|| StateError::UnknownHandle(handle.to_string()))?;
        let wait = async {
            loop {
                let state = view.borrow_and_update().state.clone();
                match state {
                    ConnectionState::Connected(node) => return Ok(node),
                    ConnectionState::Pending => {}
                    _ => return Err(StateError::NotConnected(handle.to_string())),
                }
                if view.changed().await.is_err() {
                    let state = view.borrow().state.clone();
                    return match state {
                        ConnectionState::Connected(node) => Ok(node),
                        _ => Err(StateError::NotConnected(handle.to_string())),
                    };
                }
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .unwrap_or_else(|_| Err(StateError::NotConnected(handle.to_string())))
    }

    /// Close a connection. Unknown or already closed handles are ignored.
    pub async fn disconnect(&self, handle: &ConnectionHandle) {
        let route = {
            let mut routes = self.routes();
            if routes.primary.as_ref() == Some(handle) {
                routes.primary = None;
            }
            routes.routes.remove(handle)
        };
        let Some(route) = route else {
            debug!("disconnect: {} has no route", handle);
            return;
        };
        let was_live = route.is_live();
        let (done_tx, done_rx) = oneshot::channel();
        if route.commands.send(SessionCommand::Shutdown { done: done_tx }).is_ok() {
            if tokio::time::timeout(SHUTDOWN_GRACE, done_rx).await.is_err() {
                warn!("{}: connection task did not stop in time; aborting", handle);
                route.task.abort();
                self.events.emit(ManagerEvent::StateChanged {
                    handle: handle.clone(),
                    state: ConnectionState::Disconnected,
                });
            }
        } else if !was_live {
            // Task already gone (link lost or failed); report the final transition here
            let failed = matches!(route.view.borrow().state, ConnectionState::Failed(_));
            if failed {
                self.events.emit(ManagerEvent::StateChanged {
                    handle: handle.clone(),
                    state: ConnectionState::Disconnected,
                });
            }
        }
        info!("Disconnected {}", handle);
    }

    pub async fn disconnect_all(&self) {
        for handle in self.handles() {
            self.disconnect(&handle).await;
        }
    }

    pub fn set_primary(&self, handle: &ConnectionHandle) -> Result<(), StateError> {
        let mut routes = self.routes();
        if !routes.routes.contains_key(handle) {
            return Err(StateError::UnknownHandle(handle.to_string()));
        }
        routes.primary = Some(handle.clone());
        Ok(())
    }

    pub fn primary(&self) -> Option<ConnectionHandle> {
        self.routes().primary.clone()
    }

    pub fn handles(&self) -> Vec<ConnectionHandle> {
        let mut handles: Vec<ConnectionHandle> = self.routes().routes.keys().cloned().collect();
        handles.sort();
        handles
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<ManagerEvent> {
        self.events.subscribe()
    }

    // ---- queries ----

    fn view(&self, handle: &ConnectionHandle) -> DeviceView {
        self.routes()
            .routes
            .get(handle)
            .map(|r| r.view.borrow().clone())
            .unwrap_or_default()
    }

    pub fn state(&self, handle: &ConnectionHandle) -> ConnectionState {
        self.view(handle).state
    }

    /// Current store contents. Unknown handles yield an empty snapshot.
    pub fn get_snapshot(&self, handle: &ConnectionHandle) -> Arc<DeviceSnapshot> {
        self.view(handle).snapshot
    }

    /// Number of top-level fields of `section` that the overlay would change, or `-1` when the
    /// device has not reported the section (including every disconnected handle).
    pub fn get_pending_changes(&self, handle: &ConnectionHandle, section: SectionKey) -> i64 {
        self.view(handle).pending_changes(section)
    }

    /// The raw edits recorded for `section`
    pub fn get_edits(&self, handle: &ConnectionHandle, section: SectionKey) -> Option<Value> {
        self.view(handle).overlay.edits(section)
    }

    pub fn export_config(&self, handle: &ConnectionHandle) -> Result<BulkConfigDocument, StateError> {
        let view = self.view(handle);
        if !view.state.is_connected() {
            return Err(StateError::NotConnected(handle.to_string()));
        }
        Ok(BulkConfigDocument::from_snapshot(&view.snapshot))
    }

    // ---- commands ----

    async fn request<T>(
        &self,
        handle: &ConnectionHandle,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> Option<T> {
        let commands = self.routes().routes.get(handle).map(|r| r.commands.clone())?;
        let (reply_tx, reply_rx) = oneshot::channel();
        commands.send(make(reply_tx)).ok()?;
        reply_rx.await.ok()
    }

    /// Record a local edit of one field. Nothing is sent to the device.
    pub async fn edit_field(
        &self,
        handle: &ConnectionHandle,
        section: SectionKey,
        field: &str,
        value: EditValue,
    ) -> Result<(), StateError> {
        let field = field.to_string();
        self.request(handle, |reply| SessionCommand::Edit {
            key: section,
            field,
            value,
            reply,
        })
        .await
        .unwrap_or_else(|| Err(StateError::NotConnected(handle.to_string())))
    }

    /// Discard every edit of `section`.
    pub async fn reset_section(&self, handle: &ConnectionHandle, section: SectionKey) -> Result<(), StateError> {
        self.request(handle, |reply| SessionCommand::ResetSection { key: section, reply })
            .await
            .ok_or_else(|| StateError::NotConnected(handle.to_string()))
    }

    /// Write the overlay's edits for `groups` to the device. Fails only when the handle is not
    /// connected; per-group failures are in the report.
    pub async fn commit(&self, handle: &ConnectionHandle, groups: &[ConfigGroup]) -> Result<CommitReport, CommitError> {
        self.run_commit(handle, groups, None).await
    }

    pub async fn commit_primary(&self, groups: &[ConfigGroup]) -> Result<CommitReport, CommitError> {
        let primary = self.primary().ok_or(CommitError::NoActiveConnection)?;
        self.commit(&primary, groups).await
    }

    /// Commit the contents of a bulk document. The live overlay is not touched.
    pub async fn commit_document(
        &self,
        handle: &ConnectionHandle,
        document: &BulkConfigDocument,
        groups: &[ConfigGroup],
    ) -> Result<CommitReport, CommitError> {
        if !self.state(handle).is_connected() {
            return Err(CommitError::NoActiveConnection);
        }
        let overlay = EditOverlay::from_document(document).map_err(|e| CommitError::InvalidEdit(e.to_string()))?;
        self.run_commit(handle, groups, Some(overlay)).await
    }

    async fn run_commit(
        &self,
        handle: &ConnectionHandle,
        groups: &[ConfigGroup],
        document: Option<EditOverlay>,
    ) -> Result<CommitReport, CommitError> {
        if !self.state(handle).is_connected() {
            return Err(CommitError::NoActiveConnection);
        }
        let groups: Vec<ConfigGroup> = groups.iter().copied().collect::<BTreeSet<_>>().into_iter().collect();
        let lost = CommitReport {
            outcomes: groups
                .iter()
                .map(|g| (*g, Err(CommitError::ConnectionLost)))
                .collect(),
        };
        self.request(handle, |reply| SessionCommand::Commit {
            groups,
            document,
            reply,
        })
        .await
        .unwrap_or(Ok(lost))
    }

    async fn send(&self, handle: &ConnectionHandle, request: OutboundRequest) -> Result<u32, SendError> {
        if !self.state(handle).is_connected() {
            return Err(StateError::NotConnected(handle.to_string()).into());
        }
        self.request(handle, |reply| SessionCommand::Send { request, reply })
            .await
            .unwrap_or(Err(SendError::ConnectionLost))
    }

    /// Broadcast a text message on `channel`. Resolves with the packet id once acknowledged.
    pub async fn send_text(&self, handle: &ConnectionHandle, channel: u32, text: &str) -> Result<u32, SendError> {
        self.send(
            handle,
            OutboundRequest::Text {
                to: BROADCAST_ADDR,
                channel,
                text: text.to_string(),
            },
        )
        .await
    }

    /// Broadcast a waypoint. A zero id is replaced by a random one.
    pub async fn send_waypoint(
        &self,
        handle: &ConnectionHandle,
        channel: u32,
        mut waypoint: Waypoint,
    ) -> Result<u32, SendError> {
        if waypoint.id == 0 {
            waypoint.id = rand::random::<u32>().max(1);
        }
        self.send(
            handle,
            OutboundRequest::Waypoint {
                to: BROADCAST_ADDR,
                channel,
                waypoint,
            },
        )
        .await
    }

    /// Retract a waypoint by re-sending it with an expiry in the past.
    pub async fn delete_waypoint(&self, handle: &ConnectionHandle, id: u32) -> Result<u32, SendError> {
        let mut waypoint = self
            .get_snapshot(handle)
            .waypoints
            .get(&id)
            .cloned()
            .unwrap_or_else(|| Waypoint {
                id,
                ..Default::default()
            });
        waypoint.expire = 1;
        self.send_waypoint(handle, 0, waypoint).await
    }

    /// Change the device owner's names.
    pub async fn update_user(&self, handle: &ConnectionHandle, user: User) -> Result<(), SendError> {
        self.send(
            handle,
            OutboundRequest::Admin(sections::admin(AdminPayload::SetOwner(user))),
        )
        .await
        .map(|_| ())
    }
}
