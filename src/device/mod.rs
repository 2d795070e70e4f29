//! # Device state store
//!
//! Canonical, device-reported state of one radio: identity, node table, channel table,
//! radio and module config sections, waypoints and recent text messages.
//!
//! The store is owned by a single connection task and only changes through
//! [`DeviceStore::apply_inbound`] with messages decoded from the device. Readers get an
//! immutable [`Arc<DeviceSnapshot>`]; updates are copy-on-write so a snapshot handed out
//! earlier never observes a half-applied message.
//!
//! ```rust
//! use chrono::Utc;
//! use meshsync::device::DeviceStore;
//! use meshsync::meshtastic::DeviceMessage;
//! use meshsync::protobuf::meshtastic::MyNodeInfo;
//!
//! let mut store = DeviceStore::new();
//! let before = store.snapshot();
//! store.apply_inbound(&DeviceMessage::MyInfo(MyNodeInfo { my_node_num: 7, ..Default::default() }), Utc::now());
//! assert_eq!(before.my_node_num, None);
//! assert_eq!(store.snapshot().my_node_num, Some(7));
//! ```

pub mod sections;

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use log::{debug, warn};
use serde::Serialize;
use serde_json::Value;

use crate::logutil::escape_log;
use crate::meshtastic::{DeviceMessage, TextMessage};
use crate::protobuf::meshtastic as proto;
use proto::{config, module_config};
use sections::{RadioSection, SectionKey};

/// Channel slots on every Meshtastic device
pub const CHANNEL_SLOTS: usize = 8;
/// Samples kept per node for position and telemetry history
pub const HISTORY_LIMIT: usize = 100;
/// Text messages kept per device
pub const MESSAGE_LOG_LIMIT: usize = 500;

/// Freshness of a node, from minutes since it was last heard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeState {
    Active,
    Warning,
    Error,
}

impl NodeState {
    pub fn classify(minutes_since_heard: i64) -> Self {
        if minutes_since_heard < 15 {
            NodeState::Active
        } else if minutes_since_heard < 60 {
            NodeState::Warning
        } else {
            NodeState::Error
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionSample {
    pub received_at: DateTime<Utc>,
    pub position: proto::Position,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetrySample {
    pub received_at: DateTime<Utc>,
    pub time: u32,
    pub device: Option<proto::DeviceMetrics>,
    pub environment: Option<proto::EnvironmentMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub num: u32,
    pub user: Option<proto::User>,
    pub last_heard: Option<DateTime<Utc>>,
    pub snr: f32,
    pub hops_away: u32,
    /// Oldest first
    pub positions: Vec<PositionSample>,
    /// Oldest first
    pub telemetry: Vec<TelemetrySample>,
}

impl NodeRecord {
    fn new(num: u32) -> Self {
        Self {
            num,
            user: None,
            last_heard: None,
            snr: 0.0,
            hops_away: 0,
            positions: Vec::new(),
            telemetry: Vec::new(),
        }
    }

    pub fn position(&self) -> Option<&proto::Position> {
        self.positions.last().map(|s| &s.position)
    }

    pub fn device_metrics(&self) -> Option<&proto::DeviceMetrics> {
        self.telemetry.iter().rev().find_map(|s| s.device.as_ref())
    }

    pub fn environment_metrics(&self) -> Option<&proto::EnvironmentMetrics> {
        self.telemetry.iter().rev().find_map(|s| s.environment.as_ref())
    }

    /// `None` until the node has been heard at least once
    pub fn state(&self, now: DateTime<Utc>) -> Option<NodeState> {
        let heard = self.last_heard?;
        Some(NodeState::classify((now - heard).num_minutes()))
    }

    fn push_position(&mut self, position: proto::Position, at: DateTime<Utc>) -> bool {
        if self.positions.last().map(|s| &s.position) == Some(&position) {
            return false;
        }
        self.positions.push(PositionSample {
            received_at: at,
            position,
        });
        if self.positions.len() > HISTORY_LIMIT {
            let excess = self.positions.len() - HISTORY_LIMIT;
            self.positions.drain(..excess);
        }
        true
    }

    fn push_telemetry(&mut self, sample: TelemetrySample) -> bool {
        if let Some(last) = self.telemetry.last() {
            if last.time == sample.time && last.device == sample.device && last.environment == sample.environment {
                return false;
            }
        }
        self.telemetry.push(sample);
        if self.telemetry.len() > HISTORY_LIMIT {
            let excess = self.telemetry.len() - HISTORY_LIMIT;
            self.telemetry.drain(..excess);
        }
        true
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RadioConfig {
    pub device: Option<config::DeviceConfig>,
    pub position: Option<config::PositionConfig>,
    pub power: Option<config::PowerConfig>,
    pub network: Option<config::NetworkConfig>,
    pub display: Option<config::DisplayConfig>,
    pub lora: Option<config::LoRaConfig>,
    pub bluetooth: Option<config::BluetoothConfig>,
}

impl RadioConfig {
    fn set(&mut self, variant: config::PayloadVariant) {
        use config::PayloadVariant as V;
        match variant {
            V::Device(c) => self.device = Some(c),
            V::Position(c) => self.position = Some(c),
            V::Power(c) => self.power = Some(c),
            V::Network(c) => self.network = Some(c),
            V::Display(c) => self.display = Some(c),
            V::Lora(c) => self.lora = Some(c),
            V::Bluetooth(c) => self.bluetooth = Some(c),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfigSet {
    pub mqtt: Option<module_config::MqttConfig>,
    pub serial: Option<module_config::SerialConfig>,
    pub external_notification: Option<module_config::ExternalNotificationConfig>,
    pub store_forward: Option<module_config::StoreForwardConfig>,
    pub range_test: Option<module_config::RangeTestConfig>,
    pub telemetry: Option<module_config::TelemetryConfig>,
    pub canned_message: Option<module_config::CannedMessageConfig>,
    pub remote_hardware: Option<module_config::RemoteHardwareConfig>,
}

impl ModuleConfigSet {
    fn set(&mut self, variant: module_config::PayloadVariant) {
        use module_config::PayloadVariant as V;
        match variant {
            V::Mqtt(c) => self.mqtt = Some(c),
            V::Serial(c) => self.serial = Some(c),
            V::ExternalNotification(c) => self.external_notification = Some(c),
            V::StoreForward(c) => self.store_forward = Some(c),
            V::RangeTest(c) => self.range_test = Some(c),
            V::Telemetry(c) => self.telemetry = Some(c),
            V::CannedMessage(c) => self.canned_message = Some(c),
            V::RemoteHardware(c) => self.remote_hardware = Some(c),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub received_at: DateTime<Utc>,
    #[serde(flatten)]
    pub message: TextMessage,
}

/// Immutable view of one device's reported state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSnapshot {
    pub my_node_num: Option<u32>,
    pub my_info: Option<proto::MyNodeInfo>,
    pub metadata: Option<proto::DeviceMetadata>,
    pub nodes: BTreeMap<u32, NodeRecord>,
    /// Indexed by channel slot, always [`CHANNEL_SLOTS`] long
    pub channels: Vec<Option<proto::Channel>>,
    pub radio: RadioConfig,
    pub modules: ModuleConfigSet,
    /// Includes expired entries; see [`DeviceSnapshot::active_waypoints`]
    pub waypoints: BTreeMap<u32, proto::Waypoint>,
    pub messages: Vec<StoredMessage>,
    pub config_complete: bool,
}

impl Default for DeviceSnapshot {
    fn default() -> Self {
        Self {
            my_node_num: None,
            my_info: None,
            metadata: None,
            nodes: BTreeMap::new(),
            channels: vec![None; CHANNEL_SLOTS],
            radio: RadioConfig::default(),
            modules: ModuleConfigSet::default(),
            waypoints: BTreeMap::new(),
            messages: Vec::new(),
            config_complete: false,
        }
    }
}

fn waypoint_expired(wp: &proto::Waypoint, now: DateTime<Utc>) -> bool {
    wp.expire != 0 && (wp.expire as i64) < now.timestamp()
}

impl DeviceSnapshot {
    /// Canonical JSON of a section, `None` if the device has not reported it.
    pub fn section_value(&self, key: SectionKey) -> Option<Value> {
        match key {
            SectionKey::Radio(r) => sections::radio_value(&self.radio, r),
            SectionKey::Module(m) => sections::module_value(&self.modules, m),
            SectionKey::Channel(i) => self
                .channels
                .get(i as usize)
                .and_then(|c| c.as_ref())
                .and_then(|c| serde_json::to_value(c).ok()),
        }
    }

    pub fn channel(&self, index: usize) -> Option<&proto::Channel> {
        self.channels.get(index).and_then(|c| c.as_ref())
    }

    pub fn lora(&self) -> Option<&config::LoRaConfig> {
        self.radio.lora.as_ref()
    }

    /// Waypoints that have not expired at `now`
    pub fn active_waypoints(&self, now: DateTime<Utc>) -> Vec<&proto::Waypoint> {
        self.waypoints.values().filter(|w| !waypoint_expired(w, now)).collect()
    }

    pub fn node_state(&self, num: u32, now: DateTime<Utc>) -> Option<NodeState> {
        self.nodes.get(&num).and_then(|n| n.state(now))
    }

    /// Radio sections the device has reported
    pub fn reported_radio_sections(&self) -> Vec<RadioSection> {
        RadioSection::ALL
            .into_iter()
            .filter(|s| sections::radio_value(&self.radio, *s).is_some())
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct DeviceStore {
    current: Arc<DeviceSnapshot>,
}

impl DeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Arc<DeviceSnapshot> {
        Arc::clone(&self.current)
    }

    pub fn clear(&mut self) {
        self.current = Arc::new(DeviceSnapshot::default());
    }

    pub fn mark_config_complete(&mut self) {
        if !self.current.config_complete {
            Arc::make_mut(&mut self.current).config_complete = true;
        }
    }

    /// Drop waypoints whose expiry has passed. Returns how many were removed.
    pub fn evict_expired_waypoints(&mut self, now: DateTime<Utc>) -> usize {
        let expired = self.current.waypoints.values().filter(|w| waypoint_expired(w, now)).count();
        if expired > 0 {
            Arc::make_mut(&mut self.current)
                .waypoints
                .retain(|_, w| !waypoint_expired(w, now));
        }
        expired
    }

    /// Merge one decoded message. Applying the same message twice leaves the store as if it
    /// had been applied once (apart from last-heard times). Returns whether anything changed.
    pub fn apply_inbound(&mut self, msg: &DeviceMessage, now: DateTime<Utc>) -> bool {
        match msg {
            DeviceMessage::Ack { .. }
            | DeviceMessage::Nack { .. }
            | DeviceMessage::ConfigComplete(_)
            | DeviceMessage::Rebooted => return false,
            _ => {}
        }
        let snap = Arc::make_mut(&mut self.current);
        match msg {
            DeviceMessage::MyInfo(info) => {
                snap.my_node_num = Some(info.my_node_num);
                snap.my_info = Some(info.clone());
                snap.nodes
                    .entry(info.my_node_num)
                    .or_insert_with(|| NodeRecord::new(info.my_node_num));
            }
            DeviceMessage::Metadata(meta) => {
                debug!("Device firmware {}", escape_log(&meta.firmware_version));
                snap.metadata = Some(meta.clone());
            }
            DeviceMessage::NodeInfo(info) => {
                let node = snap.nodes.entry(info.num).or_insert_with(|| NodeRecord::new(info.num));
                if let Some(user) = &info.user {
                    node.user = Some(user.clone());
                }
                node.snr = info.snr;
                node.hops_away = info.hops_away;
                node.last_heard = if info.last_heard != 0 {
                    Utc.timestamp_opt(info.last_heard as i64, 0).single().or(Some(now))
                } else {
                    node.last_heard
                };
                if let Some(pos) = &info.position {
                    node.push_position(pos.clone(), now);
                }
                if let Some(dm) = &info.device_metrics {
                    node.push_telemetry(TelemetrySample {
                        received_at: now,
                        time: info.last_heard,
                        device: Some(dm.clone()),
                        environment: None,
                    });
                }
            }
            DeviceMessage::User { from, user } => {
                let node = snap.nodes.entry(*from).or_insert_with(|| NodeRecord::new(*from));
                node.user = Some(user.clone());
                node.last_heard = Some(now);
            }
            DeviceMessage::Position { from, position } => {
                let node = snap.nodes.entry(*from).or_insert_with(|| NodeRecord::new(*from));
                node.push_position(position.clone(), now);
                node.last_heard = Some(now);
            }
            DeviceMessage::Telemetry { from, telemetry } => {
                use proto::telemetry::Variant;
                let node = snap.nodes.entry(*from).or_insert_with(|| NodeRecord::new(*from));
                let (device, environment) = match &telemetry.variant {
                    Some(Variant::DeviceMetrics(d)) => (Some(d.clone()), None),
                    Some(Variant::EnvironmentMetrics(e)) => (None, Some(e.clone())),
                    None => (None, None),
                };
                node.push_telemetry(TelemetrySample {
                    received_at: now,
                    time: telemetry.time,
                    device,
                    environment,
                });
                node.last_heard = Some(now);
            }
            DeviceMessage::Config(variant) => snap.radio.set(variant.clone()),
            DeviceMessage::ModuleConfig(variant) => snap.modules.set(variant.clone()),
            DeviceMessage::Channel(channel) => {
                let idx = channel.index;
                match usize::try_from(idx).ok().filter(|i| *i < CHANNEL_SLOTS) {
                    Some(i) => snap.channels[i] = Some(channel.clone()),
                    None => warn!("Ignoring channel report with out-of-range index {}", idx),
                }
            }
            DeviceMessage::Waypoint { waypoint, .. } => {
                snap.waypoints.insert(waypoint.id, waypoint.clone());
            }
            DeviceMessage::Text(text) => {
                let seen = snap
                    .messages
                    .iter()
                    .rev()
                    .any(|m| m.message.id == text.id && m.message.from == text.from);
                if !seen {
                    snap.messages.push(StoredMessage {
                        received_at: now,
                        message: text.clone(),
                    });
                    if snap.messages.len() > MESSAGE_LOG_LIMIT {
                        let excess = snap.messages.len() - MESSAGE_LOG_LIMIT;
                        snap.messages.drain(..excess);
                    }
                }
                if let Some(node) = snap.nodes.get_mut(&text.from) {
                    node.last_heard = Some(now);
                }
            }
            DeviceMessage::Ack { .. }
            | DeviceMessage::Nack { .. }
            | DeviceMessage::ConfigComplete(_)
            | DeviceMessage::Rebooted => {}
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn classification_boundaries() {
        assert_eq!(NodeState::classify(0), NodeState::Active);
        assert_eq!(NodeState::classify(14), NodeState::Active);
        assert_eq!(NodeState::classify(15), NodeState::Warning);
        assert_eq!(NodeState::classify(59), NodeState::Warning);
        assert_eq!(NodeState::classify(60), NodeState::Error);
        assert_eq!(NodeState::classify(24 * 60), NodeState::Error);
    }

    #[test]
    fn node_state_uses_last_heard() {
        let now = Utc::now();
        let mut store = DeviceStore::new();
        store.apply_inbound(
            &DeviceMessage::User { from: 3, user: proto::User { long_name: "Base".into(), ..Default::default() } },
            now - Duration::minutes(20),
        );
        let snap = store.snapshot();
        assert_eq!(snap.node_state(3, now), Some(NodeState::Warning));
        assert_eq!(snap.node_state(4, now), None);
    }

    #[test]
    fn position_history_is_appended_and_idempotent() {
        let now = Utc::now();
        let mut store = DeviceStore::new();
        let p1 = proto::Position { latitude_i: 1, longitude_i: 2, time: 10, ..Default::default() };
        let p2 = proto::Position { latitude_i: 3, longitude_i: 4, time: 20, ..Default::default() };
        let m1 = DeviceMessage::Position { from: 9, position: p1.clone() };
        store.apply_inbound(&m1, now);
        store.apply_inbound(&m1, now);
        store.apply_inbound(&DeviceMessage::Position { from: 9, position: p2.clone() }, now);
        let snap = store.snapshot();
        let node = &snap.nodes[&9];
        assert_eq!(node.positions.len(), 2);
        assert_eq!(node.position(), Some(&p2));
    }

    #[test]
    fn snapshots_are_copy_on_write() {
        let mut store = DeviceStore::new();
        let before = store.snapshot();
        store.apply_inbound(
            &DeviceMessage::Config(config::PayloadVariant::Lora(config::LoRaConfig {
                tx_power: 20,
                ..Default::default()
            })),
            Utc::now(),
        );
        assert!(before.radio.lora.is_none());
        let after = store.snapshot();
        assert_eq!(after.lora().map(|l| l.tx_power), Some(20));
        assert_eq!(
            after.section_value(SectionKey::Radio(RadioSection::Lora)).unwrap()["txPower"],
            20
        );
    }

    #[test]
    fn expired_waypoints_are_hidden_then_evicted() {
        let now = Utc::now();
        let mut store = DeviceStore::new();
        let live = proto::Waypoint { id: 1, expire: 0, ..Default::default() };
        let dead = proto::Waypoint { id: 2, expire: 1, ..Default::default() };
        let later = proto::Waypoint { id: 3, expire: (now.timestamp() + 3600) as u32, ..Default::default() };
        for w in [live, dead, later] {
            store.apply_inbound(&DeviceMessage::Waypoint { from: 1, waypoint: w }, now);
        }
        let snap = store.snapshot();
        let ids: Vec<u32> = snap.active_waypoints(now).iter().map(|w| w.id).collect();
        assert_eq!(ids, vec![1, 3]);
        assert_eq!(snap.waypoints.len(), 3);
        assert_eq!(store.evict_expired_waypoints(now), 1);
        assert_eq!(store.snapshot().waypoints.len(), 2);
    }

    #[test]
    fn duplicate_text_is_logged_once() {
        let mut store = DeviceStore::new();
        let msg = DeviceMessage::Text(TextMessage { id: 5, from: 2, to: 0, channel: 0, text: "hi".into() });
        store.apply_inbound(&msg, Utc::now());
        store.apply_inbound(&msg, Utc::now());
        assert_eq!(store.snapshot().messages.len(), 1);
    }

    #[test]
    fn out_of_range_channel_is_ignored() {
        let mut store = DeviceStore::new();
        store.apply_inbound(&DeviceMessage::Channel(proto::Channel { index: 9, ..Default::default() }), Utc::now());
        assert!(store.snapshot().channels.iter().all(|c| c.is_none()));
    }

    #[test]
    fn clear_resets_everything() {
        let mut store = DeviceStore::new();
        store.apply_inbound(&DeviceMessage::MyInfo(proto::MyNodeInfo { my_node_num: 1, ..Default::default() }), Utc::now());
        store.mark_config_complete();
        store.clear();
        assert_eq!(*store.snapshot(), DeviceSnapshot::default());
    }
}
