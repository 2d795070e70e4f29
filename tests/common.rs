//! Test utilities & fixtures.
//! A simulated Meshtastic radio on the far side of a `tokio::io::duplex` pipe. It answers the
//! config download, acknowledges (or rejects, or ignores) packets per its [`Policy`], stores
//! writes and answers read-backs from what it stored.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use prost::Message;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::task::JoinHandle;

use meshsync::connection::{ConnectionHandle, ConnectionManager, SessionSettings};
use meshsync::errors::ConnectError;
use meshsync::device::sections::{self, ModuleSection, RadioSection, SectionKey};
use meshsync::meshtastic::framer::StreamFramer;
use meshsync::meshtastic::{decode_to_radio, encode_report, DeviceMessage, TextMessage};
use meshsync::protobuf::meshtastic::admin_message::PayloadVariant as AdminPayload;
use meshsync::protobuf::meshtastic::mesh_packet::PayloadVariant as PacketPayload;
use meshsync::protobuf::meshtastic::to_radio::PayloadVariant as ToPayload;
use meshsync::protobuf::meshtastic::{
    config, module_config, AdminMessage, Channel, ChannelSettings, DeviceMetadata, MyNodeInfo, NodeInfo,
    PortNum, User, Waypoint,
};

pub const NODE_NUM: u32 = 0x1234_5678;
const MAX_FRAME: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reply {
    Ack,
    Nack(i32),
    Ignore,
}

#[derive(Debug, Clone)]
pub struct Policy {
    /// Answer want-config with the full download
    pub answer_config: bool,
    /// How packets asking for an ack are answered
    pub reply: Reply,
    /// Overrides `reply` for channel writes
    pub channel_reply: Option<Reply>,
    /// Answer get-config / get-channel requests
    pub echo: bool,
    /// The device clamps tx power to this value when storing it
    pub max_tx_power: Option<i32>,
    /// Put line noise and a corrupt frame on the wire before the download
    pub noise_before_config: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            answer_config: true,
            reply: Reply::Ack,
            channel_reply: None,
            echo: true,
            max_tx_power: None,
            noise_before_config: false,
        }
    }
}

/// Everything the radio received
#[derive(Debug, Default)]
pub struct RadioLog {
    pub want_config: Vec<u32>,
    pub admin: Vec<AdminMessage>,
    pub texts: Vec<String>,
    pub waypoints: Vec<Waypoint>,
    pub heartbeats: usize,
    pub disconnects: usize,
    /// Ids of packets that asked for an ack and got none
    pub unanswered: Vec<u32>,
}

struct DeviceSide {
    radio: Vec<config::PayloadVariant>,
    modules: Vec<module_config::PayloadVariant>,
    channels: Vec<Channel>,
    owner: User,
    policy: Arc<Mutex<Policy>>,
    log: Arc<Mutex<RadioLog>>,
}

pub fn default_lora() -> config::LoRaConfig {
    config::LoRaConfig {
        tx_power: 17,
        bandwidth: 250,
        region: 1,
        hop_limit: 3,
        tx_enabled: true,
        ..Default::default()
    }
}

impl DeviceSide {
    fn new(policy: Arc<Mutex<Policy>>, log: Arc<Mutex<RadioLog>>) -> Self {
        Self {
            radio: vec![
                config::PayloadVariant::Device(config::DeviceConfig {
                    role: 0,
                    node_info_broadcast_secs: 900,
                    ..Default::default()
                }),
                config::PayloadVariant::Lora(default_lora()),
            ],
            modules: vec![module_config::PayloadVariant::Mqtt(module_config::MqttConfig {
                enabled: false,
                address: "mqtt.meshtastic.org".into(),
                ..Default::default()
            })],
            channels: vec![
                Channel {
                    index: 0,
                    role: 1,
                    settings: Some(ChannelSettings {
                        name: "LongFast".into(),
                        psk: vec![1],
                        ..Default::default()
                    }),
                },
                Channel {
                    index: 1,
                    role: 0,
                    settings: None,
                },
            ],
            owner: User {
                id: format!("!{:08x}", NODE_NUM),
                long_name: "Test Node".into(),
                short_name: "TST".into(),
                ..Default::default()
            },
            policy,
            log,
        }
    }

    fn policy(&self) -> Policy {
        self.policy.lock().unwrap().clone()
    }

    fn download(&self, id: u32) -> Vec<DeviceMessage> {
        let mut out = vec![
            DeviceMessage::MyInfo(MyNodeInfo {
                my_node_num: NODE_NUM,
                ..Default::default()
            }),
            DeviceMessage::Metadata(DeviceMetadata {
                firmware_version: "2.3.2.test".into(),
                ..Default::default()
            }),
            DeviceMessage::NodeInfo(NodeInfo {
                num: NODE_NUM,
                user: Some(self.owner.clone()),
                ..Default::default()
            }),
        ];
        out.extend(self.radio.iter().cloned().map(DeviceMessage::Config));
        out.extend(self.modules.iter().cloned().map(DeviceMessage::ModuleConfig));
        out.extend(self.channels.iter().cloned().map(DeviceMessage::Channel));
        out.push(DeviceMessage::ConfigComplete(id));
        out
    }

    fn store_radio(&mut self, mut v: config::PayloadVariant) {
        if let (config::PayloadVariant::Lora(lora), Some(max)) = (&mut v, self.policy().max_tx_power) {
            lora.tx_power = lora.tx_power.min(max);
        }
        let section = RadioSection::of(&v);
        self.radio.retain(|r| RadioSection::of(r) != section);
        self.radio.push(v);
    }

    fn store_module(&mut self, v: module_config::PayloadVariant) {
        let section = ModuleSection::of(&v);
        self.modules.retain(|m| ModuleSection::of(m) != section);
        self.modules.push(v);
    }

    fn store_channel(&mut self, ch: Channel) {
        self.channels.retain(|c| c.index != ch.index);
        self.channels.push(ch);
    }

    /// Answer to a read request, matched against the requests the engine builds
    fn read_back(&self, payload: &AdminPayload) -> Option<DeviceMessage> {
        let asks_for = |key: SectionKey| sections::build_read(key).payload_variant.as_ref() == Some(payload);
        if let Some(r) = RadioSection::ALL.into_iter().find(|r| asks_for(SectionKey::Radio(*r))) {
            return self
                .radio
                .iter()
                .find(|v| RadioSection::of(v) == r)
                .cloned()
                .map(DeviceMessage::Config);
        }
        if let Some(m) = ModuleSection::ALL.into_iter().find(|m| asks_for(SectionKey::Module(*m))) {
            return self
                .modules
                .iter()
                .find(|v| ModuleSection::of(v) == m)
                .cloned()
                .map(DeviceMessage::ModuleConfig);
        }
        if let AdminPayload::GetChannelRequest(i) = payload {
            let index = *i as i32 - 1;
            return self
                .channels
                .iter()
                .find(|c| c.index == index)
                .cloned()
                .map(DeviceMessage::Channel);
        }
        None
    }

    fn handle(&mut self, payload: ToPayload) -> Vec<DeviceMessage> {
        let policy = self.policy();
        match payload {
            ToPayload::WantConfigId(id) => {
                self.log.lock().unwrap().want_config.push(id);
                if policy.answer_config {
                    self.download(id)
                } else {
                    Vec::new()
                }
            }
            ToPayload::Heartbeat(_) => {
                self.log.lock().unwrap().heartbeats += 1;
                Vec::new()
            }
            ToPayload::Disconnect(_) => {
                self.log.lock().unwrap().disconnects += 1;
                Vec::new()
            }
            ToPayload::Packet(packet) => {
                let Some(PacketPayload::Decoded(data)) = packet.payload_variant else {
                    return Vec::new();
                };
                let mut reply = policy.reply;
                let mut out = Vec::new();
                if data.portnum == PortNum::AdminApp as i32 {
                    let admin = AdminMessage::decode(data.payload.as_slice()).expect("admin payload");
                    self.log.lock().unwrap().admin.push(admin.clone());
                    let Some(admin_payload) = admin.payload_variant else {
                        return Vec::new();
                    };
                    if data.want_response {
                        if policy.echo {
                            out.extend(self.read_back(&admin_payload));
                        }
                        return out;
                    }
                    if matches!(admin_payload, AdminPayload::SetChannel(_)) {
                        reply = policy.channel_reply.unwrap_or(reply);
                    }
                    if reply == Reply::Ack {
                        match admin_payload {
                            AdminPayload::SetConfig(cfg) => {
                                if let Some(v) = cfg.payload_variant {
                                    self.store_radio(v);
                                }
                            }
                            AdminPayload::SetModuleConfig(cfg) => {
                                if let Some(v) = cfg.payload_variant {
                                    self.store_module(v);
                                }
                            }
                            AdminPayload::SetChannel(ch) => self.store_channel(ch),
                            AdminPayload::SetOwner(user) => self.owner = user,
                            _ => {}
                        }
                    }
                } else if data.portnum == PortNum::TextMessageApp as i32 {
                    let text = String::from_utf8_lossy(&data.payload).to_string();
                    self.log.lock().unwrap().texts.push(text);
                } else if data.portnum == PortNum::WaypointApp as i32 {
                    let wp = Waypoint::decode(data.payload.as_slice()).expect("waypoint payload");
                    self.log.lock().unwrap().waypoints.push(wp);
                }
                if packet.want_ack {
                    match reply {
                        Reply::Ack => out.push(DeviceMessage::Ack {
                            request_id: packet.id,
                            from: NODE_NUM,
                        }),
                        Reply::Nack(error) => out.push(DeviceMessage::Nack {
                            request_id: packet.id,
                            from: NODE_NUM,
                            error,
                        }),
                        Reply::Ignore => self.log.lock().unwrap().unanswered.push(packet.id),
                    }
                }
                out
            }
        }
    }
}

/// Line noise, a header with an impossible length, and a frame whose payload is not protobuf
fn noise() -> Vec<u8> {
    let mut bytes = b"boot banner\r\n".to_vec();
    bytes.extend_from_slice(&[0x94, 0xC3, 0xFF, 0xFF]);
    bytes.extend(StreamFramer::frame(&[0xFF, 0xFF, 0xFF], MAX_FRAME).expect("frame"));
    bytes
}

pub struct FakeRadio {
    pub handle: ConnectionHandle,
    pub policy: Arc<Mutex<Policy>>,
    pub log: Arc<Mutex<RadioLog>>,
    task: JoinHandle<()>,
    inject: tokio::sync::mpsc::UnboundedSender<DeviceMessage>,
}

impl FakeRadio {
    /// Attach a simulated radio to `manager` under `key` and return once the link is open.
    pub async fn attach(manager: &ConnectionManager, key: &str, policy: Policy) -> FakeRadio {
        let (client, device) = tokio::io::duplex(64 * 1024);
        let policy = Arc::new(Mutex::new(policy));
        let log = Arc::new(Mutex::new(RadioLog::default()));
        let (inject, mut injected) = tokio::sync::mpsc::unbounded_channel::<DeviceMessage>();
        let mut side = DeviceSide::new(policy.clone(), log.clone());

        let task = tokio::spawn(async move {
            let (mut rd, mut wr) = tokio::io::split(device);
            let mut framer = StreamFramer::new(MAX_FRAME);
            let mut buf = [0u8; 2048];
            loop {
                tokio::select! {
                    read = rd.read(&mut buf) => {
                        let n = match read {
                            Ok(0) | Err(_) => break,
                            Ok(n) => n,
                        };
                        framer.push(&buf[..n]);
                        while let Some(frame) = framer.next_frame() {
                            let Ok(payload) = frame else { continue };
                            let Ok(to_radio) = decode_to_radio(&payload) else { continue };
                            let Some(variant) = to_radio.payload_variant else { continue };
                            if matches!(variant, ToPayload::WantConfigId(_)) && side.policy().noise_before_config {
                                if wr.write_all(&noise()).await.is_err() {
                                    return;
                                }
                            }
                            for reply in side.handle(variant) {
                                let bytes = encode_report(&reply, MAX_FRAME).expect("encode report");
                                if wr.write_all(&bytes).await.is_err() {
                                    return;
                                }
                            }
                        }
                    }
                    Some(msg) = injected.recv() => {
                        let bytes = encode_report(&msg, MAX_FRAME).expect("encode report");
                        if wr.write_all(&bytes).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        let handle = manager
            .connect_stream(key, client, true)
            .await
            .expect("attach fake radio");
        FakeRadio {
            handle,
            policy,
            log,
            task,
            inject,
        }
    }

    /// Attach and wait for the config download to finish.
    pub async fn connected(manager: &ConnectionManager, key: &str, policy: Policy) -> FakeRadio {
        let radio = FakeRadio::attach(manager, key, policy).await;
        let node = manager
            .wait_connected(&radio.handle, Duration::from_secs(5))
            .await
            .expect("connected");
        assert_eq!(node, NODE_NUM);
        radio
    }

    /// Try to attach a second stream under `key`; the radio side is never served.
    pub async fn attach_expect_err(manager: &ConnectionManager, key: &str) -> ConnectError {
        let (client, _device) = tokio::io::duplex(1024);
        manager
            .connect_stream(key, client, false)
            .await
            .expect_err("attach should be refused")
    }

    pub fn set_policy(&self, f: impl FnOnce(&mut Policy)) {
        f(&mut self.policy.lock().unwrap());
    }

    /// Send an unsolicited report from the radio
    pub fn inject(&self, msg: DeviceMessage) {
        self.inject.send(msg).expect("radio task alive");
    }

    pub fn inject_text(&self, from: u32, text: &str) {
        self.inject(DeviceMessage::Text(TextMessage {
            id: rand_id(),
            from,
            to: meshsync::meshtastic::BROADCAST_ADDR,
            channel: 0,
            text: text.to_string(),
        }));
    }

    /// Acknowledge every packet that was left unanswered so far. Returns how many.
    pub fn ack_unanswered(&self) -> usize {
        let ids = std::mem::take(&mut self.log.lock().unwrap().unanswered);
        for &request_id in &ids {
            self.inject(DeviceMessage::Ack {
                request_id,
                from: NODE_NUM,
            });
        }
        ids.len()
    }

    /// Simulate pulling the cable
    pub fn unplug(&self) {
        self.task.abort();
    }

    pub fn admin_log(&self) -> Vec<AdminMessage> {
        self.log.lock().unwrap().admin.clone()
    }
}

fn rand_id() -> u32 {
    rand::random::<u32>().max(1)
}

/// Settings with short deadlines so timeout paths finish quickly
pub fn fast_settings() -> SessionSettings {
    SessionSettings {
        configure_timeout: Duration::from_millis(500),
        commit_ack_timeout: Duration::from_millis(300),
        send_ack_timeout: Duration::from_millis(300),
        heartbeat: None,
        ..SessionSettings::default()
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
