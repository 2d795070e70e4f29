//! # Meshtastic frame codec
//!
//! Turns the raw byte stream of a radio link into structured [`DeviceMessage`]s and turns
//! [`OutboundRequest`]s into framed `ToRadio` bytes.
//!
//! The codec is incremental and pull based: bytes are pushed as they arrive (with no
//! alignment guarantee) and decoded messages are pulled one at a time with
//! [`FrameCodec::next_event`]. Decoding is pure and synchronous. A frame that cannot be
//! decoded yields a single [`CodecError::Malformed`] and the stream carries on.
//!
//! ```rust
//! use meshsync::meshtastic::{encode_report, DeviceMessage, FrameCodec};
//!
//! let bytes = encode_report(&DeviceMessage::ConfigComplete(42), 512).unwrap();
//! let mut codec = FrameCodec::new(512);
//! codec.push(&bytes);
//! assert_eq!(codec.next_event(), Some(Ok(DeviceMessage::ConfigComplete(42))));
//! ```
//!
//! Every outbound mesh packet gets a fresh non-zero request id. Admin writes and sends are
//! flagged `want_ack`; the radio answers with a routing packet whose `request_id` echoes
//! that id, which decodes to [`DeviceMessage::Ack`] or [`DeviceMessage::Nack`].

pub mod framer;

use log::{debug, trace, warn};
use prost::Message;
use serde::Serialize;

use crate::errors::CodecError;
use crate::logutil::{escape_log, hex_snippet};
use crate::metrics;
use crate::protobuf::meshtastic as proto;
use framer::StreamFramer;
use proto::admin_message::PayloadVariant as AdminPayload;
use proto::from_radio::PayloadVariant as FromPayload;
use proto::mesh_packet::{PayloadVariant as PacketPayload, Priority};
use proto::to_radio::PayloadVariant as ToPayload;
use proto::PortNum;

/// Destination for mesh-wide packets
pub const BROADCAST_ADDR: u32 = 0xFFFF_FFFF;

/// A text message seen on the mesh
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TextMessage {
    pub id: u32,
    pub from: u32,
    pub to: u32,
    pub channel: u32,
    pub text: String,
}

/// One decoded report from the radio.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    MyInfo(proto::MyNodeInfo),
    NodeInfo(proto::NodeInfo),
    User { from: u32, user: proto::User },
    Position { from: u32, position: proto::Position },
    Telemetry { from: u32, telemetry: proto::Telemetry },
    Config(proto::config::PayloadVariant),
    ModuleConfig(proto::module_config::PayloadVariant),
    Channel(proto::Channel),
    Waypoint { from: u32, waypoint: proto::Waypoint },
    Text(TextMessage),
    Metadata(proto::DeviceMetadata),
    ConfigComplete(u32),
    Rebooted,
    /// The radio accepted the packet with this id
    Ack { request_id: u32, from: u32 },
    /// The radio refused the packet with this id (routing error code)
    Nack { request_id: u32, from: u32, error: i32 },
}

/// Human readable name of a routing error code
pub fn routing_error_name(code: i32) -> String {
    match proto::routing::Error::try_from(code) {
        Ok(e) => e.as_str_name().to_string(),
        Err(_) => format!("ERROR_{}", code),
    }
}

/// Requests the client can put on the wire.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundRequest {
    WantConfig(u32),
    Heartbeat,
    Disconnect,
    /// Admin message addressed to the locally attached node
    Admin(proto::AdminMessage),
    Text { to: u32, channel: u32, text: String },
    Waypoint { to: u32, channel: u32, waypoint: proto::Waypoint },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedRequest {
    /// Mesh packet id to correlate acknowledgements with; `None` for stream-level requests
    pub request_id: Option<u32>,
    pub bytes: Vec<u8>,
}

pub struct FrameCodec {
    framer: StreamFramer,
    max_len: usize,
    next_id: u32,
    local_node: Option<u32>,
    heartbeat_nonce: u32,
}

impl FrameCodec {
    pub fn new(max_len: usize) -> Self {
        let mut seed: u32 = rand::random();
        if seed == 0 {
            seed = 1;
        }
        Self {
            framer: StreamFramer::new(max_len),
            max_len,
            next_id: seed,
            local_node: None,
            heartbeat_nonce: 0,
        }
    }

    /// Node number admin messages are addressed to
    pub fn set_local_node(&mut self, node: u32) {
        self.local_node = Some(node);
    }

    pub fn local_node(&self) -> Option<u32> {
        self.local_node
    }

    pub fn push(&mut self, bytes: &[u8]) {
        trace!("RX {} bytes: {}", bytes.len(), hex_snippet(bytes, 64));
        self.framer.push(bytes);
    }

    /// Pull the next decoded message. Frames carrying nothing of interest are skipped.
    pub fn next_event(&mut self) -> Option<Result<DeviceMessage, CodecError>> {
        loop {
            let skipped_before = self.framer.skipped();
            let frame = self.framer.next_frame_with(decode_from_radio);
            let skipped = self.framer.skipped() - skipped_before;
            if skipped > 0 {
                metrics::add_noise_bytes(skipped);
            }
            match frame? {
                Ok(Some(msg)) => {
                    metrics::inc_frames_decoded();
                    return Some(Ok(msg));
                }
                Ok(None) => {
                    metrics::inc_frames_decoded();
                    continue;
                }
                Err(e) => {
                    metrics::inc_frames_malformed();
                    return Some(Err(e));
                }
            }
        }
    }

    /// Decode everything currently buffered.
    pub fn drain(&mut self) -> Vec<Result<DeviceMessage, CodecError>> {
        std::iter::from_fn(|| self.next_event()).collect()
    }

    pub fn reset(&mut self) {
        self.framer.clear();
    }

    fn allocate_id(&mut self) -> u32 {
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1);
        if self.next_id == 0 {
            self.next_id = 1;
        }
        id
    }

    fn packet(&mut self, to: u32, channel: u32, data: proto::Data) -> (u32, proto::MeshPacket) {
        let id = self.allocate_id();
        let packet = proto::MeshPacket {
            to,
            channel,
            id,
            want_ack: true,
            priority: Priority::Reliable as i32,
            payload_variant: Some(PacketPayload::Decoded(data)),
            ..Default::default()
        };
        (id, packet)
    }

    pub fn encode(&mut self, request: &OutboundRequest) -> Result<EncodedRequest, CodecError> {
        let (request_id, payload) = match request {
            OutboundRequest::WantConfig(id) => (None, ToPayload::WantConfigId(*id)),
            OutboundRequest::Heartbeat => {
                self.heartbeat_nonce = self.heartbeat_nonce.wrapping_add(1);
                (
                    None,
                    ToPayload::Heartbeat(proto::Heartbeat {
                        nonce: self.heartbeat_nonce,
                    }),
                )
            }
            OutboundRequest::Disconnect => (None, ToPayload::Disconnect(true)),
            OutboundRequest::Admin(admin) => {
                let want_response = matches!(
                    admin.payload_variant,
                    Some(AdminPayload::GetChannelRequest(_))
                        | Some(AdminPayload::GetConfigRequest(_))
                        | Some(AdminPayload::GetModuleConfigRequest(_))
                        | Some(AdminPayload::GetOwnerRequest(_))
                );
                let data = proto::Data {
                    portnum: PortNum::AdminApp as i32,
                    payload: admin.encode_to_vec(),
                    want_response,
                    ..Default::default()
                };
                let to = self.local_node.unwrap_or(0);
                let (id, mut packet) = self.packet(to, 0, data);
                // Reads are answered by the response itself
                packet.want_ack = !want_response;
                (Some(id), ToPayload::Packet(packet))
            }
            OutboundRequest::Text { to, channel, text } => {
                let data = proto::Data {
                    portnum: PortNum::TextMessageApp as i32,
                    payload: text.as_bytes().to_vec(),
                    ..Default::default()
                };
                let (id, packet) = self.packet(*to, *channel, data);
                debug!("Encoding text id={} to=0x{:08x} text='{}'", id, to, escape_log(text));
                (Some(id), ToPayload::Packet(packet))
            }
            OutboundRequest::Waypoint {
                to,
                channel,
                waypoint,
            } => {
                let data = proto::Data {
                    portnum: PortNum::WaypointApp as i32,
                    payload: waypoint.encode_to_vec(),
                    ..Default::default()
                };
                let (id, packet) = self.packet(*to, *channel, data);
                (Some(id), ToPayload::Packet(packet))
            }
        };
        let msg = proto::ToRadio {
            payload_variant: Some(payload),
        };
        let bytes = StreamFramer::frame(&msg.encode_to_vec(), self.max_len)?;
        Ok(EncodedRequest { request_id, bytes })
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(framer::DEFAULT_MAX_FRAME_LEN)
    }
}

/// Decode one `FromRadio` payload. `Ok(None)` means the frame is valid but carries nothing
/// the engine tracks.
pub fn decode_from_radio(payload: &[u8]) -> Result<Option<DeviceMessage>, CodecError> {
    let msg = proto::FromRadio::decode(payload)
        .map_err(|e| CodecError::Malformed(format!("FromRadio: {}", e)))?;
    let Some(variant) = msg.payload_variant else {
        return Ok(None);
    };
    Ok(match variant {
        FromPayload::MyInfo(info) => Some(DeviceMessage::MyInfo(info)),
        FromPayload::NodeInfo(node) => Some(DeviceMessage::NodeInfo(node)),
        FromPayload::Config(cfg) => cfg.payload_variant.map(DeviceMessage::Config),
        FromPayload::ModuleConfig(cfg) => cfg.payload_variant.map(DeviceMessage::ModuleConfig),
        FromPayload::Channel(ch) => Some(DeviceMessage::Channel(ch)),
        FromPayload::ConfigCompleteId(id) => Some(DeviceMessage::ConfigComplete(id)),
        FromPayload::Rebooted(_) => Some(DeviceMessage::Rebooted),
        FromPayload::Metadata(meta) => Some(DeviceMessage::Metadata(meta)),
        FromPayload::Packet(packet) => decode_packet(packet)?,
    })
}

fn decode_packet(packet: proto::MeshPacket) -> Result<Option<DeviceMessage>, CodecError> {
    let data = match packet.payload_variant {
        Some(PacketPayload::Decoded(data)) => data,
        Some(PacketPayload::Encrypted(_)) | None => {
            trace!("Ignoring undecoded packet id={} from=0x{:08x}", packet.id, packet.from);
            return Ok(None);
        }
    };
    let from = packet.from;
    let malformed = |what: &str, e: prost::DecodeError| {
        CodecError::Malformed(format!("{} payload from 0x{:08x}: {}", what, from, e))
    };

    let port = PortNum::try_from(data.portnum).unwrap_or(PortNum::UnknownApp);
    let msg = match port {
        PortNum::RoutingApp => {
            let routing = proto::Routing::decode(data.payload.as_slice())
                .map_err(|e| malformed("routing", e))?;
            let code = match routing.variant {
                Some(proto::routing::Variant::ErrorReason(code)) => code,
                None => 0,
            };
            if code == 0 {
                Some(DeviceMessage::Ack {
                    request_id: data.request_id,
                    from,
                })
            } else {
                debug!(
                    "Routing error {} for request {} from 0x{:08x}",
                    routing_error_name(code),
                    data.request_id,
                    from
                );
                Some(DeviceMessage::Nack {
                    request_id: data.request_id,
                    from,
                    error: code,
                })
            }
        }
        // Explicit ACK (priority=ACK with reply_id set) on any port
        _ if packet.priority == Priority::Ack as i32 && data.reply_id != 0 => Some(DeviceMessage::Ack {
            request_id: data.reply_id,
            from,
        }),
        PortNum::TextMessageApp => Some(DeviceMessage::Text(TextMessage {
            id: packet.id,
            from,
            to: packet.to,
            channel: packet.channel,
            text: String::from_utf8_lossy(&data.payload).into_owned(),
        })),
        PortNum::PositionApp => {
            let position = proto::Position::decode(data.payload.as_slice())
                .map_err(|e| malformed("position", e))?;
            Some(DeviceMessage::Position { from, position })
        }
        PortNum::NodeinfoApp => {
            let user =
                proto::User::decode(data.payload.as_slice()).map_err(|e| malformed("user", e))?;
            Some(DeviceMessage::User { from, user })
        }
        PortNum::TelemetryApp => {
            let telemetry = proto::Telemetry::decode(data.payload.as_slice())
                .map_err(|e| malformed("telemetry", e))?;
            Some(DeviceMessage::Telemetry { from, telemetry })
        }
        PortNum::WaypointApp => {
            let waypoint = proto::Waypoint::decode(data.payload.as_slice())
                .map_err(|e| malformed("waypoint", e))?;
            Some(DeviceMessage::Waypoint { from, waypoint })
        }
        PortNum::AdminApp => {
            let admin = proto::AdminMessage::decode(data.payload.as_slice())
                .map_err(|e| malformed("admin", e))?;
            match admin.payload_variant {
                Some(AdminPayload::GetConfigResponse(cfg)) => {
                    cfg.payload_variant.map(DeviceMessage::Config)
                }
                Some(AdminPayload::GetModuleConfigResponse(cfg)) => {
                    cfg.payload_variant.map(DeviceMessage::ModuleConfig)
                }
                Some(AdminPayload::GetChannelResponse(ch)) => Some(DeviceMessage::Channel(ch)),
                Some(AdminPayload::GetOwnerResponse(user)) => Some(DeviceMessage::User { from, user }),
                _ => None,
            }
        }
        other => {
            trace!("Ignoring packet on port {:?} from 0x{:08x}", other, from);
            None
        }
    };
    Ok(msg)
}

/// Encode a device report as a framed `FromRadio`. This is what a radio puts on the wire and
/// is the inverse of [`decode_from_radio`].
pub fn encode_report(msg: &DeviceMessage, max_len: usize) -> Result<Vec<u8>, CodecError> {
    fn packet(from: u32, to: u32, channel: u32, id: u32, port: PortNum, payload: Vec<u8>) -> FromPayload {
        FromPayload::Packet(proto::MeshPacket {
            from,
            to,
            channel,
            id,
            payload_variant: Some(PacketPayload::Decoded(proto::Data {
                portnum: port as i32,
                payload,
                ..Default::default()
            })),
            ..Default::default()
        })
    }
    fn routing(from: u32, request_id: u32, code: i32) -> FromPayload {
        let body = proto::Routing {
            variant: Some(proto::routing::Variant::ErrorReason(code)),
        };
        FromPayload::Packet(proto::MeshPacket {
            from,
            to: from,
            payload_variant: Some(PacketPayload::Decoded(proto::Data {
                portnum: PortNum::RoutingApp as i32,
                payload: body.encode_to_vec(),
                request_id,
                ..Default::default()
            })),
            ..Default::default()
        })
    }

    let variant = match msg.clone() {
        DeviceMessage::MyInfo(info) => FromPayload::MyInfo(info),
        DeviceMessage::NodeInfo(node) => FromPayload::NodeInfo(node),
        DeviceMessage::User { from, user } => {
            packet(from, BROADCAST_ADDR, 0, 0, PortNum::NodeinfoApp, user.encode_to_vec())
        }
        DeviceMessage::Position { from, position } => {
            packet(from, BROADCAST_ADDR, 0, 0, PortNum::PositionApp, position.encode_to_vec())
        }
        DeviceMessage::Telemetry { from, telemetry } => {
            packet(from, BROADCAST_ADDR, 0, 0, PortNum::TelemetryApp, telemetry.encode_to_vec())
        }
        DeviceMessage::Config(v) => FromPayload::Config(proto::Config {
            payload_variant: Some(v),
        }),
        DeviceMessage::ModuleConfig(v) => FromPayload::ModuleConfig(proto::ModuleConfig {
            payload_variant: Some(v),
        }),
        DeviceMessage::Channel(ch) => FromPayload::Channel(ch),
        DeviceMessage::Waypoint { from, waypoint } => {
            packet(from, BROADCAST_ADDR, 0, 0, PortNum::WaypointApp, waypoint.encode_to_vec())
        }
        DeviceMessage::Text(t) => packet(
            t.from,
            t.to,
            t.channel,
            t.id,
            PortNum::TextMessageApp,
            t.text.into_bytes(),
        ),
        DeviceMessage::Metadata(meta) => FromPayload::Metadata(meta),
        DeviceMessage::ConfigComplete(id) => FromPayload::ConfigCompleteId(id),
        DeviceMessage::Rebooted => FromPayload::Rebooted(true),
        DeviceMessage::Ack { request_id, from } => routing(from, request_id, 0),
        DeviceMessage::Nack {
            request_id,
            from,
            error,
        } => routing(from, request_id, error),
    };
    let frame = proto::FromRadio {
        id: 0,
        payload_variant: Some(variant),
    };
    StreamFramer::frame(&frame.encode_to_vec(), max_len)
}

/// Decode one `ToRadio` payload (the device side of the link).
pub fn decode_to_radio(payload: &[u8]) -> Result<proto::ToRadio, CodecError> {
    proto::ToRadio::decode(payload).map_err(|e| {
        warn!("Undecodable ToRadio frame: {}", hex_snippet(payload, 32));
        CodecError::Malformed(format!("ToRadio: {}", e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protobuf::meshtastic::{config, module_config};

    fn round_trip(msg: DeviceMessage) {
        let bytes = encode_report(&msg, 512).unwrap();
        let mut codec = FrameCodec::default();
        codec.push(&bytes);
        assert_eq!(codec.next_event(), Some(Ok(msg)));
        assert_eq!(codec.next_event(), None);
    }

    #[test]
    fn every_radio_section_round_trips() {
        use config::PayloadVariant as V;
        for v in [
            V::Device(config::DeviceConfig { role: 2, serial_enabled: true, ..Default::default() }),
            V::Position(config::PositionConfig { gps_enabled: true, ..Default::default() }),
            V::Power(config::PowerConfig { ls_secs: 300, ..Default::default() }),
            V::Network(config::NetworkConfig {
                wifi_ssid: "mesh".into(),
                ipv4_config: Some(config::network_config::IpV4Config { ip: 0x0a00_0001, ..Default::default() }),
                ..Default::default()
            }),
            V::Display(config::DisplayConfig { screen_on_secs: 60, ..Default::default() }),
            V::Lora(config::LoRaConfig { tx_power: 20, region: 1, ignore_incoming: vec![5, 6], ..Default::default() }),
            V::Bluetooth(config::BluetoothConfig { enabled: true, fixed_pin: 123456, ..Default::default() }),
        ] {
            round_trip(DeviceMessage::Config(v));
        }
    }

    #[test]
    fn every_module_section_round_trips() {
        use module_config::PayloadVariant as V;
        for v in [
            V::Mqtt(module_config::MqttConfig { enabled: true, address: "mqtt.local".into(), ..Default::default() }),
            V::Serial(module_config::SerialConfig { echo: true, ..Default::default() }),
            V::ExternalNotification(module_config::ExternalNotificationConfig { alert_bell: true, ..Default::default() }),
            V::StoreForward(module_config::StoreForwardConfig { records: 10, ..Default::default() }),
            V::RangeTest(module_config::RangeTestConfig { sender: 30, ..Default::default() }),
            V::Telemetry(module_config::TelemetryConfig { device_update_interval: 900, ..Default::default() }),
            V::CannedMessage(module_config::CannedMessageConfig { enabled: true, ..Default::default() }),
            V::RemoteHardware(module_config::RemoteHardwareConfig { enabled: true, ..Default::default() }),
        ] {
            round_trip(DeviceMessage::ModuleConfig(v));
        }
    }

    #[test]
    fn channel_and_mesh_reports_round_trip() {
        round_trip(DeviceMessage::Channel(proto::Channel {
            index: 1,
            role: 2,
            settings: Some(proto::ChannelSettings {
                name: "ops".into(),
                psk: vec![1, 2, 3],
                ..Default::default()
            }),
        }));
        round_trip(DeviceMessage::Text(TextMessage {
            id: 77,
            from: 0x1234,
            to: BROADCAST_ADDR,
            channel: 0,
            text: "hello mesh".into(),
        }));
        round_trip(DeviceMessage::Nack { request_id: 9, from: 1, error: 32 });
        round_trip(DeviceMessage::Ack { request_id: 10, from: 1 });
        round_trip(DeviceMessage::Waypoint {
            from: 5,
            waypoint: proto::Waypoint { id: 3, name: "camp".into(), expire: 1, ..Default::default() },
        });
    }

    #[test]
    fn malformed_frame_then_well_formed_frame() {
        let mut codec = FrameCodec::default();
        // Valid header, garbage protobuf (field 0 is never valid)
        codec.push(&[0x94, 0xC3, 0x00, 0x02, 0x00, 0x00]);
        codec.push(&encode_report(&DeviceMessage::ConfigComplete(5), 512).unwrap());
        let events = codec.drain();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Err(CodecError::Malformed(_))));
        assert_eq!(events[1], Ok(DeviceMessage::ConfigComplete(5)));
    }

    #[test]
    fn truncated_length_prefix_then_well_formed_frame() {
        let mut codec = FrameCodec::default();
        codec.push(&[0x94, 0xC3, 0x00]);
        codec.push(&encode_report(&DeviceMessage::ConfigComplete(5), 512).unwrap());
        let events = codec.drain();
        assert_eq!(events.len(), 2, "{:?}", events);
        assert!(matches!(events[0], Err(CodecError::Malformed(_))));
        assert_eq!(events[1], Ok(DeviceMessage::ConfigComplete(5)));
    }

    #[test]
    fn truncated_prefix_before_a_long_frame() {
        // Declared length (0x94 = 148) is shorter than the frame that follows, so the bogus
        // frame is complete while the real one runs past its end
        let text = DeviceMessage::Text(TextMessage {
            id: 1,
            from: 2,
            to: BROADCAST_ADDR,
            channel: 0,
            text: "x".repeat(200),
        });
        let mut codec = FrameCodec::default();
        codec.push(&[0x94, 0xC3, 0x00]);
        codec.push(&encode_report(&text, 512).unwrap());
        let events = codec.drain();
        assert_eq!(events.len(), 2, "{:?}", events);
        assert!(matches!(events[0], Err(CodecError::Malformed(_))));
        assert_eq!(events[1], Ok(text));
    }

    #[test]
    fn explicit_ack_packet_is_recognised() {
        let packet = proto::MeshPacket {
            from: 9,
            priority: Priority::Ack as i32,
            payload_variant: Some(PacketPayload::Decoded(proto::Data {
                portnum: PortNum::TextMessageApp as i32,
                reply_id: 4242,
                ..Default::default()
            })),
            ..Default::default()
        };
        assert_eq!(
            decode_packet(packet).unwrap(),
            Some(DeviceMessage::Ack { request_id: 4242, from: 9 })
        );
    }

    #[test]
    fn admin_writes_request_ack_and_reads_request_response() {
        let mut codec = FrameCodec::default();
        codec.set_local_node(0xabcd);
        let write = codec
            .encode(&OutboundRequest::Admin(crate::device::sections::admin(
                AdminPayload::BeginEditSettings(true),
            )))
            .unwrap();
        let read = codec
            .encode(&OutboundRequest::Admin(crate::device::sections::admin(
                AdminPayload::GetOwnerRequest(true),
            )))
            .unwrap();
        assert_ne!(write.request_id, read.request_id);

        let mut framer = StreamFramer::default();
        framer.push(&write.bytes);
        let to_radio = decode_to_radio(&framer.next_frame().unwrap().unwrap()).unwrap();
        match to_radio.payload_variant {
            Some(ToPayload::Packet(p)) => {
                assert!(p.want_ack);
                assert_eq!(p.to, 0xabcd);
                assert_eq!(Some(p.id), write.request_id);
            }
            other => panic!("unexpected {:?}", other),
        }
        framer.push(&read.bytes);
        match decode_to_radio(&framer.next_frame().unwrap().unwrap()).unwrap().payload_variant {
            Some(ToPayload::Packet(p)) => assert!(!p.want_ack),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn request_ids_are_never_zero() {
        let mut codec = FrameCodec::default();
        codec.next_id = u32::MAX;
        let a = codec.allocate_id();
        let b = codec.allocate_id();
        assert_eq!(a, u32::MAX);
        assert_eq!(b, 1);
    }
}
