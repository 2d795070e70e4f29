//! Catalogue of editable configuration sections.
//!
//! Every section is addressed by a [`SectionKey`] whose string form is the name the UI uses:
//! `lora`, `externalNotification`, `channel/2` and so on. The helpers here convert between the
//! typed protobuf records held by the store and the JSON values the overlay edits, and build
//! the admin messages that write or re-read a section on the device.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::device::{ModuleConfigSet, RadioConfig, CHANNEL_SLOTS};
use crate::errors::{CommitError, StateError};
use crate::protobuf::meshtastic as proto;
use proto::admin_message::{ConfigType, ModuleConfigType, PayloadVariant as AdminPayload};
use proto::{config, module_config};

/// Independent units of a commit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigGroup {
    Radio,
    Module,
    Channel,
}

impl ConfigGroup {
    pub const ALL: [ConfigGroup; 3] = [ConfigGroup::Radio, ConfigGroup::Module, ConfigGroup::Channel];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConfigGroup::Radio => "radio",
            ConfigGroup::Module => "module",
            ConfigGroup::Channel => "channel",
        }
    }
}

impl fmt::Display for ConfigGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConfigGroup {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "radio" => Ok(ConfigGroup::Radio),
            "module" => Ok(ConfigGroup::Module),
            "channel" | "channels" => Ok(ConfigGroup::Channel),
            other => Err(StateError::UnknownSection(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RadioSection {
    Device,
    Position,
    Power,
    Network,
    Display,
    Lora,
    Bluetooth,
}

impl RadioSection {
    pub const ALL: [RadioSection; 7] = [
        RadioSection::Device,
        RadioSection::Position,
        RadioSection::Power,
        RadioSection::Network,
        RadioSection::Display,
        RadioSection::Lora,
        RadioSection::Bluetooth,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            RadioSection::Device => "device",
            RadioSection::Position => "position",
            RadioSection::Power => "power",
            RadioSection::Network => "network",
            RadioSection::Display => "display",
            RadioSection::Lora => "lora",
            RadioSection::Bluetooth => "bluetooth",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }

    pub fn of(variant: &config::PayloadVariant) -> Self {
        match variant {
            config::PayloadVariant::Device(_) => RadioSection::Device,
            config::PayloadVariant::Position(_) => RadioSection::Position,
            config::PayloadVariant::Power(_) => RadioSection::Power,
            config::PayloadVariant::Network(_) => RadioSection::Network,
            config::PayloadVariant::Display(_) => RadioSection::Display,
            config::PayloadVariant::Lora(_) => RadioSection::Lora,
            config::PayloadVariant::Bluetooth(_) => RadioSection::Bluetooth,
        }
    }

    fn config_type(&self) -> ConfigType {
        match self {
            RadioSection::Device => ConfigType::DeviceConfig,
            RadioSection::Position => ConfigType::PositionConfig,
            RadioSection::Power => ConfigType::PowerConfig,
            RadioSection::Network => ConfigType::NetworkConfig,
            RadioSection::Display => ConfigType::DisplayConfig,
            RadioSection::Lora => ConfigType::LoraConfig,
            RadioSection::Bluetooth => ConfigType::BluetoothConfig,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModuleSection {
    Mqtt,
    Serial,
    ExternalNotification,
    StoreForward,
    RangeTest,
    Telemetry,
    CannedMessage,
    RemoteHardware,
}

impl ModuleSection {
    pub const ALL: [ModuleSection; 8] = [
        ModuleSection::Mqtt,
        ModuleSection::Serial,
        ModuleSection::ExternalNotification,
        ModuleSection::StoreForward,
        ModuleSection::RangeTest,
        ModuleSection::Telemetry,
        ModuleSection::CannedMessage,
        ModuleSection::RemoteHardware,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ModuleSection::Mqtt => "mqtt",
            ModuleSection::Serial => "serial",
            ModuleSection::ExternalNotification => "externalNotification",
            ModuleSection::StoreForward => "storeForward",
            ModuleSection::RangeTest => "rangeTest",
            ModuleSection::Telemetry => "telemetry",
            ModuleSection::CannedMessage => "cannedMessage",
            ModuleSection::RemoteHardware => "remoteHardware",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.name() == name)
    }

    pub fn of(variant: &module_config::PayloadVariant) -> Self {
        use module_config::PayloadVariant as V;
        match variant {
            V::Mqtt(_) => ModuleSection::Mqtt,
            V::Serial(_) => ModuleSection::Serial,
            V::ExternalNotification(_) => ModuleSection::ExternalNotification,
            V::StoreForward(_) => ModuleSection::StoreForward,
            V::RangeTest(_) => ModuleSection::RangeTest,
            V::Telemetry(_) => ModuleSection::Telemetry,
            V::CannedMessage(_) => ModuleSection::CannedMessage,
            V::RemoteHardware(_) => ModuleSection::RemoteHardware,
        }
    }

    fn config_type(&self) -> ModuleConfigType {
        match self {
            ModuleSection::Mqtt => ModuleConfigType::MqttConfig,
            ModuleSection::Serial => ModuleConfigType::SerialConfig,
            ModuleSection::ExternalNotification => ModuleConfigType::ExtnotifConfig,
            ModuleSection::StoreForward => ModuleConfigType::StoreforwardConfig,
            ModuleSection::RangeTest => ModuleConfigType::RangetestConfig,
            ModuleSection::Telemetry => ModuleConfigType::TelemetryConfig,
            ModuleSection::CannedMessage => ModuleConfigType::CannedmsgConfig,
            ModuleSection::RemoteHardware => ModuleConfigType::RemotehardwareConfig,
        }
    }
}

/// Address of one editable section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SectionKey {
    Radio(RadioSection),
    Module(ModuleSection),
    Channel(u8),
}

impl SectionKey {
    pub fn group(&self) -> ConfigGroup {
        match self {
            SectionKey::Radio(_) => ConfigGroup::Radio,
            SectionKey::Module(_) => ConfigGroup::Module,
            SectionKey::Channel(_) => ConfigGroup::Channel,
        }
    }

    /// All sections belonging to a group, in write order
    pub fn all_in(group: ConfigGroup) -> Vec<SectionKey> {
        match group {
            ConfigGroup::Radio => RadioSection::ALL.into_iter().map(SectionKey::Radio).collect(),
            ConfigGroup::Module => ModuleSection::ALL.into_iter().map(SectionKey::Module).collect(),
            ConfigGroup::Channel => (0..CHANNEL_SLOTS as u8).map(SectionKey::Channel).collect(),
        }
    }
}

impl fmt::Display for SectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SectionKey::Radio(s) => f.write_str(s.name()),
            SectionKey::Module(s) => f.write_str(s.name()),
            SectionKey::Channel(i) => write!(f, "channel/{}", i),
        }
    }
}

impl FromStr for SectionKey {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(idx) = s.strip_prefix("channel/") {
            return match idx.parse::<u8>() {
                Ok(i) if (i as usize) < CHANNEL_SLOTS => Ok(SectionKey::Channel(i)),
                _ => Err(StateError::UnknownSection(s.to_string())),
            };
        }
        if let Some(r) = RadioSection::from_name(s) {
            return Ok(SectionKey::Radio(r));
        }
        if let Some(m) = ModuleSection::from_name(s) {
            return Ok(SectionKey::Module(m));
        }
        Err(StateError::UnknownSection(s.to_string()))
    }
}

fn to_json<T: Serialize>(v: &T) -> Value {
    serde_json::to_value(v).unwrap_or(Value::Null)
}

/// Every field of the section at its protocol default, nested records expanded so dotted
/// paths into them can be validated.
pub fn template(key: SectionKey) -> Value {
    match key {
        SectionKey::Radio(r) => match r {
            RadioSection::Device => to_json(&config::DeviceConfig::default()),
            RadioSection::Position => to_json(&config::PositionConfig::default()),
            RadioSection::Power => to_json(&config::PowerConfig::default()),
            RadioSection::Network => to_json(&config::NetworkConfig {
                ipv4_config: Some(Default::default()),
                ..Default::default()
            }),
            RadioSection::Display => to_json(&config::DisplayConfig::default()),
            RadioSection::Lora => to_json(&config::LoRaConfig::default()),
            RadioSection::Bluetooth => to_json(&config::BluetoothConfig::default()),
        },
        SectionKey::Module(m) => match m {
            ModuleSection::Mqtt => to_json(&module_config::MqttConfig::default()),
            ModuleSection::Serial => to_json(&module_config::SerialConfig::default()),
            ModuleSection::ExternalNotification => {
                to_json(&module_config::ExternalNotificationConfig::default())
            }
            ModuleSection::StoreForward => to_json(&module_config::StoreForwardConfig::default()),
            ModuleSection::RangeTest => to_json(&module_config::RangeTestConfig::default()),
            ModuleSection::Telemetry => to_json(&module_config::TelemetryConfig::default()),
            ModuleSection::CannedMessage => to_json(&module_config::CannedMessageConfig::default()),
            ModuleSection::RemoteHardware => to_json(&module_config::RemoteHardwareConfig::default()),
        },
        SectionKey::Channel(i) => to_json(&proto::Channel {
            index: i as i32,
            settings: Some(proto::ChannelSettings {
                module_settings: Some(Default::default()),
                ..Default::default()
            }),
            role: 0,
        }),
    }
}

/// Look up a dotted path inside a JSON object tree.
pub fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |cur, seg| cur.as_object()?.get(*seg))
}

/// Reject paths that do not name a field of the section.
pub fn validate_path(key: SectionKey, path: &[&str]) -> Result<(), StateError> {
    let unknown = || StateError::UnknownField {
        section: key.to_string(),
        field: path.join("."),
    };
    if path.is_empty() || path.iter().any(|s| s.is_empty()) {
        return Err(unknown());
    }
    lookup(&template(key), path).map(|_| ()).ok_or_else(unknown)
}

/// Protocol default for a (possibly nested) field
pub fn default_at(key: SectionKey, path: &[&str]) -> Value {
    lookup(&template(key), path).cloned().unwrap_or(Value::Null)
}

/// Canonical value of a radio section, if the device has reported it
pub fn radio_value(cfg: &RadioConfig, s: RadioSection) -> Option<Value> {
    match s {
        RadioSection::Device => cfg.device.as_ref().map(to_json),
        RadioSection::Position => cfg.position.as_ref().map(to_json),
        RadioSection::Power => cfg.power.as_ref().map(to_json),
        RadioSection::Network => cfg.network.as_ref().map(to_json),
        RadioSection::Display => cfg.display.as_ref().map(to_json),
        RadioSection::Lora => cfg.lora.as_ref().map(to_json),
        RadioSection::Bluetooth => cfg.bluetooth.as_ref().map(to_json),
    }
}

pub fn module_value(cfg: &ModuleConfigSet, s: ModuleSection) -> Option<Value> {
    match s {
        ModuleSection::Mqtt => cfg.mqtt.as_ref().map(to_json),
        ModuleSection::Serial => cfg.serial.as_ref().map(to_json),
        ModuleSection::ExternalNotification => cfg.external_notification.as_ref().map(to_json),
        ModuleSection::StoreForward => cfg.store_forward.as_ref().map(to_json),
        ModuleSection::RangeTest => cfg.range_test.as_ref().map(to_json),
        ModuleSection::Telemetry => cfg.telemetry.as_ref().map(to_json),
        ModuleSection::CannedMessage => cfg.canned_message.as_ref().map(to_json),
        ModuleSection::RemoteHardware => cfg.remote_hardware.as_ref().map(to_json),
    }
}

fn typed<T: serde::de::DeserializeOwned>(key: SectionKey, merged: Value) -> Result<T, CommitError> {
    serde_json::from_value(merged).map_err(|e| CommitError::InvalidEdit(format!("{}: {}", key, e)))
}

/// Build the admin write that replaces `key` on the device with `merged`.
pub fn build_write(key: SectionKey, merged: Value) -> Result<proto::AdminMessage, CommitError> {
    let payload = match key {
        SectionKey::Radio(r) => {
            use config::PayloadVariant as V;
            let variant = match r {
                RadioSection::Device => V::Device(typed(key, merged)?),
                RadioSection::Position => V::Position(typed(key, merged)?),
                RadioSection::Power => V::Power(typed(key, merged)?),
                RadioSection::Network => V::Network(typed(key, merged)?),
                RadioSection::Display => V::Display(typed(key, merged)?),
                RadioSection::Lora => V::Lora(typed(key, merged)?),
                RadioSection::Bluetooth => V::Bluetooth(typed(key, merged)?),
            };
            AdminPayload::SetConfig(proto::Config {
                payload_variant: Some(variant),
            })
        }
        SectionKey::Module(m) => {
            use module_config::PayloadVariant as V;
            let variant = match m {
                ModuleSection::Mqtt => V::Mqtt(typed(key, merged)?),
                ModuleSection::Serial => V::Serial(typed(key, merged)?),
                ModuleSection::ExternalNotification => V::ExternalNotification(typed(key, merged)?),
                ModuleSection::StoreForward => V::StoreForward(typed(key, merged)?),
                ModuleSection::RangeTest => V::RangeTest(typed(key, merged)?),
                ModuleSection::Telemetry => V::Telemetry(typed(key, merged)?),
                ModuleSection::CannedMessage => V::CannedMessage(typed(key, merged)?),
                ModuleSection::RemoteHardware => V::RemoteHardware(typed(key, merged)?),
            };
            AdminPayload::SetModuleConfig(proto::ModuleConfig {
                payload_variant: Some(variant),
            })
        }
        SectionKey::Channel(i) => {
            let mut channel: proto::Channel = typed(key, merged)?;
            // The slot is addressed by the key, not by whatever the record claims
            channel.index = i as i32;
            AdminPayload::SetChannel(channel)
        }
    };
    Ok(proto::AdminMessage {
        payload_variant: Some(payload),
    })
}

/// Admin request asking the device to report its stored value of `key`.
pub fn build_read(key: SectionKey) -> proto::AdminMessage {
    let payload = match key {
        SectionKey::Radio(r) => AdminPayload::GetConfigRequest(r.config_type() as i32),
        SectionKey::Module(m) => AdminPayload::GetModuleConfigRequest(m.config_type() as i32),
        SectionKey::Channel(i) => AdminPayload::GetChannelRequest(i as u32 + 1),
    };
    proto::AdminMessage {
        payload_variant: Some(payload),
    }
}

pub fn admin(payload: AdminPayload) -> proto::AdminMessage {
    proto::AdminMessage {
        payload_variant: Some(payload),
    }
}
