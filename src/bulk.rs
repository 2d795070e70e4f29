//! Bulk configuration documents.
//!
//! A document carries any subset of a device's configuration as JSON:
//!
//! ```json
//! {
//!   "radio":    { "lora": { "txPower": 20 }, "device": { "role": 0 } },
//!   "module":   { "mqtt": { "enabled": false } },
//!   "channels": [ { "index": 0, "role": 1, "settings": { "name": "LongFast" } } ]
//! }
//! ```
//!
//! Exports contain the full canonical records the device reported. Imports may be partial:
//! only the fields present become edits (see [`crate::overlay::EditOverlay::from_document`]).

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::device::sections::{ModuleSection, RadioSection, SectionKey};
use crate::device::DeviceSnapshot;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkConfigDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radio: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<Vec<Value>>,
}

impl BulkConfigDocument {
    /// Everything the device has reported so far
    pub fn from_snapshot(snapshot: &DeviceSnapshot) -> Self {
        let radio: Map<String, Value> = RadioSection::ALL
            .into_iter()
            .filter_map(|s| {
                snapshot
                    .section_value(SectionKey::Radio(s))
                    .map(|v| (s.name().to_string(), v))
            })
            .collect();
        let module: Map<String, Value> = ModuleSection::ALL
            .into_iter()
            .filter_map(|s| {
                snapshot
                    .section_value(SectionKey::Module(s))
                    .map(|v| (s.name().to_string(), v))
            })
            .collect();
        let channels: Vec<Value> = (0..snapshot.channels.len() as u8)
            .filter_map(|i| snapshot.section_value(SectionKey::Channel(i)))
            .collect();
        Self {
            radio: (!radio.is_empty()).then_some(radio),
            module: (!module.is_empty()).then_some(module),
            channels: (!channels.is_empty()).then_some(channels),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.radio.as_ref().map_or(true, |m| m.is_empty())
            && self.module.as_ref().map_or(true, |m| m.is_empty())
            && self.channels.as_ref().map_or(true, |c| c.is_empty())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config document {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config document {}", path.display()))
    }

    /// Replace `path` with the document. The bytes go to a sibling `.tmp` file first, which is
    /// removed again if anything fails before the rename.
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = std::path::PathBuf::from(tmp_name);

        let written = serde_json::to_vec_pretty(self)
            .map_err(anyhow::Error::from)
            .and_then(|bytes| {
                let mut file = std::fs::File::create(&tmp_path)?;
                file.write_all(&bytes)?;
                file.sync_all()?;
                std::fs::rename(&tmp_path, path)?;
                Ok(())
            });
        if written.is_err() {
            let _ = std::fs::remove_file(&tmp_path);
        }
        written.with_context(|| format!("Failed to write config document {}", path.display()))
    }
}
