//! # Edit overlay
//!
//! Sparse, per-section record of the fields a user changed but has not committed yet.
//! Edits never touch the device state store; they are laid over the canonical section only
//! when computing pending counts or building a commit.
//!
//! Merge rules, applied recursively from the section root:
//!
//! | canonical | overlay        | result                               |
//! |-----------|----------------|--------------------------------------|
//! | object    | object         | merge key by key                     |
//! | any       | array          | overlay array replaces wholesale     |
//! | any       | scalar / null  | overlay value wins                   |
//! | any       | cleared        | protocol default for the field       |
//!
//! Edits are last-write-wins. A field set back to its canonical value stays touched but no
//! longer counts as pending.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::bulk::BulkConfigDocument;
use crate::device::sections::{self, ConfigGroup, SectionKey};
use crate::errors::StateError;

/// One field edit
#[derive(Debug, Clone, PartialEq)]
pub enum EditValue {
    Set(Value),
    /// Reset the field to its protocol default
    Cleared,
}

/// Merge `overlay` onto `base` following the rule table above.
pub fn merge_value(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(b), Value::Object(o)) => {
            let mut out = b.clone();
            for (k, v) in o {
                let merged = match b.get(k) {
                    Some(bv) => merge_value(bv, v),
                    None => v.clone(),
                };
                out.insert(k.clone(), merged);
            }
            Value::Object(out)
        }
        (_, o) => o.clone(),
    }
}

/// Accumulated edits for one subtree. `Merge` never holds an object: object edits are split
/// into per-key `Fields` so later edits to sibling keys compose in order.
#[derive(Debug, Clone, PartialEq)]
enum Patch {
    Merge(Value),
    Reset(Value),
    Fields(BTreeMap<String, Patch>),
}

impl Patch {
    fn empty() -> Self {
        Patch::Fields(BTreeMap::new())
    }

    fn apply(&self, base: &Value) -> Value {
        match self {
            Patch::Merge(v) => merge_value(base, v),
            Patch::Reset(d) => d.clone(),
            Patch::Fields(fields) => {
                let mut out = base.as_object().cloned().unwrap_or_default();
                for (k, child) in fields {
                    let cur = out.get(k).cloned().unwrap_or(Value::Null);
                    out.insert(k.clone(), child.apply(&cur));
                }
                Value::Object(out)
            }
        }
    }

    fn render(&self) -> Value {
        match self {
            Patch::Merge(v) | Patch::Reset(v) => v.clone(),
            Patch::Fields(fields) => {
                Value::Object(fields.iter().map(|(k, p)| (k.clone(), p.render())).collect::<Map<_, _>>())
            }
        }
    }

    fn insert(&mut self, path: &[String], leaf: Patch) {
        let Some((head, rest)) = path.split_first() else {
            self.replace_with(leaf);
            return;
        };
        match self {
            Patch::Fields(fields) => {
                fields.entry(head.clone()).or_insert_with(Patch::empty).insert(rest, leaf);
            }
            Patch::Reset(d) => {
                let mut tmp = Patch::empty();
                tmp.insert(path, leaf);
                *d = tmp.apply(d);
            }
            Patch::Merge(x) => {
                // A non-object overlay value ignores the base, so it behaves like a reset
                let x = std::mem::take(x);
                *self = Patch::Reset(x);
                self.insert(path, leaf);
            }
        }
    }

    fn replace_with(&mut self, leaf: Patch) {
        match leaf {
            Patch::Merge(Value::Object(obj)) => match self {
                Patch::Reset(d) => *d = merge_value(d, &Value::Object(obj)),
                _ => {
                    if !matches!(self, Patch::Fields(_)) {
                        *self = Patch::empty();
                    }
                    for (k, v) in obj {
                        self.insert(&[k], Patch::Merge(v));
                    }
                }
            },
            other => *self = other,
        }
    }
}

/// Reject keys inside an object edit that the section does not have.
fn validate_value(key: SectionKey, path: &mut Vec<String>, value: &Value) -> Result<(), StateError> {
    let Value::Object(obj) = value else {
        return Ok(());
    };
    let template = sections::template(key);
    let refs: Vec<&str> = path.iter().map(String::as_str).collect();
    if !matches!(sections::lookup(&template, &refs), Some(Value::Object(_))) {
        // Not a record field; a type mismatch surfaces when the commit is built
        return Ok(());
    }
    for (k, v) in obj {
        path.push(k.clone());
        let refs: Vec<&str> = path.iter().map(String::as_str).collect();
        sections::validate_path(key, &refs)?;
        validate_value(key, path, v)?;
        path.pop();
    }
    Ok(())
}

/// Copy of one section's edits as they stood when a commit was planned
#[derive(Debug, Clone, PartialEq)]
pub struct SectionEdits(Patch);

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EditOverlay {
    sections: BTreeMap<SectionKey, Patch>,
}

impl EditOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an edit of `field` (dotted for nested records, e.g. `settings.name`).
    pub fn set_field(&mut self, key: SectionKey, field: &str, value: EditValue) -> Result<(), StateError> {
        let segments: Vec<&str> = field.split('.').collect();
        sections::validate_path(key, &segments)?;
        let mut path: Vec<String> = segments.iter().map(|s| s.to_string()).collect();
        let leaf = match value {
            EditValue::Set(v) => {
                validate_value(key, &mut path, &v)?;
                Patch::Merge(v)
            }
            EditValue::Cleared => Patch::Reset(sections::default_at(key, &segments)),
        };
        self.sections.entry(key).or_insert_with(Patch::empty).insert(&path, leaf);
        Ok(())
    }

    pub fn clear_section(&mut self, key: SectionKey) {
        self.sections.remove(&key);
    }

    pub fn clear(&mut self) {
        self.sections.clear();
    }

    pub fn section_edits(&self, key: SectionKey) -> Option<SectionEdits> {
        self.sections.get(&key).cloned().map(SectionEdits)
    }

    /// Drop the section's edits only if they are still exactly `committed`. Returns whether
    /// the section was cleared.
    pub fn clear_if_unchanged(&mut self, key: SectionKey, committed: &SectionEdits) -> bool {
        if self.sections.get(&key) != Some(&committed.0) {
            return false;
        }
        self.sections.remove(&key);
        true
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    pub fn is_touched(&self, key: SectionKey) -> bool {
        self.sections.contains_key(&key)
    }

    /// Sections of `group` with at least one edit, in write order
    pub fn touched_sections(&self, group: ConfigGroup) -> Vec<SectionKey> {
        self.sections.keys().copied().filter(|k| k.group() == group).collect()
    }

    /// Top-level fields edited in a section
    pub fn touched_fields(&self, key: SectionKey) -> Vec<String> {
        match self.sections.get(&key) {
            Some(Patch::Fields(fields)) => fields.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// The raw edits of a section as a partial record
    pub fn edits(&self, key: SectionKey) -> Option<Value> {
        self.sections.get(&key).map(Patch::render)
    }

    /// Number of top-level fields whose merged value differs from canonical. `-1` when the
    /// canonical section is unknown.
    pub fn pending_changes(&self, key: SectionKey, canonical: Option<&Value>) -> i64 {
        let Some(canonical) = canonical else {
            return -1;
        };
        let Some(Patch::Fields(fields)) = self.sections.get(&key) else {
            return 0;
        };
        fields
            .iter()
            .filter(|(name, patch)| {
                let current = canonical.get(name.as_str()).cloned().unwrap_or(Value::Null);
                patch.apply(&current) != current
            })
            .count() as i64
    }

    /// Full record to write: canonical with this section's edits merged in.
    pub fn merge_for_commit(&self, key: SectionKey, canonical: &Value) -> Value {
        match self.sections.get(&key) {
            Some(patch) => patch.apply(canonical),
            None => canonical.clone(),
        }
    }

    /// Overlay holding the contents of a bulk config document as edits. Only fields present
    /// in the document become edits.
    pub fn from_document(doc: &BulkConfigDocument) -> Result<Self, StateError> {
        let mut overlay = EditOverlay::new();
        let mut add_section = |key: SectionKey, record: &Map<String, Value>, skip: Option<&str>| {
            for (field, value) in record {
                if Some(field.as_str()) == skip {
                    continue;
                }
                overlay.set_field(key, field, EditValue::Set(value.clone()))?;
            }
            Ok::<(), StateError>(())
        };

        for (group, records) in [(ConfigGroup::Radio, &doc.radio), (ConfigGroup::Module, &doc.module)] {
            let Some(records) = records else { continue };
            for (name, record) in records {
                let key: SectionKey = name.parse()?;
                if key.group() != group {
                    return Err(StateError::UnknownSection(format!("{}.{}", group, name)));
                }
                let record = record.as_object().ok_or_else(|| StateError::UnknownField {
                    section: name.clone(),
                    field: "<not an object>".to_string(),
                })?;
                add_section(key, record, None)?;
            }
        }

        if let Some(channels) = &doc.channels {
            for entry in channels {
                let bad = |field: &str| StateError::UnknownField {
                    section: "channels".to_string(),
                    field: field.to_string(),
                };
                let record = entry.as_object().ok_or_else(|| bad("<not an object>"))?;
                let index = record.get("index").and_then(Value::as_u64).ok_or_else(|| bad("index"))?;
                let key: SectionKey = format!("channel/{}", index).parse()?;
                add_section(key, record, Some("index"))?;
            }
        }
        Ok(overlay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sections::RadioSection;
    use serde_json::json;

    const LORA: SectionKey = SectionKey::Radio(RadioSection::Lora);

    #[test]
    fn merge_rule_table() {
        let base = json!({ "a": { "x": 1, "y": 2 }, "list": [1, 2, 3], "s": "old" });
        let over = json!({ "a": { "y": 5 }, "list": [9], "s": null });
        assert_eq!(
            merge_value(&base, &over),
            json!({ "a": { "x": 1, "y": 5 }, "list": [9], "s": null })
        );
    }

    #[test]
    fn lora_tx_power_scenario() {
        let canonical = json!({ "txPower": 20, "region": 1, "hopLimit": 3 });
        let mut overlay = EditOverlay::new();
        overlay.set_field(LORA, "txPower", EditValue::Set(json!(27))).unwrap();
        assert_eq!(overlay.pending_changes(LORA, Some(&canonical)), 1);
        overlay.set_field(LORA, "txPower", EditValue::Set(json!(20))).unwrap();
        assert_eq!(overlay.pending_changes(LORA, Some(&canonical)), 0);
        assert!(overlay.is_touched(LORA));
        assert_eq!(overlay.pending_changes(LORA, None), -1);
    }

    #[test]
    fn cleared_uses_protocol_default() {
        let canonical = json!({ "txPower": 20, "region": 1 });
        let mut overlay = EditOverlay::new();
        overlay.set_field(LORA, "txPower", EditValue::Cleared).unwrap();
        let merged = overlay.merge_for_commit(LORA, &canonical);
        assert_eq!(merged["txPower"], 0);
        assert_eq!(merged["region"], 1);
        assert_eq!(overlay.pending_changes(LORA, Some(&canonical)), 1);
    }

    #[test]
    fn nested_edits_compose_last_write_wins() {
        let key = SectionKey::Channel(1);
        let canonical = json!({
            "index": 1,
            "role": 2,
            "settings": { "name": "old", "psk": [1, 2], "uplinkEnabled": true }
        });
        let mut overlay = EditOverlay::new();
        overlay.set_field(key, "settings.name", EditValue::Set(json!("ops"))).unwrap();
        overlay.set_field(key, "settings", EditValue::Set(json!({ "psk": [7] }))).unwrap();
        overlay.set_field(key, "settings.psk", EditValue::Set(json!([8, 9]))).unwrap();
        let merged = overlay.merge_for_commit(key, &canonical);
        assert_eq!(merged["settings"]["name"], "ops");
        assert_eq!(merged["settings"]["psk"], json!([8, 9]));
        assert_eq!(merged["settings"]["uplinkEnabled"], true);
        assert_eq!(merged["role"], 2);
        assert_eq!(overlay.pending_changes(key, Some(&canonical)), 1);
        assert_eq!(overlay.touched_fields(key), vec!["settings".to_string()]);
    }

    #[test]
    fn cleared_record_then_nested_edit() {
        let key = SectionKey::Channel(2);
        let canonical = json!({ "index": 2, "settings": { "name": "old", "uplinkEnabled": true } });
        let mut overlay = EditOverlay::new();
        overlay.set_field(key, "settings", EditValue::Cleared).unwrap();
        overlay.set_field(key, "settings.name", EditValue::Set(json!("fresh"))).unwrap();
        let merged = overlay.merge_for_commit(key, &canonical);
        assert_eq!(merged["settings"]["name"], "fresh");
        assert_eq!(merged["settings"]["uplinkEnabled"], false);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut overlay = EditOverlay::new();
        assert!(matches!(
            overlay.set_field(LORA, "warpFactor", EditValue::Set(json!(9))),
            Err(StateError::UnknownField { .. })
        ));
        assert!(matches!(
            overlay.set_field(SectionKey::Channel(0), "settings", EditValue::Set(json!({ "bogus": 1 }))),
            Err(StateError::UnknownField { .. })
        ));
        assert!(overlay.is_empty());
    }

    #[test]
    fn clear_section_drops_only_that_section() {
        let mut overlay = EditOverlay::new();
        overlay.set_field(LORA, "hopLimit", EditValue::Set(json!(5))).unwrap();
        overlay.set_field(SectionKey::Channel(0), "role", EditValue::Set(json!(1))).unwrap();
        overlay.clear_section(LORA);
        assert_eq!(overlay.pending_changes(LORA, Some(&json!({ "hopLimit": 3 }))), 0);
        assert_eq!(overlay.touched_sections(ConfigGroup::Channel), vec![SectionKey::Channel(0)]);
    }

    #[test]
    fn later_edit_survives_clearing_committed_edits() {
        let mut overlay = EditOverlay::new();
        overlay.set_field(LORA, "txPower", EditValue::Set(json!(20))).unwrap();
        let committed = overlay.section_edits(LORA).unwrap();

        overlay.set_field(LORA, "hopLimit", EditValue::Set(json!(6))).unwrap();
        assert!(!overlay.clear_if_unchanged(LORA, &committed));
        assert_eq!(overlay.edits(LORA), Some(json!({ "hopLimit": 6, "txPower": 20 })));

        let committed = overlay.section_edits(LORA).unwrap();
        assert!(overlay.clear_if_unchanged(LORA, &committed));
        assert!(!overlay.is_touched(LORA));
    }

    #[test]
    fn document_becomes_edits() {
        let doc: BulkConfigDocument = serde_json::from_value(json!({
            "radio": { "lora": { "txPower": 10 } },
            "module": { "mqtt": { "enabled": true } },
            "channels": [ { "index": 1, "settings": { "name": "ops" } } ]
        }))
        .unwrap();
        let overlay = EditOverlay::from_document(&doc).unwrap();
        assert_eq!(overlay.edits(LORA), Some(json!({ "txPower": 10 })));
        assert_eq!(overlay.touched_sections(ConfigGroup::Module).len(), 1);
        assert_eq!(overlay.edits(SectionKey::Channel(1)), Some(json!({ "settings": { "name": "ops" } })));
    }

    #[test]
    fn document_rejects_misplaced_sections() {
        let doc: BulkConfigDocument =
            serde_json::from_value(json!({ "radio": { "mqtt": { "enabled": true } } })).unwrap();
        assert!(EditOverlay::from_document(&doc).is_err());
    }
}
