//! Typed model of the N720 edge-report configuration.
//!
//! A report group is one MQTT publishing rule: which link it uses, the
//! topic and QoS, how often it fires, and a template mapping JSON field
//! names to register aliases. Firmware builds disagree on which fields are
//! present, so everything except the name is optional on input.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Top-level edge-report document (`report_group.json` / `edge.json`)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeReportConfig {
    #[serde(default)]
    pub group: Vec<EdgeReportGroup>,
    /// Fields this crate does not model, preserved on round trips
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// One reporting rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EdgeReportGroup {
    pub name: String,
    /// Link channel index
    #[serde(default)]
    pub link: u8,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub qos: u8,
    /// Periodic reporting interval in seconds, 0 disables periodic reports
    #[serde(default)]
    pub period: u32,
    /// Field-to-register-alias template
    #[serde(default)]
    pub content: Map<String, Value>,
}

impl EdgeReportGroup {
    /// A group with no template
    pub fn new(name: impl Into<String>, topic: impl Into<String>, period: u32) -> Self {
        Self {
            name: name.into(),
            link: 1,
            topic: topic.into(),
            qos: 0,
            period,
            content: Map::new(),
        }
    }

    /// Map a JSON field name onto a register alias
    pub fn with_field(mut self, field: impl Into<String>, alias: impl Into<String>) -> Self {
        self.content.insert(field.into(), Value::String(alias.into()));
        self
    }
}

impl EdgeReportConfig {
    /// Look a group up by name
    pub fn find(&self, name: &str) -> Option<&EdgeReportGroup> {
        self.group.iter().find(|g| g.name == name)
    }

    /// Serialise to the compact JSON the firmware stores
    pub fn to_json(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self)
    }
}
