//! Shared protocol definitions for host ↔ applet communication.
//! Keeping this in a dedicated crate allows other embedders (or bindings
//! for non-Rust hosts) to speak the wire protocol without pulling in the
//! runtime half of the SDK.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Milliseconds since the Unix epoch, the timestamp unit every message
/// envelope carries.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// An applet's declared metadata and action catalog, parsed from the
/// `manifest.json` next to its entry document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub short_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub icons: Vec<ManifestIcon>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_url: Option<String>,
    /// Set by applets that need a relaxed sandbox (e.g. third-party embeds).
    /// The host still has to opt in at load time.
    #[serde(default, rename = "unsafe", skip_serializing_if = "std::ops::Not::not")]
    pub allow_unsafe: bool,
    #[serde(default)]
    pub actions: ActionMap,
}

impl Manifest {
    /// Normalizes every declared action in place; see
    /// [`ActionDescriptor::normalize`].
    pub fn normalize(&mut self) {
        for descriptor in self.actions.values_mut() {
            descriptor.normalize();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestIcon {
    pub src: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub purpose: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sizes: Option<String>,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub icon_type: Option<String>,
}

/// Action id → descriptor. Ids are unique within a manifest.
pub type ActionMap = BTreeMap<String, ActionDescriptor>;

/// A named, schema-described operation the host may invoke on an applet.
/// Only the descriptor crosses the wire; handlers stay guest-side.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON schema for the action's arguments. A schema that declares no
    /// properties is normalized to `None` so consumers never have to
    /// special-case an empty-but-present schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

impl ActionDescriptor {
    pub fn normalize(&mut self) {
        if let Some(schema) = &self.parameters {
            if !schema_declares_parameters(schema) {
                self.parameters = None;
            }
        }
    }
}

fn schema_declares_parameters(schema: &Value) -> bool {
    match schema {
        Value::Object(map) => {
            if map.is_empty() {
                return false;
            }
            match map.get("properties") {
                Some(Value::Object(props)) => !props.is_empty(),
                Some(_) => true,
                // `{"type": "object"}` with no properties declares nothing.
                None => !matches!(map.get("type"), Some(Value::String(t)) if t == "object"),
            }
        }
        _ => true,
    }
}

/// Layout size reported by the applet's viewport observer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: f64,
    pub height: f64,
}

/// One wire message. The envelope id is unique per message; replies point
/// back at the message they answer through an explicit `requestId` field in
/// their payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub timestamp: u64,
    #[serde(flatten)]
    pub payload: Payload,
}

impl Message {
    pub fn new(payload: Payload) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: now_ms(),
            payload,
        }
    }

    pub fn kind(&self) -> Kind {
        self.payload.kind()
    }
}

/// The tagged union of message kinds. These shapes are the whole protocol;
/// no other state crosses the host/applet boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Payload {
    /// Applet → host announcement posted before any private channel exists.
    #[serde(rename = "appletconnect")]
    Connect,
    /// Applet → host, once its manifest is loaded: the initial catalog and
    /// data value the host mirrors.
    #[serde(rename = "appletregister")]
    Register {
        manifest: Manifest,
        actions: ActionMap,
        data: Value,
    },
    /// Either direction: a data value push (host → applet requests adoption,
    /// applet → host confirms the authoritative value).
    Data { data: Value },
    /// Applet → host: the action catalog changed after registration.
    Actions { actions: ActionMap },
    /// Applet → host: the applet's layout size changed.
    Resize { dimensions: Dimensions },
    /// Host → applet: invoke an action.
    #[serde(rename_all = "camelCase")]
    Action { action_id: String, arguments: Value },
    /// Applet → host: the action named by `request_id` completed.
    #[serde(rename_all = "camelCase")]
    ActionComplete { request_id: String },
    /// Applet → host: the action named by `request_id` failed.
    #[serde(rename_all = "camelCase")]
    ActionError { request_id: String, message: String },
    /// Either direction: relay-level acknowledgement of a handled message.
    #[serde(rename_all = "camelCase")]
    Response { request_id: String },
}

impl Payload {
    pub fn kind(&self) -> Kind {
        match self {
            Payload::Connect => Kind::Connect,
            Payload::Register { .. } => Kind::Register,
            Payload::Data { .. } => Kind::Data,
            Payload::Actions { .. } => Kind::Actions,
            Payload::Resize { .. } => Kind::Resize,
            Payload::Action { .. } => Kind::Action,
            Payload::ActionComplete { .. } => Kind::ActionComplete,
            Payload::ActionError { .. } => Kind::ActionError,
            Payload::Response { .. } => Kind::Response,
        }
    }
}

/// Message kind, used as the key of the relay's handler table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Kind {
    Connect,
    Register,
    Data,
    Actions,
    Resize,
    Action,
    ActionComplete,
    ActionError,
    Response,
}
