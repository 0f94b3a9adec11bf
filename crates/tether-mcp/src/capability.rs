//! Capability sets and the method-to-capability guard table.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// A named protocol feature a peer may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Capability {
    Experimental,
    Sampling,
    Roots,
    Elicitation,
    Logging,
    Completions,
    Prompts,
    Resources,
    Tools,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::Experimental => "experimental",
            Capability::Sampling => "sampling",
            Capability::Roots => "roots",
            Capability::Elicitation => "elicitation",
            Capability::Logging => "logging",
            Capability::Completions => "completions",
            Capability::Prompts => "prompts",
            Capability::Resources => "resources",
            Capability::Tools => "tools",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "experimental" => Some(Capability::Experimental),
            "sampling" => Some(Capability::Sampling),
            "roots" => Some(Capability::Roots),
            "elicitation" => Some(Capability::Elicitation),
            "logging" => Some(Capability::Logging),
            "completions" => Some(Capability::Completions),
            "prompts" => Some(Capability::Prompts),
            "resources" => Some(Capability::Resources),
            "tools" => Some(Capability::Tools),
            _ => None,
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Sparse capability set as advertised during `initialize`.
///
/// Stored as a map from feature name to its settings object so features this
/// crate does not know about survive a decode/encode cycle untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Capabilities {
    features: BTreeMap<String, Value>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a capability with an empty settings object.
    pub fn with(mut self, capability: Capability) -> Self {
        self.features
            .entry(capability.as_str().to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        self
    }

    /// Add a capability and set its `listChanged` sub-flag.
    pub fn with_list_changed(mut self, capability: Capability, list_changed: bool) -> Self {
        let entry = self
            .features
            .entry(capability.as_str().to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(Map::new());
        }
        if let Value::Object(settings) = entry {
            settings.insert("listChanged".to_string(), Value::Bool(list_changed));
        }
        self
    }

    /// Add an arbitrary named feature.
    pub fn with_feature(mut self, name: impl Into<String>, settings: Value) -> Self {
        self.features.insert(name.into(), settings);
        self
    }

    pub fn supports(&self, capability: Capability) -> bool {
        self.has_feature(capability.as_str())
    }

    pub fn has_feature(&self, name: &str) -> bool {
        self.features.contains_key(name)
    }

    /// Settings object of a feature.
    pub fn feature(&self, name: &str) -> Option<&Value> {
        self.features.get(name)
    }

    pub fn list_changed(&self, capability: Capability) -> bool {
        self.features
            .get(capability.as_str())
            .and_then(|v| v.get("listChanged"))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Merge `other` into this set; settings objects are merged key by key.
    pub fn merge(&mut self, other: &Capabilities) {
        for (name, settings) in &other.features {
            match (self.features.get_mut(name), settings) {
                (Some(Value::Object(existing)), Value::Object(incoming)) => {
                    for (k, v) in incoming {
                        existing.insert(k.clone(), v.clone());
                    }
                }
                _ => {
                    self.features.insert(name.clone(), settings.clone());
                }
            }
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.features.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }
}

/// Which side of a session a peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn peer(self) -> Role {
        match self {
            Role::Client => Role::Server,
            Role::Server => Role::Client,
        }
    }
}

/// Capability the *receiving* peer must advertise for `sender` to issue the
/// request `method`.
pub fn required_for_request(sender: Role, method: &str) -> Option<Capability> {
    match sender {
        Role::Client => {
            if method.starts_with("tools/") {
                Some(Capability::Tools)
            } else if method.starts_with("resources/") {
                Some(Capability::Resources)
            } else if method.starts_with("prompts/") {
                Some(Capability::Prompts)
            } else if method == "logging/setLevel" {
                Some(Capability::Logging)
            } else if method == "completion/complete" {
                Some(Capability::Completions)
            } else {
                None
            }
        }
        Role::Server => match method {
            "sampling/createMessage" => Some(Capability::Sampling),
            "roots/list" => Some(Capability::Roots),
            "elicitation/create" => Some(Capability::Elicitation),
            _ => None,
        },
    }
}

/// Capability the *sending* peer must itself have registered before it may
/// emit the notification `method`.
pub fn required_for_notification(sender: Role, method: &str) -> Option<Capability> {
    match sender {
        Role::Client => match method {
            "notifications/roots/list_changed" => Some(Capability::Roots),
            _ => None,
        },
        Role::Server => match method {
            "notifications/message" => Some(Capability::Logging),
            "notifications/tools/list_changed" => Some(Capability::Tools),
            "notifications/prompts/list_changed" => Some(Capability::Prompts),
            "notifications/resources/list_changed" | "notifications/resources/updated" => {
                Some(Capability::Resources)
            }
            _ => None,
        },
    }
}

/// Capability `receiver` must have registered locally before it may install a
/// request handler for `method`.
pub fn required_for_handler(receiver: Role, method: &str) -> Option<Capability> {
    required_for_request(receiver.peer(), method)
}

/// Capability `receiver` must have registered locally before it may install a
/// handler for the notification `method` sent by its peer.
pub fn required_for_notification_handler(receiver: Role, method: &str) -> Option<Capability> {
    required_for_notification(receiver.peer(), method)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_capability_parse() {
        for cap in [
            Capability::Experimental,
            Capability::Sampling,
            Capability::Roots,
            Capability::Elicitation,
            Capability::Logging,
            Capability::Completions,
            Capability::Prompts,
            Capability::Resources,
            Capability::Tools,
        ] {
            assert_eq!(Capability::parse(cap.as_str()), Some(cap));
        }
        assert_eq!(Capability::parse("teleport"), None);
    }

    #[test]
    fn test_builder_and_serialization() {
        let caps = Capabilities::new()
            .with(Capability::Logging)
            .with_list_changed(Capability::Tools, true);

        assert!(caps.supports(Capability::Tools));
        assert!(caps.list_changed(Capability::Tools));
        assert!(!caps.list_changed(Capability::Logging));
        assert!(!caps.supports(Capability::Prompts));

        let value = serde_json::to_value(&caps).unwrap();
        assert_eq!(value, json!({"logging": {}, "tools": {"listChanged": true}}));
    }

    #[test]
    fn test_unknown_features_survive() {
        let raw = json!({
            "tools": {},
            "x-vendor-feature": {"level": 3}
        });
        let caps: Capabilities = serde_json::from_value(raw.clone()).unwrap();
        assert!(caps.has_feature("x-vendor-feature"));
        assert_eq!(serde_json::to_value(&caps).unwrap(), raw);
    }

    #[test]
    fn test_merge() {
        let mut caps = Capabilities::new().with(Capability::Tools);
        caps.merge(
            &Capabilities::new()
                .with_list_changed(Capability::Tools, true)
                .with(Capability::Prompts),
        );
        assert!(caps.list_changed(Capability::Tools));
        assert!(caps.supports(Capability::Prompts));
    }

    #[test]
    fn test_request_mapping() {
        assert_eq!(
            required_for_request(Role::Client, "tools/call"),
            Some(Capability::Tools)
        );
        assert_eq!(
            required_for_request(Role::Client, "resources/read"),
            Some(Capability::Resources)
        );
        assert_eq!(
            required_for_request(Role::Client, "completion/complete"),
            Some(Capability::Completions)
        );
        assert_eq!(required_for_request(Role::Client, "ping"), None);
        assert_eq!(
            required_for_request(Role::Server, "sampling/createMessage"),
            Some(Capability::Sampling)
        );
        assert_eq!(required_for_request(Role::Server, "tools/list"), None);
    }

    #[test]
    fn test_notification_and_handler_mapping() {
        assert_eq!(
            required_for_notification(Role::Server, "notifications/message"),
            Some(Capability::Logging)
        );
        assert_eq!(
            required_for_notification(Role::Client, "notifications/roots/list_changed"),
            Some(Capability::Roots)
        );
        assert_eq!(
            required_for_notification(Role::Client, "notifications/initialized"),
            None
        );
        assert_eq!(
            required_for_handler(Role::Server, "tools/list"),
            Some(Capability::Tools)
        );
        assert_eq!(
            required_for_handler(Role::Client, "roots/list"),
            Some(Capability::Roots)
        );
    }
}
