use serde::{Deserialize, Serialize};
use serde_json::Value;

use wave_types::UpdateEntry;

use crate::error::{BrokerError, BrokerResult};

/// Well-known event names.
pub mod events {
    /// One store mutation; data is an `UpdateEntry`.
    pub const WAVEOBJ_UPDATE: &str = "waveobj:update";
    pub const BLOCK_CLOSE: &str = "blockclose";
    pub const BLOCK_FILE: &str = "blockfile";
    pub const CONN_CHANGE: &str = "connchange";
    pub const CONTROLLER_STATUS: &str = "controllerstatus";
    pub const CONFIG: &str = "config";
    /// A route was unregistered; scoped to `route:<id>`.
    pub const ROUTE_GONE: &str = "route:gone";
    /// Subscribing to this name receives every event.
    pub const WILDCARD: &str = "*";
}

/// A published event.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WaveEvent {
    pub event: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub data: Value,
}

impl WaveEvent {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            scopes: Vec::new(),
            sender: None,
            data: Value::Null,
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.push(scope.into());
        self
    }

    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    /// The standard notification for one store mutation, scoped to the
    /// mutated object's ORef.
    pub fn for_update(entry: &UpdateEntry) -> serde_json::Result<Self> {
        Ok(Self::new(events::WAVEOBJ_UPDATE)
            .with_scope(entry.oref().to_string())
            .with_data(serde_json::to_value(entry)?))
    }

    /// `true` if any of this event's scopes matches `pattern`.
    pub fn has_scope(&self, pattern: &str) -> bool {
        self.scopes.iter().any(|s| scope_matches(pattern, s))
    }
}

/// `pattern` equals `scope`, or ends in `*` and is a prefix of it.
pub fn scope_matches(pattern: &str, scope: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => scope.starts_with(prefix),
        None => pattern == scope,
    }
}

/// What a route asks to receive.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRequest {
    pub event: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    /// Receive the event regardless of scope, including unscoped events.
    #[serde(default, rename = "allscopes")]
    pub all_scopes: bool,
}

impl SubscriptionRequest {
    pub fn new(event: impl Into<String>) -> Self {
        Self {
            event: event.into(),
            ..Default::default()
        }
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.push(scope.into());
        self
    }

    pub fn all_scopes(mut self) -> Self {
        self.all_scopes = true;
        self
    }

    pub fn validate(&self) -> BrokerResult<()> {
        if self.event.is_empty() {
            return Err(BrokerError::EmptyEventName);
        }
        for scope in &self.scopes {
            let body = scope.strip_suffix('*').unwrap_or(scope);
            if scope.is_empty() || body.contains('*') {
                return Err(BrokerError::InvalidScope(scope.clone()));
            }
        }
        Ok(())
    }

    pub fn matches(&self, event: &WaveEvent) -> bool {
        if self.event != events::WILDCARD && self.event != event.event {
            return false;
        }
        if self.all_scopes {
            return true;
        }
        self.scopes.iter().any(|pattern| event.has_scope(pattern))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wave_types::{Block, ORef, WaveObj};

    #[test]
    fn scope_pattern_matching() {
        assert!(scope_matches("block:B1", "block:B1"));
        assert!(!scope_matches("block:B1", "block:B2"));
        assert!(scope_matches("block:*", "block:B2"));
        assert!(!scope_matches("block:*", "tab:T1"));
        assert!(scope_matches("*", "tab:T1"));
    }

    #[test]
    fn subscription_requires_a_matching_scope() {
        let sub = SubscriptionRequest::new("blockfile").with_scope("block:B1");
        let hit = WaveEvent::new("blockfile").with_scope("block:B1");
        let other_scope = WaveEvent::new("blockfile").with_scope("block:B2");
        let other_name = WaveEvent::new("blockclose").with_scope("block:B1");
        let unscoped = WaveEvent::new("blockfile");
        assert!(sub.matches(&hit));
        assert!(!sub.matches(&other_scope));
        assert!(!sub.matches(&other_name));
        assert!(!sub.matches(&unscoped));
    }

    #[test]
    fn allscopes_and_wildcard_name() {
        let sub = SubscriptionRequest::new(events::WILDCARD).all_scopes();
        assert!(sub.matches(&WaveEvent::new("anything")));
        assert!(sub.matches(&WaveEvent::new("config").with_scope("client:c1")));
    }

    #[test]
    fn validate_rejects_bad_requests() {
        assert_eq!(
            SubscriptionRequest::new("").validate(),
            Err(BrokerError::EmptyEventName)
        );
        assert!(SubscriptionRequest::new("x")
            .with_scope("block:*:x*")
            .validate()
            .is_err());
        assert!(SubscriptionRequest::new("x").with_scope("").validate().is_err());
        assert!(SubscriptionRequest::new("x")
            .with_scope("block:*")
            .validate()
            .is_ok());
    }

    #[test]
    fn update_event_shape() {
        let entry = UpdateEntry::update(WaveObj::Block(Block {
            oid: "b1".into(),
            version: 2,
            ..Default::default()
        }));
        let ev = WaveEvent::for_update(&entry).unwrap();
        assert_eq!(ev.event, events::WAVEOBJ_UPDATE);
        assert_eq!(ev.scopes, vec![ORef::block("b1").to_string()]);
        assert_eq!(ev.data["updatetype"], "update");

        let json = serde_json::to_value(WaveEvent::new("x")).unwrap();
        assert_eq!(json, serde_json::json!({"event": "x"}));
    }
}
