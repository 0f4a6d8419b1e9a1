//! Alert messages and the pluggable delivery contract.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::ids::TimeId;

pub const DEFAULT_ALERT_ENTITY: &str = "tiller";

/// Severity of an alert. Configured per alert plugin: a plugin only receives
/// messages at the levels its config lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Low,
    Medium,
    High,
}

/// One notification. Fire-and-forget once handed to the delivery plugins;
/// the engine keeps a copy for the introspection surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertMessage {
    pub id: TimeId,
    pub title: String,
    pub body: String,
    pub owner: String,
    pub entity: String,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub read: bool,
}

impl AlertMessage {
    pub fn new(
        title: impl Into<String>,
        body: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        AlertMessage {
            id: TimeId::now(),
            title: title.into(),
            body: body.into(),
            owner: owner.into(),
            entity: DEFAULT_ALERT_ENTITY.to_string(),
            link: None,
            read: false,
        }
    }

    pub fn with_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = entity.into();
        self
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }
}

/// A delivery transport (chat webhook, pager, email relay). Failures are
/// logged by the caller and never propagate into the dispatching action.
#[async_trait]
pub trait Alert: Send + Sync {
    fn name(&self) -> String;

    async fn send(&self, message: &AlertMessage) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_fills_defaults() {
        let msg = AlertMessage::new("title", "body", "ops");
        assert_eq!(msg.entity, DEFAULT_ALERT_ENTITY);
        assert!(msg.link.is_none());
        assert!(!msg.read);

        let msg = msg.with_entity("kafka-test").with_link("https://ui/a/1");
        assert_eq!(msg.entity, "kafka-test");
        assert_eq!(msg.link.as_deref(), Some("https://ui/a/1"));
    }

    #[test]
    fn level_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&AlertLevel::Medium).unwrap(),
            "\"medium\""
        );
    }
}
