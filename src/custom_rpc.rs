//! Registry of user-defined side protocols carried over BTP MESSAGE. When a
//! MESSAGE without an `ilp` part names no built-in protocol, each part with a
//! registered handler is answered with one JSON part of the same name.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use crate::btp::protocol_data::SideData;
use crate::btp::ProtocolData;
use crate::errors::PluginError;

/// Handles one named side protocol. `payload` is the decoded part value
/// (JSON value, text as a string, octets base64url-encoded).
#[async_trait]
pub trait SideProtocolHandler: Send + Sync + 'static {
    async fn handle(&self, protocol: &str, payload: Value) -> Result<Value, PluginError>;
}

#[derive(Default)]
pub struct CustomRpcRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn SideProtocolHandler>>>,
}

impl CustomRpcRegistry {
    pub fn new() -> Self {
        CustomRpcRegistry::default()
    }

    pub fn register(
        &self,
        protocol: &str,
        handler: Arc<dyn SideProtocolHandler>,
    ) -> Result<(), PluginError> {
        let mut handlers = self.handlers.write();
        if handlers.contains_key(protocol) {
            return Err(PluginError::InvalidFields(format!(
                "side protocol {:?} already has a handler",
                protocol
            )));
        }
        handlers.insert(protocol.to_string(), handler);
        Ok(())
    }

    pub fn deregister(&self, protocol: &str) {
        self.handlers.write().remove(protocol);
    }

    /// Answers every requested protocol that has a handler, in request order.
    /// Fails when nothing matches, so the caller can report the side protocol
    /// as unsupported.
    pub async fn dispatch(&self, side: &SideData) -> Result<Vec<ProtocolData>, PluginError> {
        let mut replies = Vec::new();
        for part in &side.map {
            let handler = self.handlers.read().get(&part.name).cloned();
            if let Some(handler) = handler {
                let payload = side.custom.get(&part.name).cloned().unwrap_or(Value::Null);
                let reply = handler.handle(&part.name, payload).await?;
                replies.push(ProtocolData::json(&part.name, &reply));
            }
        }
        if replies.is_empty() {
            return Err(PluginError::NotAccepted(format!(
                "unsupported side protocol {:?}",
                side.primary().map(|part| part.name.as_str()).unwrap_or("")
            )));
        }
        Ok(replies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btp::protocol_data::to_side_data;
    use serde_json::json;

    struct Echo;

    #[async_trait]
    impl SideProtocolHandler for Echo {
        async fn handle(&self, _protocol: &str, payload: Value) -> Result<Value, PluginError> {
            Ok(json!({ "echo": payload }))
        }
    }

    #[tokio::test]
    async fn answers_registered_protocols_only() {
        let registry = CustomRpcRegistry::new();
        registry.register("echo", Arc::new(Echo)).unwrap();
        let side = to_side_data(&[
            ProtocolData::json("echo", &json!(1)),
            ProtocolData::json("other", &json!(2)),
        ])
        .unwrap();
        let replies = registry.dispatch(&side).await.unwrap();
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].name, "echo");
        let value: Value = serde_json::from_slice(&replies[0].data).unwrap();
        assert_eq!(value, json!({ "echo": 1 }));
    }

    #[tokio::test]
    async fn unmatched_messages_are_unsupported() {
        let registry = CustomRpcRegistry::new();
        let side = to_side_data(&[ProtocolData::json("mystery", &json!(null))]).unwrap();
        let err = registry.dispatch(&side).await.unwrap_err();
        assert!(matches!(err, PluginError::NotAccepted(_)));
    }

    #[test]
    fn double_registration_is_refused() {
        let registry = CustomRpcRegistry::new();
        registry.register("echo", Arc::new(Echo)).unwrap();
        assert!(registry.register("echo", Arc::new(Echo)).is_err());
        registry.deregister("echo");
        registry.register("echo", Arc::new(Echo)).unwrap();
    }
}
