use serde::{Deserialize, Serialize};

use crate::message::ChatMessage;
use crate::options::ChatOptions;
use crate::types::DataSource;

/// Control payload for cancelling an in-flight request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KillSwitch {
    #[serde(alias = "requestId")]
    pub request_id: String,
    pub value: bool,
}

/// Special request shape used to enumerate or fetch a resolved data source
/// through the chat endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceRequest {
    pub id: String,
    #[serde(default)]
    pub op: DataSourceOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DataSourceOp {
    #[default]
    Describe,
    Fetch,
}

/// The inbound event body. A valid body carries messages, a kill switch, or
/// a data-source request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub options: ChatOptions,
    #[serde(default, alias = "dataSources")]
    pub data_sources: Vec<DataSource>,
    #[serde(default, alias = "imageSources")]
    pub image_sources: Vec<DataSource>,
    #[serde(default, alias = "killSwitch", skip_serializing_if = "Option::is_none")]
    pub kill_switch: Option<KillSwitch>,
    #[serde(
        default,
        alias = "datasourceRequest",
        skip_serializing_if = "Option::is_none"
    )]
    pub datasource_request: Option<DataSourceRequest>,
}

impl ChatRequest {
    /// A body is actionable when it carries at least one of the three shapes.
    pub fn is_actionable(&self) -> bool {
        !self.messages.is_empty() || self.kill_switch.is_some() || self.datasource_request.is_some()
    }

    /// The user's last message text, used verbatim as the first RAG query.
    pub fn last_user_text(&self) -> Option<String> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == crate::message::Role::User)
            .map(|m| m.text_content())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ingress_shape_deserializes() {
        let body = serde_json::json!({
            "messages": [{"role": "user", "content": "hello"}],
            "dataSources": [{"id": "s3://u@x.com/a.txt"}],
            "options": {
                "model": {"id": "opus-latest"},
                "requestId": "r1",
                "conversationId": "c1",
            },
        });
        let req: ChatRequest = serde_json::from_value(body).unwrap();
        assert!(req.is_actionable());
        assert_eq!(req.data_sources.len(), 1);
        assert_eq!(req.last_user_text().as_deref(), Some("hello"));
    }

    #[test]
    fn test_kill_switch_shape() {
        let body = serde_json::json!({
            "killSwitch": {"requestId": "r1", "value": true},
        });
        let req: ChatRequest = serde_json::from_value(body).unwrap();
        assert!(req.is_actionable());
        assert!(req.kill_switch.as_ref().unwrap().value);
    }

    #[test]
    fn test_empty_body_not_actionable() {
        let req: ChatRequest = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(!req.is_actionable());
    }
}
