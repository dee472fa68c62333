//! Connection lifecycle events delivered by the transport layer.
//!
//! Wire form is JSON, internally tagged by `type`:
//!
//! ```text
//! {"type":"connect",    "pageId":"..", "userId":"..", "sessionId":"<uuid>"}
//! {"type":"disconnect", "pageId":"..", "userId":"..", "sessionId":"<uuid>"}
//! {"type":"destroy",    "pageId":".."}
//! ```
//!
//! Events are parsed and validated once at the boundary; handlers only
//! ever see well-formed values.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EventError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum LifecycleEvent {
    /// A session opened the document.
    Connect {
        page_id: String,
        user_id: String,
        session_id: Uuid,
    },
    /// A session left the document.
    Disconnect {
        page_id: String,
        user_id: String,
        session_id: Uuid,
    },
    /// The engine is discarding the document.
    Destroy { page_id: String },
}

impl LifecycleEvent {
    pub fn connect(page_id: impl Into<String>, user_id: impl Into<String>, session_id: Uuid) -> Self {
        LifecycleEvent::Connect {
            page_id: page_id.into(),
            user_id: user_id.into(),
            session_id,
        }
    }

    pub fn disconnect(page_id: impl Into<String>, user_id: impl Into<String>, session_id: Uuid) -> Self {
        LifecycleEvent::Disconnect {
            page_id: page_id.into(),
            user_id: user_id.into(),
            session_id,
        }
    }

    pub fn destroy(page_id: impl Into<String>) -> Self {
        LifecycleEvent::Destroy {
            page_id: page_id.into(),
        }
    }

    /// Parse and validate a JSON event.
    pub fn from_json(json: &str) -> Result<Self, EventError> {
        let event: Self =
            serde_json::from_str(json).map_err(|e| EventError::Malformed(e.to_string()))?;
        event.validate()?;
        Ok(event)
    }

    /// Required identifiers must be non-empty.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.page_id().trim().is_empty() {
            return Err(EventError::MissingField("pageId"));
        }
        match self {
            LifecycleEvent::Connect { user_id, .. } | LifecycleEvent::Disconnect { user_id, .. }
                if user_id.trim().is_empty() =>
            {
                Err(EventError::MissingField("userId"))
            }
            _ => Ok(()),
        }
    }

    pub fn page_id(&self) -> &str {
        match self {
            LifecycleEvent::Connect { page_id, .. }
            | LifecycleEvent::Disconnect { page_id, .. }
            | LifecycleEvent::Destroy { page_id } => page_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            LifecycleEvent::Connect { .. } => "connect",
            LifecycleEvent::Disconnect { .. } => "disconnect",
            LifecycleEvent::Destroy { .. } => "destroy",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_connect() {
        let session = Uuid::new_v4();
        let json = format!(
            r#"{{"type":"connect","pageId":"p1","userId":"u1","sessionId":"{session}"}}"#
        );
        let event = LifecycleEvent::from_json(&json).unwrap();
        assert_eq!(event, LifecycleEvent::connect("p1", "u1", session));
        assert_eq!(event.kind(), "connect");
        assert_eq!(event.page_id(), "p1");
    }

    #[test]
    fn test_parse_destroy() {
        let event = LifecycleEvent::from_json(r#"{"type":"destroy","pageId":"p1"}"#).unwrap();
        assert_eq!(event, LifecycleEvent::destroy("p1"));
    }

    #[test]
    fn test_serialize_uses_wire_names() {
        let event = LifecycleEvent::disconnect("p1", "u1", Uuid::nil());
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "disconnect");
        assert_eq!(value["pageId"], "p1");
        assert_eq!(value["userId"], "u1");
        assert_eq!(value["sessionId"], Uuid::nil().to_string());
    }

    #[test]
    fn test_malformed_events_rejected() {
        let cases = [
            r#"{"type":"connect","pageId":"p1"}"#,
            r#"{"type":"teleport","pageId":"p1"}"#,
            r#"{"pageId":"p1"}"#,
            r#"{"type":"connect","pageId":"p1","userId":"u1","sessionId":"not-a-uuid"}"#,
            "not json",
        ];
        for case in cases {
            assert!(
                matches!(LifecycleEvent::from_json(case), Err(EventError::Malformed(_))),
                "accepted {case}"
            );
        }
    }

    #[test]
    fn test_empty_ids_rejected() {
        let err = LifecycleEvent::from_json(r#"{"type":"destroy","pageId":" "}"#).unwrap_err();
        assert!(matches!(err, EventError::MissingField("pageId")));

        let err = LifecycleEvent::connect("p1", "", Uuid::new_v4()).validate().unwrap_err();
        assert!(matches!(err, EventError::MissingField("userId")));
    }
}
