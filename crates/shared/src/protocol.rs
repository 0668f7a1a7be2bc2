use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{ContactId, MessageDirection, MessageId, UserId};

/// Snapshot of the signed-in user. Replaced wholesale, never patched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: UserId,
    pub name: String,
    pub email: String,
    #[serde(default)]
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignInRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub contact_id: ContactId,
    #[serde(default)]
    pub has_unread: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub id: MessageId,
    pub contact_id: ContactId,
    pub direction: MessageDirection,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub body: String,
}

/// Events pushed over the realtime connection.
///
/// Any `type` this client does not know decodes as `Unknown`, whatever its
/// payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "type",
    content = "payload",
    rename_all = "snake_case",
    try_from = "RawServerEvent"
)]
pub enum ServerEvent {
    #[serde(rename_all = "camelCase")]
    MessageReceived { contact_id: ContactId },
    Unknown,
}

#[derive(Deserialize)]
struct RawServerEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageReceivedPayload {
    contact_id: ContactId,
}

impl TryFrom<RawServerEvent> for ServerEvent {
    type Error = serde_json::Error;

    fn try_from(raw: RawServerEvent) -> Result<Self, Self::Error> {
        match raw.kind.as_str() {
            "message_received" => {
                let payload: MessageReceivedPayload = serde_json::from_value(raw.payload)?;
                Ok(Self::MessageReceived {
                    contact_id: payload.contact_id,
                })
            }
            _ => Ok(Self::Unknown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_received_frame_uses_camel_case_payload() {
        let event: ServerEvent =
            serde_json::from_str(r#"{"type":"message_received","payload":{"contactId":42}}"#)
                .expect("decode");
        assert_eq!(
            event,
            ServerEvent::MessageReceived {
                contact_id: ContactId(42)
            }
        );
    }

    #[test]
    fn unrecognised_event_types_decode_as_unknown() {
        for frame in [
            r#"{"type":"typing_started"}"#,
            r#"{"type":"typing_started","payload":{"contactId":3}}"#,
            r#"{"type":"work_order_updated","payload":[1,2,3]}"#,
            r#"{"type":"presence","payload":null}"#,
        ] {
            let event: ServerEvent = serde_json::from_str(frame).expect("decode");
            assert_eq!(event, ServerEvent::Unknown, "{frame}");
        }
    }

    #[test]
    fn message_received_without_contact_is_rejected() {
        assert!(serde_json::from_str::<ServerEvent>(r#"{"type":"message_received"}"#).is_err());
        assert!(serde_json::from_str::<ServerEvent>(
            r#"{"type":"message_received","payload":{"contactId":"x"}}"#
        )
        .is_err());
    }

    #[test]
    fn identity_reads_camel_case_fields() {
        let identity: Identity = serde_json::from_str(
            r#"{"id":3,"name":"Ana","email":"ana@oficina.test","isAdmin":true,"createdAt":"2024-05-01T12:00:00Z"}"#,
        )
        .expect("decode");
        assert_eq!(identity.id, UserId(3));
        assert!(identity.is_admin);
    }
}
