//! Conversation endpoints used by the messaging views.

use std::sync::Arc;

use shared::{
    domain::ContactId,
    protocol::{ConversationSummary, MessagePayload, SendMessageRequest},
};

use crate::{
    error::ClientError,
    http::{ApiClient, ApiRequest},
};

pub const CONVERSATIONS_PATH: &str = "/conversations";

pub async fn list_conversations(
    api: &Arc<ApiClient>,
) -> Result<Vec<ConversationSummary>, ClientError> {
    api.get_json(CONVERSATIONS_PATH).await
}

pub async fn list_messages(
    api: &Arc<ApiClient>,
    contact_id: ContactId,
) -> Result<Vec<MessagePayload>, ClientError> {
    api.get_json(format!("{CONVERSATIONS_PATH}/{contact_id}/messages"))
        .await
}

pub async fn send_message(
    api: &Arc<ApiClient>,
    contact_id: ContactId,
    body: &str,
) -> Result<MessagePayload, ClientError> {
    let request = ApiRequest::post(format!("{CONVERSATIONS_PATH}/{contact_id}/messages"))
        .json(&SendMessageRequest {
            body: body.to_string(),
        })?;
    api.send_json(request).await
}

pub async fn mark_read(api: &Arc<ApiClient>, contact_id: ContactId) -> Result<(), ClientError> {
    api.send(ApiRequest::patch(format!(
        "{CONVERSATIONS_PATH}/{contact_id}/read"
    )))
    .await?;
    Ok(())
}
