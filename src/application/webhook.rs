use crate::application::reconciler::BackendSelector;
use crate::infrastructure::error::InfraError;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize)]
pub struct IdentityEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: IdentityEventData,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IdentityEventData {
    #[serde(default)]
    pub id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WebhookOutcome {
    Purged { user_id: String },
    Ignored { event_type: String },
}

pub fn parse_event(body: &[u8]) -> Result<IdentityEvent, InfraError> {
    serde_json::from_slice(body)
        .map_err(|error| InfraError::Validation(format!("invalid webhook payload: {error}")))
}

/// Deletes every row of the user on each configured backend. Both backends are
/// attempted; the first error is returned.
pub async fn purge_user_everywhere(
    selector: &BackendSelector,
    user_id: &str,
) -> Result<(), InfraError> {
    let mut first_error = None;
    if let Some(remote) = selector.remote() {
        if let Err(error) = remote.purge_user(user_id).await {
            tracing::error!(user_id, error = %error, "remote purge failed");
            first_error = Some(error);
        }
    }
    if let Err(error) = selector.local().purge_user(user_id).await {
        tracing::error!(user_id, error = %error, "local purge failed");
        first_error.get_or_insert(error);
    }
    match first_error {
        Some(error) => Err(error),
        None => Ok(()),
    }
}

pub async fn handle_event(
    selector: &BackendSelector,
    event: IdentityEvent,
) -> Result<WebhookOutcome, InfraError> {
    if event.event_type != "user.deleted" {
        return Ok(WebhookOutcome::Ignored {
            event_type: event.event_type,
        });
    }
    let user_id = event
        .data
        .id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| InfraError::Validation("user.deleted event without user id".to_string()))?;

    purge_user_everywhere(selector, &user_id).await?;
    tracing::info!(user_id = %user_id, "user data purged after account deletion");
    Ok(WebhookOutcome::Purged { user_id })
}
