//! Outbound channel messaging used by repeaters.

use crate::activity::ChannelActivity;
use crate::error::SendError;
use async_trait::async_trait;
use serenity::all::{ChannelId, CreateMessage, GetMessages, MessageId};
use serenity::http::{Http, HttpError};
use std::sync::Arc;
use tracing::debug;

// Discord JSON error codes.
const UNKNOWN_CHANNEL: isize = 10003;
const UNKNOWN_GUILD: isize = 10004;
const UNKNOWN_MESSAGE: isize = 10008;
const MISSING_ACCESS: isize = 50001;
const MISSING_PERMISSIONS: isize = 50013;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    AlreadyGone,
}

#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Posts `content` and returns the new message id.
    async fn send_message(&self, channel_id: u64, content: &str) -> Result<u64, SendError>;

    async fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<DeleteOutcome, SendError>;

    /// Whether any message newer than `message_id` exists in the channel.
    async fn has_activity_since(&self, channel_id: u64, message_id: u64) -> Result<bool, SendError>;
}

pub struct DiscordSink {
    http: Arc<Http>,
    activity: ChannelActivity,
}

impl DiscordSink {
    pub fn new(http: Arc<Http>, activity: ChannelActivity) -> Self {
        Self { http, activity }
    }
}

#[async_trait]
impl MessageSink for DiscordSink {
    async fn send_message(&self, channel_id: u64, content: &str) -> Result<u64, SendError> {
        let message = ChannelId::new(channel_id)
            .send_message(&self.http, CreateMessage::new().content(content))
            .await
            .map_err(|e| classify(channel_id, &e))?;
        let id = message.id.get();
        self.activity.record(channel_id, id);
        Ok(id)
    }

    async fn delete_message(&self, channel_id: u64, message_id: u64) -> Result<DeleteOutcome, SendError> {
        match ChannelId::new(channel_id)
            .delete_message(&self.http, MessageId::new(message_id))
            .await
        {
            Ok(()) => Ok(DeleteOutcome::Deleted),
            Err(e) if discord_code(&e) == Some(UNKNOWN_MESSAGE) => Ok(DeleteOutcome::AlreadyGone),
            Err(e) => Err(classify(channel_id, &e)),
        }
    }

    async fn has_activity_since(&self, channel_id: u64, message_id: u64) -> Result<bool, SendError> {
        if let Some(active) = self.activity.has_activity_since(channel_id, message_id) {
            return Ok(active);
        }

        debug!("Channel {} not tracked, asking Discord for newer messages", channel_id);
        let newer = ChannelId::new(channel_id)
            .messages(
                &self.http,
                GetMessages::new().after(MessageId::new(message_id)).limit(1),
            )
            .await
            .map_err(|e| classify(channel_id, &e))?;
        if let Some(newest) = newer.first() {
            self.activity.record(channel_id, newest.id.get());
        }
        Ok(!newer.is_empty())
    }
}

fn discord_code(err: &serenity::Error) -> Option<isize> {
    match err {
        serenity::Error::Http(HttpError::UnsuccessfulRequest(resp)) => Some(resp.error.code),
        _ => None,
    }
}

/// Deleted channels and lost permissions will not fix themselves; anything
/// else (rate limits, 5xx, network) is worth another try on the next fire.
fn classify(channel_id: u64, err: &serenity::Error) -> SendError {
    match err {
        serenity::Error::Http(HttpError::UnsuccessfulRequest(resp)) => {
            let status = resp.status_code.as_u16();
            let code = resp.error.code;
            if is_unreachable(status, code) {
                SendError::DestinationUnreachable {
                    channel_id,
                    reason: format!("HTTP {} / code {}: {}", status, code, resp.error.message),
                }
            } else {
                SendError::Transient(format!(
                    "HTTP {} / code {}: {}",
                    status, code, resp.error.message
                ))
            }
        }
        _ => SendError::Transient(err.to_string()),
    }
}

fn is_unreachable(status: u16, code: isize) -> bool {
    matches!(
        code,
        UNKNOWN_CHANNEL | UNKNOWN_GUILD | MISSING_ACCESS | MISSING_PERMISSIONS
    ) || status == 404
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unreachable_classification() {
        assert!(is_unreachable(404, UNKNOWN_CHANNEL));
        assert!(is_unreachable(403, MISSING_ACCESS));
        assert!(is_unreachable(403, MISSING_PERMISSIONS));
        assert!(!is_unreachable(429, 0));
        assert!(!is_unreachable(502, 0));
    }

    #[test]
    fn test_non_http_errors_are_transient() {
        let err = serenity::Error::Other("connection reset");
        assert!(!classify(1, &err).is_unreachable());
    }
}
