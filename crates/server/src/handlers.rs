use std::sync::Arc;

use async_trait::async_trait;
use client_core::{MessageHandler, Session};
use shared::domain::{MessagesUpsert, UpsertKind};
use tracing::{debug, info};

const PREVIEW_CHARS: usize = 80;

/// Default inbound handler: records every delivered message as a structured log line.
/// Command interpretation plugs in by replacing this handler.
#[derive(Debug, Default)]
pub struct InboundLog;

#[async_trait]
impl MessageHandler for InboundLog {
    async fn on_messages(&self, session: &Arc<Session>, upsert: &MessagesUpsert) -> anyhow::Result<()> {
        for message in &upsert.messages {
            let Some(content) = message.content.as_ref() else {
                continue;
            };
            if upsert.kind == UpsertKind::Append {
                debug!(chat = %message.key.remote_jid, id = %message.key.id, "history message");
                continue;
            }
            let preview: String = content
                .body
                .as_str()
                .unwrap_or_default()
                .chars()
                .take(PREVIEW_CHARS)
                .collect();
            info!(
                generation = session.generation(),
                chat = %message.key.remote_jid,
                sender = %message.key.author(),
                from_me = message.key.from_me,
                push_name = message.push_name.as_deref().unwrap_or(""),
                kind = %content.short_kind(),
                %preview,
                "message received"
            );
        }
        Ok(())
    }
}
