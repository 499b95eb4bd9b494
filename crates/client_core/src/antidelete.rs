use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::domain::{InboundMessage, Jid, MessageUpdate, OutgoingMessage, RelayOptions};
use storage::SharedState;
use tracing::{debug, warn};

use crate::{message_store::MessageStore, router::UpdateHandler, session::Session};

/// Re-posts messages deleted for everyone in groups that opted in through their
/// `antidelete` setting.
pub struct AntiDelete {
    state: SharedState,
    store: Arc<MessageStore>,
}

impl AntiDelete {
    pub fn new(state: SharedState, store: Arc<MessageStore>) -> Self {
        Self { state, store }
    }

    async fn restore(&self, session: &Session, update: &MessageUpdate) -> Result<()> {
        let chat = &update.key.remote_jid;
        if !self.state.read().await.antidelete_enabled(chat) {
            return Ok(());
        }
        let Some(original) = self.store.load(chat, &update.key.id) else {
            debug!(%chat, id = %update.key.id, "revoked message not in store");
            return Ok(());
        };
        let Some(content) = original.content.clone() else {
            return Ok(());
        };

        let account = session.account().map(|account| account.id);
        let Some(sender) = revoked_by(&original, account.as_ref()) else {
            return Ok(());
        };
        if account.as_ref().is_some_and(|own| sender.same_user(own)) {
            return Ok(());
        }

        let notice = OutgoingMessage::Text {
            text: deletion_notice(&sender, Utc::now(), &content.short_kind()),
            mentions: vec![sender.clone()],
        };
        let _ = session.send(chat.clone(), notice).await;
        session
            .relay(
                chat,
                &content,
                &RelayOptions {
                    message_id: Some(original.key.id.clone()),
                },
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl UpdateHandler for AntiDelete {
    async fn on_updates(&self, session: &Arc<Session>, updates: &[MessageUpdate]) -> Result<()> {
        for update in updates.iter().filter(|update| update.is_revoke()) {
            if let Err(err) = self.restore(session, update).await {
                warn!(
                    chat = %update.key.remote_jid,
                    error = %format!("{err:#}"),
                    "failed to restore deleted message"
                );
            }
        }
        Ok(())
    }
}

fn revoked_by(original: &InboundMessage, account: Option<&Jid>) -> Option<Jid> {
    if original.key.from_me {
        account.cloned()
    } else {
        Some(original.key.author().clone())
    }
}

pub fn deletion_notice(sender: &Jid, deleted_at: DateTime<Utc>, kind: &str) -> String {
    format!(
        "🚫 *DELETED MESSAGE DETECTED* 🚫\n\n*From:* @{}\n*Deleted at:* {}\n*Type:* {}",
        sender.user(),
        deleted_at.format("%Y-%m-%d %H:%M:%S UTC"),
        kind
    )
}
