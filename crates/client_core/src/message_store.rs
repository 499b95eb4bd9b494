use std::{
    collections::{HashMap, VecDeque},
    sync::{Mutex, PoisonError},
};

use shared::domain::{InboundMessage, Jid};

pub const DEFAULT_MESSAGES_PER_CHAT: usize = 256;

/// Recent inbound messages per chat, kept so that revoked messages can still be looked up.
#[derive(Debug)]
pub struct MessageStore {
    per_chat: usize,
    chats: Mutex<HashMap<Jid, VecDeque<InboundMessage>>>,
}

impl Default for MessageStore {
    fn default() -> Self {
        Self::new(DEFAULT_MESSAGES_PER_CHAT)
    }
}

impl MessageStore {
    pub fn new(per_chat: usize) -> Self {
        Self {
            per_chat: per_chat.max(1),
            chats: Mutex::new(HashMap::new()),
        }
    }

    pub fn record(&self, message: &InboundMessage) {
        if message.content.is_none() {
            return;
        }
        let mut chats = self.chats.lock().unwrap_or_else(PoisonError::into_inner);
        let chat = chats.entry(message.key.remote_jid.clone()).or_default();
        if let Some(existing) = chat.iter_mut().find(|stored| stored.key.id == message.key.id) {
            *existing = message.clone();
            return;
        }
        chat.push_back(message.clone());
        while chat.len() > self.per_chat {
            chat.pop_front();
        }
    }

    pub fn load(&self, chat: &Jid, message_id: &str) -> Option<InboundMessage> {
        self.chats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(chat)?
            .iter()
            .find(|stored| stored.key.id == message_id)
            .cloned()
    }

    pub fn len(&self, chat: &Jid) -> usize {
        self.chats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(chat)
            .map_or(0, VecDeque::len)
    }
}
