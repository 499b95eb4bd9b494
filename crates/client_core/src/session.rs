use std::sync::Arc;

use shared::domain::{AccountInfo, GroupMetadata, Jid, MessageContent, OutgoingMessage, RelayOptions};
use tracing::warn;

use crate::{
    dispatch::{DispatchConfig, DispatchQueue, SendHandle},
    group_cache::{GroupCacheConfig, GroupMetadataCache},
    transport::{Connection, TransportError},
};

/// Resources of one connection generation: the live handle plus the send queue and group
/// cache built for it. Handed to message handlers as their send capability.
pub struct Session {
    generation: u64,
    connection: Arc<dyn Connection>,
    dispatch: DispatchQueue,
    groups: GroupMetadataCache,
}

impl Session {
    pub fn new(
        generation: u64,
        connection: Arc<dyn Connection>,
        dispatch: &DispatchConfig,
        groups: &GroupCacheConfig,
    ) -> Self {
        Self {
            generation,
            dispatch: DispatchQueue::new(Arc::clone(&connection), dispatch),
            groups: GroupMetadataCache::new(Arc::clone(&connection), groups),
            connection,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn account(&self) -> Option<AccountInfo> {
        self.connection.account()
    }

    pub fn send(&self, recipient: Jid, message: OutgoingMessage) -> SendHandle {
        self.dispatch.send(recipient, message)
    }

    pub async fn group_metadata(&self, group: &Jid) -> GroupMetadata {
        self.groups.get(group).await
    }

    pub async fn relay(
        &self,
        recipient: &Jid,
        content: &MessageContent,
        options: &RelayOptions,
    ) -> Result<(), TransportError> {
        if self.is_retired() {
            return Err(TransportError::NotConnected);
        }
        self.connection
            .relay_message(recipient, content, options)
            .await
            .inspect_err(|err| warn!(%recipient, error = %err, "relay failed"))
    }

    pub async fn request_pairing_code(&self, phone_number: &str) -> Result<String, TransportError> {
        if self.is_retired() {
            return Err(TransportError::NotConnected);
        }
        self.connection.request_pairing_code(phone_number).await
    }

    pub fn dispatch(&self) -> &DispatchQueue {
        &self.dispatch
    }

    pub fn groups(&self) -> &GroupMetadataCache {
        &self.groups
    }

    /// Ends this generation: queued sends resolve to `None` and the transport is closed.
    pub(crate) fn retire(&self) {
        self.dispatch.retire();
        self.connection.close();
    }

    pub fn is_retired(&self) -> bool {
        self.dispatch.is_retired()
    }
}
