//! Connection supervision for a messaging bot: one live connection at a time, reconnects
//! with backoff, rate-limited per-recipient sends and cached group metadata.

pub mod antidelete;
pub mod backoff;
pub mod dispatch;
pub mod gateway;
pub mod group_cache;
pub mod message_store;
pub mod rate_limiter;
pub mod router;
pub mod session;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use antidelete::AntiDelete;
pub use backoff::Backoff;
pub use dispatch::{DispatchConfig, DispatchQueue, SendHandle};
pub use gateway::{GatewayConnection, GatewayConnector};
pub use group_cache::{GroupCacheConfig, GroupMetadataCache};
pub use message_store::MessageStore;
pub use rate_limiter::RateLimiter;
pub use router::{EventRouter, Handlers, IgnoreUpdates, MessageHandler, UpdateHandler};
pub use session::Session;
pub use supervisor::{ConnectionSupervisor, SupervisorConfig, SupervisorExit};
pub use transport::{Connection, Connector, Established, EventStream, TransportError};
