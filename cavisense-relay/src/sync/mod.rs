// Module: sync

pub mod broker;
pub mod connection_registry;
pub mod redis_pubsub;
pub mod relay;
pub mod snapshot_store;

pub use broker::{Broker, MemoryBroker, MessageHandler, Subscription};
pub use connection_registry::{BroadcastReport, Connection, ConnectionId, ConnectionRegistry, Frame};
pub use redis_pubsub::RedisBroker;
pub use relay::{FeedState, RelaySettings, SensorRelay};
pub use snapshot_store::{MemorySnapshotStore, RedisSnapshotStore, SnapshotStore};
