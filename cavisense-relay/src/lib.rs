pub mod sync;
pub mod error;

pub use error::{Error, Result};
pub use sync::{
    Broker, Connection, ConnectionRegistry, FeedState, MemoryBroker, MemorySnapshotStore, RedisBroker,
    RedisSnapshotStore, RelaySettings, SensorRelay, SnapshotStore,
};
