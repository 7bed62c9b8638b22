// Redis connection lifecycle: key derivation, building, pooling, reclaiming

pub mod builder;
pub mod classifier;
pub mod dial;
pub mod facade;
pub mod handle;
pub mod key;
pub mod reclaimer;
pub mod redis_connection;
pub mod registry;
pub mod ssh_tunnel;
pub mod tls;

pub use builder::{BuilderConfig, ClientBuilder, RedisClientBuilder};
pub use classifier::{classify, redact, FailureKind, FailureRecord};
pub use facade::ConnectionFacade;
pub use handle::{ClientHandle, Connection};
pub use key::ConnectionKey;
pub use reclaimer::{IdleReclaimer, ReclaimerConfig};
pub use redis_connection::RedisConnection;
pub use registry::{ClientRegistry, RegistryConfig};
pub use ssh_tunnel::SshTunnel;
