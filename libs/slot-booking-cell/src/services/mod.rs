pub mod redis_pool;
pub mod lock;
pub mod slot_store;
pub mod redis_store;
pub mod lifecycle;
pub mod cache;
pub mod outbox;
pub mod coordinator;
pub mod consistency;

pub use redis_pool::{create_redis_pool, RedisKeys};
pub use lock::*;
pub use slot_store::*;
pub use redis_store::*;
pub use lifecycle::*;
pub use cache::*;
pub use outbox::*;
pub use coordinator::*;
pub use consistency::*;
